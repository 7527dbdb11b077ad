//! Boot a minimal ELF through the loader and run it to completion.

use std::io::Write as _;

use strato_kernel::Config;
use strato_machine::Machine;

/// A minimal ET_EXEC image: one R+X PT_LOAD of the whole file at 0x40_0000,
/// entry right after the headers.
fn tiny_exec_elf(code: &[u8]) -> Vec<u8> {
    let vaddr: u64 = 0x40_0000;
    let code_off: u64 = 0x120;
    let mut image = vec![0u8; code_off as usize + code.len()];
    image[0..4].copy_from_slice(b"\x7fELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little endian
    image[6] = 1; // EV_CURRENT
    let w16 = |img: &mut [u8], off: usize, v: u16| img[off..off + 2].copy_from_slice(&v.to_le_bytes());
    let w32 = |img: &mut [u8], off: usize, v: u32| img[off..off + 4].copy_from_slice(&v.to_le_bytes());
    let w64 = |img: &mut [u8], off: usize, v: u64| img[off..off + 8].copy_from_slice(&v.to_le_bytes());
    w16(&mut image, 16, 2); // ET_EXEC
    w16(&mut image, 18, 0x3e); // EM_X86_64
    w32(&mut image, 20, 1);
    w64(&mut image, 24, vaddr + code_off); // e_entry
    w64(&mut image, 32, 64); // e_phoff
    w16(&mut image, 52, 64); // e_ehsize
    w16(&mut image, 54, 56); // e_phentsize
    w16(&mut image, 56, 1); // e_phnum
    w32(&mut image, 64, 1); // PT_LOAD
    w32(&mut image, 68, 5); // R+X
    w64(&mut image, 72, 0); // p_offset
    w64(&mut image, 80, vaddr);
    w64(&mut image, 88, vaddr);
    let filesz = (code_off as usize + code.len()) as u64;
    w64(&mut image, 96, filesz);
    w64(&mut image, 104, filesz);
    w64(&mut image, 112, 0x1000);
    image[code_off as usize..].copy_from_slice(code);
    image
}

#[test]
fn loaded_elf_runs_and_its_exit_status_comes_back() {
    // xor edi, edi; mov edi, 42; mov eax, 231; syscall
    let code = [
        0x31, 0xFF, // xor edi, edi
        0xBF, 0x2A, 0x00, 0x00, 0x00, // mov edi, 42
        0xB8, 0xE7, 0x00, 0x00, 0x00, // mov eax, 231 (exit_group)
        0x0F, 0x05, // syscall
    ];
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&tiny_exec_elf(&code)).unwrap();
    let path = file.path().to_string_lossy().into_owned();

    let mut machine = Machine::new(Config::default());
    machine.load(&path, &[], &[]).unwrap();
    assert_eq!(machine.run().unwrap(), 42);
}

#[test]
fn argc_and_argv_reach_the_guest() {
    // The guest exits with argc: mov rax, [rsp]; mov edi, eax; mov eax, 231;
    // syscall.
    let code = [
        0x48, 0x8B, 0x04, 0x24, // mov rax, [rsp]
        0x89, 0xC7, // mov edi, eax
        0xB8, 0xE7, 0x00, 0x00, 0x00, // mov eax, 231
        0x0F, 0x05, // syscall
    ];
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&tiny_exec_elf(&code)).unwrap();
    let path = file.path().to_string_lossy().into_owned();

    let mut machine = Machine::new(Config::default());
    machine
        .load(&path, &["a".to_owned(), "b".to_owned(), "c".to_owned()], &[])
        .unwrap();
    // argc = program name + 3 arguments.
    assert_eq!(machine.run().unwrap(), 4);
}
