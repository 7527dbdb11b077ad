//! ELF loading and process construction.
//!
//! An ET_DYN image is placed by probing the MMU for a reservation covering
//! the summed span of its PT_LOAD headers (map, then immediately unmap, then
//! map each segment FIXED inside the hole). ET_EXEC maps at its linked
//! addresses. If the image names a PT_INTERP, the interpreter is loaded the
//! same way and its entry point becomes the initial RIP.

use std::path::Path;

use goblin::elf::{program_header, Elf};
use thiserror::Error;
use tracing::debug;

use strato_abi::auxv::{self, AuxVector};
use strato_mmu::{
    page_round_down, page_round_up, page_round_up_checked, MapFlags, MemFault, Mmu, Prot,
    PAGE_SIZE,
};

use crate::thread::Tid;
use crate::{host, Kernel};

const STACK_BASE: u64 = 0x1000_0000;
const STACK_PAGES: u64 = 256;
const HEAP_PAGES: u64 = 64;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed ELF: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("not a 64-bit ELF")]
    NotElf64,
    #[error("ELF type {0:#x} is not ET_EXEC or ET_DYN")]
    BadType(u16),
    #[error("address space exhausted while mapping segments")]
    NoSpace,
    #[error(transparent)]
    Mem(#[from] MemFault),
}

/// Auxiliary-vector ingredients gathered while loading the main program.
#[derive(Debug, Default)]
struct Auxiliary {
    entrypoint: u64,
    phdr: u64,
    phent: u64,
    phnum: u64,
    random: u64,
    platform: u64,
    execfn: u64,
}

enum Loaded {
    Entry(u64),
    Interpreter(String),
}

fn load_elf(
    mmu: &mut Mmu,
    path: &str,
    aux: Option<&mut Auxiliary>,
) -> Result<Loaded, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_owned(),
        source,
    })?;
    let elf = Elf::parse(&bytes)?;
    if !elf.is_64 {
        return Err(LoadError::NotElf64);
    }
    let e_type = elf.header.e_type;
    if e_type != goblin::elf::header::ET_EXEC && e_type != goblin::elf::header::ET_DYN {
        return Err(LoadError::BadType(e_type));
    }

    // ET_EXEC maps where it was linked; ET_DYN gets a reservation big enough
    // for the whole load span.
    let elf_offset = if e_type == goblin::elf::header::ET_EXEC {
        0
    } else {
        let mut min_start = u64::MAX;
        let mut max_end = 0u64;
        for ph in &elf.program_headers {
            if ph.p_type != program_header::PT_LOAD {
                continue;
            }
            let seg_end = ph
                .p_vaddr
                .checked_add(ph.p_memsz)
                .and_then(page_round_up_checked)
                .ok_or(LoadError::NoSpace)?;
            min_start = min_start.min(page_round_down(ph.p_vaddr));
            max_end = max_end.max(seg_end);
        }
        let span = max_end.saturating_sub(min_start);
        if span == 0 {
            0
        } else {
            let probe = mmu
                .mmap(0, span, Prot::empty(), MapFlags::PRIVATE | MapFlags::ANONYMOUS)
                .map_err(|_| LoadError::NoSpace)?;
            let _ = mmu.munmap(probe, span);
            probe
        }
    };

    let entry = elf_offset
        .checked_add(elf.header.e_entry)
        .ok_or(LoadError::NoSpace)?;
    if let Some(aux) = aux {
        let mut first_segment = 0;
        for ph in &elf.program_headers {
            if ph.p_type == program_header::PT_LOAD && ph.p_offset == 0 {
                first_segment = elf_offset.wrapping_add(ph.p_vaddr);
            }
        }
        aux.entrypoint = entry;
        aux.phdr = first_segment.wrapping_add(elf.header.e_phoff);
        aux.phent = elf.header.e_phentsize as u64;
        aux.phnum = elf.header.e_phnum as u64;
    }

    for ph in &elf.program_headers {
        if ph.p_type != program_header::PT_LOAD {
            continue;
        }
        let vaddr = elf_offset
            .checked_add(ph.p_vaddr)
            .ok_or(LoadError::NoSpace)?;
        let start = page_round_down(vaddr);
        let end = vaddr
            .checked_add(ph.p_memsz)
            .and_then(page_round_up_checked)
            .ok_or(LoadError::NoSpace)?;
        let base = mmu
            .mmap(
                start,
                end - start,
                Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
            )
            .map_err(|_| LoadError::NoSpace)?;

        let file_start = ph.p_offset as usize;
        let file_end = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .map(|v| v as usize)
            .filter(|v| *v <= bytes.len())
            .ok_or(LoadError::NoSpace)?;
        if file_end > file_start {
            // Fresh pages are zero-filled, which covers the BSS tail.
            mmu.copy_to_mmu(vaddr, &bytes[file_start..file_end])?;
        }

        let mut prot = Prot::empty();
        if ph.p_flags & program_header::PF_R != 0 {
            prot |= Prot::READ;
        }
        if ph.p_flags & program_header::PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if ph.p_flags & program_header::PF_X != 0 {
            prot |= Prot::EXEC;
        }
        mmu.mprotect(base, end - start, prot)?;
        mmu.set_region_name(base, path);
        mmu.set_region_file(base, path.into(), ph.p_offset);
    }

    if let Some(interp) = elf.interpreter {
        return Ok(Loaded::Interpreter(interp.to_owned()));
    }
    Ok(Loaded::Entry(entry))
}

/// The fixed parts of the address space: AT_RANDOM page, platform-string
/// page, stack, and heap. Returns the initial stack top.
fn setup_memory(mmu: &mut Mmu, aux: &mut Auxiliary) -> Result<u64, LoadError> {
    let random = mmu
        .mmap(
            0,
            PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
        )
        .map_err(|_| LoadError::NoSpace)?;
    mmu.set_region_name(random, "random");
    let seed = host::getrandom(16).unwrap_or_else(|_| vec![0xab; 16]);
    mmu.copy_to_mmu(random, &seed)?;
    mmu.mprotect(random, PAGE_SIZE, Prot::READ)?;
    aux.random = random;

    let platform = mmu
        .mmap(
            0,
            PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
        )
        .map_err(|_| LoadError::NoSpace)?;
    mmu.set_region_name(platform, "platform string");
    mmu.copy_to_mmu(platform, b"x86_64\0")?;
    mmu.mprotect(platform, PAGE_SIZE, Prot::READ)?;
    aux.platform = platform;

    let stack_size = STACK_PAGES * PAGE_SIZE;
    let stack = mmu
        .mmap(
            STACK_BASE,
            stack_size,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .map_err(|_| LoadError::NoSpace)?;
    mmu.set_region_name(stack, "stack");

    let heap_base = stack + stack_size + PAGE_SIZE;
    let heap = mmu
        .mmap(
            heap_base,
            HEAP_PAGES * PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .map_err(|_| LoadError::NoSpace)?;
    mmu.set_region_name(heap, "heap");
    mmu.set_heap(heap, heap + HEAP_PAGES * PAGE_SIZE);

    Ok(stack + stack_size)
}

fn push64(mmu: &mut Mmu, rsp: &mut u64, value: u64) -> Result<(), MemFault> {
    *rsp -= 8;
    mmu.write64(*rsp, value)
}

/// Write argv/envp strings and the auxiliary vector, then lay out the
/// initial stack per the SysV ABI (argc on top, 16-byte aligned).
fn push_program_arguments(
    mmu: &mut Mmu,
    rsp: &mut u64,
    program_path: &str,
    args: &[String],
    envs: &[String],
    aux: &Auxiliary,
) -> Result<(), LoadError> {
    let mut required: u64 = program_path.len() as u64 + 1;
    for arg in args {
        required += arg.len() as u64 + 1;
    }
    for env in envs {
        required += env.len() as u64 + 1;
    }
    required = page_round_up(required);

    let area = mmu
        .mmap(
            0,
            required,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
        )
        .map_err(|_| LoadError::NoSpace)?;
    mmu.set_region_name(area, "program arguments");

    let mut cursor = area;
    let mut write_string = |mmu: &mut Mmu, s: &str| -> Result<u64, MemFault> {
        let at = cursor;
        mmu.copy_to_mmu(at, s.as_bytes())?;
        mmu.write8(at + s.len() as u64, 0)?;
        cursor = at + s.len() as u64 + 1;
        Ok(at)
    };

    let mut positions = Vec::new();
    let execfn = write_string(mmu, program_path)?;
    positions.push(execfn);
    for arg in args {
        positions.push(write_string(mmu, arg)?);
    }
    positions.push(0); // argv[argc]
    for env in envs {
        positions.push(write_string(mmu, env)?);
    }
    positions.push(0); // envp terminator

    let mut auxvec = AuxVector::new();
    auxvec
        .push(auxv::AT_ENTRY, aux.entrypoint)
        .push(auxv::AT_PHDR, aux.phdr)
        .push(auxv::AT_PHENT, aux.phent)
        .push(auxv::AT_PHNUM, aux.phnum)
        .push(auxv::AT_RANDOM, aux.random)
        .push(auxv::AT_PLATFORM, aux.platform)
        .push(auxv::AT_SYSINFO_EHDR, 0)
        .push(auxv::AT_EXECFN, execfn)
        .push(auxv::AT_UID, host::getuid() as u64)
        .push(auxv::AT_GID, host::getgid() as u64)
        .push(auxv::AT_EUID, host::geteuid() as u64)
        .push(auxv::AT_EGID, host::getegid() as u64)
        .push(auxv::AT_SECURE, 0);
    let aux_words = auxvec.into_words();

    // argc + pointer vectors + auxv must leave RSP 16-byte aligned.
    let total_words = aux_words.len() + positions.len() + 1;
    if total_words % 2 == 1 {
        push64(mmu, rsp, 0).map_err(LoadError::Mem)?;
    }
    for word in aux_words.iter().rev() {
        push64(mmu, rsp, *word).map_err(LoadError::Mem)?;
    }
    for position in positions.iter().rev() {
        push64(mmu, rsp, *position).map_err(LoadError::Mem)?;
    }
    push64(mmu, rsp, args.len() as u64 + 1).map_err(LoadError::Mem)?;
    Ok(())
}

/// Build the initial process image and register the main thread. Returns
/// its tid.
pub fn exec(
    kernel: &mut Kernel,
    mmu: &mut Mmu,
    program_path: &str,
    args: &[String],
    envs: &[String],
) -> Result<Tid, LoadError> {
    let mut aux = Auxiliary::default();

    let entry = match load_elf(mmu, program_path, Some(&mut aux))? {
        Loaded::Entry(entry) => entry,
        Loaded::Interpreter(interp) => {
            debug!(interp, "loading dynamic interpreter");
            match load_elf(mmu, &interp, None)? {
                Loaded::Entry(entry) => entry,
                // An interpreter with its own interpreter is not a thing.
                Loaded::Interpreter(_) => return Err(LoadError::BadType(goblin::elf::header::ET_DYN)),
            }
        }
    };

    let stack_top = setup_memory(mmu, &mut aux)?;

    let tid = kernel.sched.allocate_thread();
    let mut rsp = stack_top & 0xffff_ffff_ffff_ff00;
    push_program_arguments(mmu, &mut rsp, program_path, args, envs, &aux)?;
    {
        let thread = kernel.sched.thread_mut(tid);
        thread.saved.rip = entry;
        thread.saved.set_rsp(rsp);
    }
    kernel.sched.add_ready(tid);

    kernel
        .files
        .set_process(kernel.sched.pid(), Path::new(program_path).to_path_buf());
    debug!(program_path, entry, rsp, tid, "process image ready");
    Ok(tid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::io::Write as _;

    /// Hand-assemble a minimal ET_EXEC image: one PT_LOAD mapping the file's
    /// single page at 0x40_0000, entry just past the headers.
    fn tiny_exec_elf(code: &[u8]) -> Vec<u8> {
        let vaddr: u64 = 0x40_0000;
        let code_off: u64 = 0x120;
        let mut image = vec![0u8; code_off as usize + code.len()];
        // e_ident
        image[0..4].copy_from_slice(b"\x7fELF");
        image[4] = 2; // ELFCLASS64
        image[5] = 1; // little endian
        image[6] = 1; // EV_CURRENT
        let w16 = |img: &mut [u8], off: usize, v: u16| img[off..off + 2].copy_from_slice(&v.to_le_bytes());
        let w32 = |img: &mut [u8], off: usize, v: u32| img[off..off + 4].copy_from_slice(&v.to_le_bytes());
        let w64 = |img: &mut [u8], off: usize, v: u64| img[off..off + 8].copy_from_slice(&v.to_le_bytes());
        w16(&mut image, 16, 2); // e_type = ET_EXEC
        w16(&mut image, 18, 0x3e); // e_machine = EM_X86_64
        w32(&mut image, 20, 1); // e_version
        w64(&mut image, 24, vaddr + code_off); // e_entry
        w64(&mut image, 32, 64); // e_phoff
        w16(&mut image, 52, 64); // e_ehsize
        w16(&mut image, 54, 56); // e_phentsize
        w16(&mut image, 56, 1); // e_phnum
        // PT_LOAD
        w32(&mut image, 64, 1); // p_type
        w32(&mut image, 68, 5); // p_flags = R+X
        w64(&mut image, 72, 0); // p_offset
        w64(&mut image, 80, vaddr); // p_vaddr
        w64(&mut image, 88, vaddr); // p_paddr
        let filesz = (code_off as usize + code.len()) as u64;
        w64(&mut image, 96, filesz); // p_filesz
        w64(&mut image, 104, filesz + 0x40); // p_memsz (a bit of BSS)
        w64(&mut image, 112, 0x1000); // p_align
        image[code_off as usize..].copy_from_slice(code);
        image
    }

    #[test]
    fn exec_builds_a_runnable_process_image() {
        let code = [0x90u8, 0x0f, 0x05]; // nop; syscall
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&tiny_exec_elf(&code)).unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let mut kernel = Kernel::new(Config::default());
        let mut mmu = Mmu::new();
        let tid = exec(
            &mut kernel,
            &mut mmu,
            &path,
            &["arg1".to_owned()],
            &["HOME=/tmp".to_owned()],
        )
        .unwrap();

        let thread = kernel.sched.thread(tid);
        assert_eq!(thread.saved.rip, 0x40_0120);
        let rsp = thread.saved.rsp();
        assert_eq!(rsp % 16, 0, "stack must be 16-byte aligned");

        // argc, argv[0] = program path, argv[1] = "arg1", NULL.
        assert_eq!(mmu.read64(rsp).unwrap(), 2);
        let argv0 = mmu.read64(rsp + 8).unwrap();
        assert_eq!(mmu.read_cstring(argv0).unwrap(), path);
        let argv1 = mmu.read64(rsp + 16).unwrap();
        assert_eq!(mmu.read_cstring(argv1).unwrap(), "arg1");
        assert_eq!(mmu.read64(rsp + 24).unwrap(), 0);
        let env0 = mmu.read64(rsp + 32).unwrap();
        assert_eq!(mmu.read_cstring(env0).unwrap(), "HOME=/tmp");
        assert_eq!(mmu.read64(rsp + 40).unwrap(), 0);

        // The auxv follows envp's NULL and terminates with AT_NULL.
        let mut at = rsp + 48;
        let mut entries = std::collections::HashMap::new();
        loop {
            let key = mmu.read64(at).unwrap();
            let value = mmu.read64(at + 8).unwrap();
            if key == auxv::AT_NULL {
                break;
            }
            entries.insert(key, value);
            at += 16;
        }
        assert_eq!(entries[&auxv::AT_ENTRY], 0x40_0120);
        assert_eq!(entries[&auxv::AT_PHNUM], 1);
        assert_eq!(entries[&auxv::AT_PHENT], 56);
        assert_eq!(entries[&auxv::AT_SYSINFO_EHDR], 0);
        let random = entries[&auxv::AT_RANDOM];
        assert!(mmu.read64(random).is_ok());
        assert_eq!(mmu.read_cstring(entries[&auxv::AT_PLATFORM]).unwrap(), "x86_64");

        // The text page is executable and carries the code bytes.
        assert_eq!(mmu.fetch(0x40_0120, 3).unwrap(), code);
        // Heap exists and brk can grow it.
        assert_ne!(mmu.heap_end(), 0);
    }
}
