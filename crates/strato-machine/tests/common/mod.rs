//! Harness for machine-level tests: a tiny code assembler and a machine
//! builder that installs a raw program the way the loader would.

use strato_kernel::{Config, Tid};
use strato_machine::Machine;
use strato_mmu::{MapFlags, Prot};

pub const CODE_BASE: u64 = 0x40_0000;
pub const DATA_BASE: u64 = 0x60_0000;
pub const STACK_BASE: u64 = 0x80_0000;
pub const STACK_SIZE: u64 = 0x10_000;

pub mod reg {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R10: u8 = 10;
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Just enough of an assembler for the scenarios: 32/64-bit immediates,
/// raw bytes, and rel32 branches with labels.
pub struct Asm {
    base: u64,
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Asm {
    pub fn new(base: u64) -> Asm {
        Asm {
            base,
            bytes: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.bytes.len());
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Asm {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// mov r32, imm32 (zero-extends).
    pub fn mov32(&mut self, reg: u8, imm: u32) -> &mut Asm {
        if reg >= 8 {
            self.bytes.push(0x41);
        }
        self.bytes.push(0xB8 + (reg & 7));
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    /// mov r64, imm64.
    pub fn mov64(&mut self, reg: u8, imm: u64) -> &mut Asm {
        self.bytes.push(if reg >= 8 { 0x49 } else { 0x48 });
        self.bytes.push(0xB8 + (reg & 7));
        self.bytes.extend_from_slice(&imm.to_le_bytes());
        self
    }

    pub fn syscall(&mut self) -> &mut Asm {
        self.raw(&[0x0F, 0x05])
    }

    /// jcc rel32 to a label (0x84 = jz, 0x85 = jnz).
    pub fn jcc(&mut self, cc: u8, label: Label) -> &mut Asm {
        self.bytes.extend_from_slice(&[0x0F, cc]);
        self.fixups.push((self.bytes.len(), label));
        self.bytes.extend_from_slice(&[0; 4]);
        self
    }

    /// jmp rel32 to a label.
    pub fn jmp(&mut self, label: Label) -> &mut Asm {
        self.bytes.push(0xE9);
        self.fixups.push((self.bytes.len(), label));
        self.bytes.extend_from_slice(&[0; 4]);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        for (pos, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].expect("unbound label");
            let rel = target as i64 - (pos as i64 + 4);
            self.bytes[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.bytes
    }

    pub fn here(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

/// A machine with code at CODE_BASE (R-X), a data page at DATA_BASE (RW),
/// a stack, and one runnable thread entered at the code base.
pub fn machine_with_program(code: &[u8]) -> (Machine, Tid) {
    let mut machine = Machine::new(Config::default());
    let mmu = machine.mmu_mut();
    mmu.mmap(
        CODE_BASE,
        0x1_0000,
        Prot::READ | Prot::WRITE,
        MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
    )
    .unwrap();
    mmu.copy_to_mmu(CODE_BASE, code).unwrap();
    mmu.mprotect(CODE_BASE, 0x1_0000, Prot::READ | Prot::EXEC).unwrap();

    mmu.mmap(
        DATA_BASE,
        0x1_0000,
        Prot::READ | Prot::WRITE,
        MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
    )
    .unwrap();

    mmu.mmap(
        STACK_BASE,
        STACK_SIZE,
        Prot::READ | Prot::WRITE,
        MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
    )
    .unwrap();

    let tid = machine.kernel_mut().sched.allocate_thread();
    {
        let thread = machine.kernel_mut().sched.thread_mut(tid);
        thread.saved.rip = CODE_BASE;
        thread.saved.set_rsp(STACK_BASE + STACK_SIZE - 0x100);
    }
    machine.kernel_mut().sched.add_ready(tid);
    (machine, tid)
}

/// Map an extra stack for a cloned thread; returns its top.
pub fn map_thread_stack(machine: &mut Machine, base: u64) -> u64 {
    machine
        .mmu_mut()
        .mmap(
            base,
            STACK_SIZE,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .unwrap();
    base + STACK_SIZE - 0x100
}
