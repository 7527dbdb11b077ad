use strato_cpu::{step, CpuState, StepExit};
use strato_mmu::{MapFlags, Mmu, Prot};

pub const CODE_BASE: u64 = 0x1000;
pub const DATA_BASE: u64 = 0x20_0000;
pub const STACK_TOP: u64 = 0x40_0000;

/// A CPU plus a small address space: a page of code, a page of data, and a
/// stack, mirroring what a loaded process gives the interpreter.
pub struct Harness {
    pub state: CpuState,
    pub mmu: Mmu,
}

impl Harness {
    pub fn new(code: &[u8]) -> Harness {
        let mut mmu = Mmu::new();
        mmu.mmap(
            CODE_BASE,
            0x1000,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .unwrap();
        mmu.copy_to_mmu(CODE_BASE, code).unwrap();
        mmu.mprotect(CODE_BASE, 0x1000, Prot::READ | Prot::EXEC).unwrap();
        mmu.mmap(
            DATA_BASE,
            0x10_000,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .unwrap();
        mmu.mmap(
            STACK_TOP - 0x10_000,
            0x10_000,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        )
        .unwrap();

        let mut state = CpuState::new();
        state.rip = CODE_BASE;
        state.set_rsp(STACK_TOP - 0x100);
        Harness { state, mmu }
    }

    /// Execute `n` instructions starting at the current RIP, decoding as we
    /// go. Panics on any fault.
    pub fn steps(&mut self, n: usize) {
        for _ in 0..n {
            self.step_one().unwrap();
        }
    }

    pub fn step_one(&mut self) -> Result<StepExit, strato_cpu::Fault> {
        let bytes = self.mmu.fetch(self.state.rip, 15)?;
        let inst = strato_decoder::decode_one(&bytes, self.state.rip).expect("decode");
        step(&mut self.state, &mut self.mmu, &inst)
    }
}
