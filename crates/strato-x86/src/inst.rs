//! The decoded-instruction sum type and its operand model.

use crate::reg::{Cond, Reg, Seg, Width};

/// A memory effective address: `[base + index*scale + disp]`, with an
/// optional FS/GS segment contribution. RIP-relative addressing is lowered by
/// the decoder into an absolute displacement with no base register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: u64,
    pub seg: Seg,
}

impl MemRef {
    pub fn absolute(addr: u64) -> MemRef {
        MemRef {
            base: None,
            index: None,
            scale: 1,
            disp: addr,
            seg: Seg::None,
        }
    }
}

/// An integer operand. `HighReg` covers the legacy AH/CH/DH/BH encodings and
/// only appears with byte-width operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    HighReg(Reg),
    Imm(u64),
    Mem(MemRef),
}

impl Operand {
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Inc,
    Dec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

/// bt/bts/btr/btc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountOp {
    Popcnt,
    Tzcnt,
    Lzcnt,
}

/// Accumulator widenings: cbw/cwde/cdqe widen within RAX, cwd/cdq/cqo spill
/// the sign into RDX.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtOp {
    Cbw,
    Cwde,
    Cdqe,
    Cwd,
    Cdq,
    Cqo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Lods,
    Scas,
    Cmps,
}

/// REP prefix state on a string instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rep {
    None,
    /// REP / REPE.
    RepE,
    /// REPNE.
    RepNe,
}

/// Operand of an SSE instruction: an XMM register, a GPR (for movd/movq,
/// pmovmskb, cvt* and friends), or memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseOperand {
    Xmm(u8),
    Gpr(Reg, Width),
    Mem(MemRef),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseOp {
    // Moves.
    Movss,
    Movsd,
    Movaps,
    Movups,
    Movdqa,
    Movdqu,
    Movd,
    Movq,
    Movlps,
    Movhps,
    Movmskpd,
    Movmskps,
    // Packed logic.
    Pxor,
    Pand,
    Pandn,
    Por,
    Ptest,
    Andps,
    Andpd,
    Andnps,
    Andnpd,
    Orps,
    Orpd,
    Xorps,
    Xorpd,
    // Packed compare / extract.
    Pcmpeqb,
    Pcmpeqw,
    Pcmpeqd,
    Pcmpeqq,
    Pcmpgtb,
    Pcmpgtw,
    Pcmpgtd,
    Pmovmskb,
    // Packed arithmetic.
    Paddb,
    Paddw,
    Paddd,
    Paddq,
    Psubb,
    Psubw,
    Psubd,
    Psubq,
    Pmaxub,
    Pminub,
    // Packed shifts (immediate count).
    Psllw,
    Pslld,
    Psllq,
    Psrlw,
    Psrld,
    Psrlq,
    Pslldq,
    Psrldq,
    // Shuffles / packs.
    Pshufd,
    Pshufb,
    Shufps,
    Shufpd,
    Punpcklbw,
    Punpcklwd,
    Punpckldq,
    Punpcklqdq,
    Punpckhbw,
    Punpckhwd,
    Punpckhdq,
    Punpckhqdq,
    Packuswb,
    Packusdw,
    Packsswb,
    Packssdw,
    // Scalar float arithmetic.
    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Divss,
    Divsd,
    Minss,
    Minsd,
    Maxss,
    Maxsd,
    Sqrtss,
    Sqrtsd,
    // Scalar float compare.
    Comiss,
    Comisd,
    Ucomiss,
    Ucomisd,
    Cmpss,
    Cmpsd,
    // Conversions.
    Cvtsi2ss,
    Cvtsi2sd,
    Cvtss2sd,
    Cvtsd2ss,
    Cvttss2si,
    Cvttsd2si,
    Cvtss2si,
    Cvtsd2si,
    // MXCSR.
    Stmxcsr,
    Ldmxcsr,
}

/// An SSE-family instruction after lowering. `imm` carries the immediate of
/// shuffle/compare/shift forms; `mem_width` disambiguates memory source size
/// where the operation cares (movd/movq, integer conversions).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SseInst {
    pub op: SseOp,
    pub dst: SseOperand,
    pub src: SseOperand,
    pub imm: Option<u8>,
    pub mem_width: Option<Width>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum X87Operand {
    St(u8),
    M16(MemRef),
    M32(MemRef),
    M64(MemRef),
    M80(MemRef),
    /// Opaque multi-word image (environment, fxsave area).
    Image(MemRef),
    Ax,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum X87Op {
    Fld,
    Fild,
    Fst,
    Fstp,
    Fist,
    Fistp,
    Fldz,
    Fld1,
    Fxch,
    Fchs,
    Fabs,
    Fadd,
    Faddp,
    Fsub,
    Fsubp,
    Fsubr,
    Fsubrp,
    Fmul,
    Fmulp,
    Fdiv,
    Fdivp,
    Fdivr,
    Fdivrp,
    Fcomi,
    Fcomip,
    Fucomi,
    Fucomip,
    Fcmov(Cond),
    Frndint,
    Fnstcw,
    Fldcw,
    Fnstsw,
    Fnstenv,
    Fldenv,
    Fwait,
    Fxsave,
    Fxrstor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X87Inst {
    pub op: X87Op,
    pub operand: Option<X87Operand>,
    /// Explicit destination-ST index for the two-operand arithmetic forms.
    pub st: u8,
}

/// Everything the interpreter executes. One variant per semantic family; the
/// decoder folds the hundreds of encodings down to these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstKind {
    Alu {
        op: AluOp,
        width: Width,
        dst: Operand,
        src: Operand,
    },
    Cmp {
        width: Width,
        a: Operand,
        b: Operand,
    },
    Test {
        width: Width,
        a: Operand,
        b: Operand,
    },
    Unary {
        op: UnaryOp,
        width: Width,
        dst: Operand,
    },
    /// Unsigned widening multiply into rDX:rAX.
    Mul {
        width: Width,
        src: Operand,
    },
    /// Signed widening multiply into rDX:rAX.
    Imul1 {
        width: Width,
        src: Operand,
    },
    Imul2 {
        width: Width,
        dst: Reg,
        src: Operand,
    },
    Imul3 {
        width: Width,
        dst: Reg,
        src: Operand,
        imm: u64,
    },
    Div {
        width: Width,
        src: Operand,
        signed: bool,
    },
    Shift {
        op: ShiftOp,
        width: Width,
        dst: Operand,
        count: Operand,
    },
    /// shld/shrd.
    ShiftD {
        left: bool,
        width: Width,
        dst: Operand,
        src: Reg,
        count: Operand,
    },
    Mov {
        width: Width,
        dst: Operand,
        src: Operand,
    },
    /// movsx/movzx with distinct source and destination widths.
    MovExt {
        sign: bool,
        dst: Reg,
        dst_width: Width,
        src: Operand,
        src_width: Width,
    },
    Lea {
        width: Width,
        dst: Reg,
        mem: MemRef,
    },
    Push {
        width: Width,
        src: Operand,
    },
    Pop {
        width: Width,
        dst: Operand,
    },
    Xchg {
        width: Width,
        a: Operand,
        b: Operand,
    },
    Xadd {
        width: Width,
        dst: Operand,
        src: Operand,
    },
    Cmpxchg {
        width: Width,
        dst: Operand,
        src: Operand,
    },
    SetCc {
        cond: Cond,
        dst: Operand,
    },
    CmovCc {
        cond: Cond,
        width: Width,
        dst: Reg,
        src: Operand,
    },
    JmpRel {
        target: u64,
    },
    JccRel {
        cond: Cond,
        target: u64,
    },
    JmpInd {
        src: Operand,
    },
    CallRel {
        target: u64,
    },
    CallInd {
        src: Operand,
    },
    Ret {
        pop: u16,
    },
    Leave,
    Nop,
    Ud2,
    Hlt,
    Syscall,
    Cpuid,
    Rdtsc,
    Xgetbv,
    Bit {
        op: BitOp,
        width: Width,
        dst: Operand,
        bit: Operand,
    },
    /// bsf/bsr.
    BitScan {
        reverse: bool,
        width: Width,
        dst: Reg,
        src: Operand,
    },
    Count {
        op: CountOp,
        width: Width,
        dst: Reg,
        src: Operand,
    },
    Bswap {
        width: Width,
        reg: Reg,
    },
    Ext {
        op: ExtOp,
    },
    String {
        op: StringOp,
        width: Width,
        rep: Rep,
    },
    /// cld/std.
    DirFlag {
        set: bool,
    },
    /// clc/stc/cmc: Some(b) sets CF to b, None complements it.
    CarryFlag {
        set: Option<bool>,
    },
    Sse(SseInst),
    X87(X87Inst),
    /// Bytes the decoder could not make sense of. Executing this is a fatal
    /// fault; the raw bytes are kept for the diagnostic.
    Unknown {
        bytes: [u8; 15],
    },
}

/// One decoded instruction: its guest address, encoded length, whether a LOCK
/// prefix was present, and the semantic payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst {
    pub addr: u64,
    pub len: u8,
    pub lock: bool,
    pub kind: InstKind,
}

impl Inst {
    /// Address of the instruction that follows in program order.
    pub fn next_addr(&self) -> u64 {
        self.addr + self.len as u64
    }
}
