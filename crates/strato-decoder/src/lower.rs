//! Lowering from the backend's decoded form into the strato-x86 model.
//!
//! Anything this module has no mapping for becomes `InstKind::Unknown`; the
//! interpreter turns that into a fatal fault only if it is ever executed.

use iced_x86::{Code, Instruction as Raw, MemorySize, Mnemonic, OpKind, Register as IR};
use strato_x86::{
    AluOp, BitOp, Cond, CountOp, ExtOp, Inst, InstKind, MemRef, Operand, Reg, Rep, Seg, ShiftOp,
    SseInst, SseOp, SseOperand, StringOp, UnaryOp, Width, X87Inst, X87Op, X87Operand, MAX_INST_LEN,
};

pub(crate) fn lower(raw: &Raw, ip: u64, raw_bytes: &[u8]) -> Inst {
    let kind = lower_kind(raw).unwrap_or_else(|| {
        let mut bytes = [0u8; MAX_INST_LEN];
        let n = raw_bytes.len().min(MAX_INST_LEN);
        bytes[..n].copy_from_slice(&raw_bytes[..n]);
        InstKind::Unknown { bytes }
    });
    Inst {
        addr: ip,
        len: raw.len() as u8,
        lock: raw.has_lock_prefix(),
        kind,
    }
}

/// Map a general-purpose register to `(full register, width, high-byte)`.
fn gpr(reg: IR) -> Option<(Reg, Width, bool)> {
    use Width::*;
    let m = match reg {
        IR::AL => (Reg::Rax, W8, false),
        IR::CL => (Reg::Rcx, W8, false),
        IR::DL => (Reg::Rdx, W8, false),
        IR::BL => (Reg::Rbx, W8, false),
        IR::AH => (Reg::Rax, W8, true),
        IR::CH => (Reg::Rcx, W8, true),
        IR::DH => (Reg::Rdx, W8, true),
        IR::BH => (Reg::Rbx, W8, true),
        IR::SPL => (Reg::Rsp, W8, false),
        IR::BPL => (Reg::Rbp, W8, false),
        IR::SIL => (Reg::Rsi, W8, false),
        IR::DIL => (Reg::Rdi, W8, false),
        IR::R8L => (Reg::R8, W8, false),
        IR::R9L => (Reg::R9, W8, false),
        IR::R10L => (Reg::R10, W8, false),
        IR::R11L => (Reg::R11, W8, false),
        IR::R12L => (Reg::R12, W8, false),
        IR::R13L => (Reg::R13, W8, false),
        IR::R14L => (Reg::R14, W8, false),
        IR::R15L => (Reg::R15, W8, false),
        IR::AX => (Reg::Rax, W16, false),
        IR::CX => (Reg::Rcx, W16, false),
        IR::DX => (Reg::Rdx, W16, false),
        IR::BX => (Reg::Rbx, W16, false),
        IR::SP => (Reg::Rsp, W16, false),
        IR::BP => (Reg::Rbp, W16, false),
        IR::SI => (Reg::Rsi, W16, false),
        IR::DI => (Reg::Rdi, W16, false),
        IR::R8W => (Reg::R8, W16, false),
        IR::R9W => (Reg::R9, W16, false),
        IR::R10W => (Reg::R10, W16, false),
        IR::R11W => (Reg::R11, W16, false),
        IR::R12W => (Reg::R12, W16, false),
        IR::R13W => (Reg::R13, W16, false),
        IR::R14W => (Reg::R14, W16, false),
        IR::R15W => (Reg::R15, W16, false),
        IR::EAX => (Reg::Rax, W32, false),
        IR::ECX => (Reg::Rcx, W32, false),
        IR::EDX => (Reg::Rdx, W32, false),
        IR::EBX => (Reg::Rbx, W32, false),
        IR::ESP => (Reg::Rsp, W32, false),
        IR::EBP => (Reg::Rbp, W32, false),
        IR::ESI => (Reg::Rsi, W32, false),
        IR::EDI => (Reg::Rdi, W32, false),
        IR::R8D => (Reg::R8, W32, false),
        IR::R9D => (Reg::R9, W32, false),
        IR::R10D => (Reg::R10, W32, false),
        IR::R11D => (Reg::R11, W32, false),
        IR::R12D => (Reg::R12, W32, false),
        IR::R13D => (Reg::R13, W32, false),
        IR::R14D => (Reg::R14, W32, false),
        IR::R15D => (Reg::R15, W32, false),
        IR::RAX => (Reg::Rax, W64, false),
        IR::RCX => (Reg::Rcx, W64, false),
        IR::RDX => (Reg::Rdx, W64, false),
        IR::RBX => (Reg::Rbx, W64, false),
        IR::RSP => (Reg::Rsp, W64, false),
        IR::RBP => (Reg::Rbp, W64, false),
        IR::RSI => (Reg::Rsi, W64, false),
        IR::RDI => (Reg::Rdi, W64, false),
        IR::R8 => (Reg::R8, W64, false),
        IR::R9 => (Reg::R9, W64, false),
        IR::R10 => (Reg::R10, W64, false),
        IR::R11 => (Reg::R11, W64, false),
        IR::R12 => (Reg::R12, W64, false),
        IR::R13 => (Reg::R13, W64, false),
        IR::R14 => (Reg::R14, W64, false),
        IR::R15 => (Reg::R15, W64, false),
        _ => return None,
    };
    Some(m)
}

fn xmm(reg: IR) -> Option<u8> {
    let n = match reg {
        IR::XMM0 => 0,
        IR::XMM1 => 1,
        IR::XMM2 => 2,
        IR::XMM3 => 3,
        IR::XMM4 => 4,
        IR::XMM5 => 5,
        IR::XMM6 => 6,
        IR::XMM7 => 7,
        IR::XMM8 => 8,
        IR::XMM9 => 9,
        IR::XMM10 => 10,
        IR::XMM11 => 11,
        IR::XMM12 => 12,
        IR::XMM13 => 13,
        IR::XMM14 => 14,
        IR::XMM15 => 15,
        _ => return None,
    };
    Some(n)
}

fn st_reg(reg: IR) -> Option<u8> {
    let n = match reg {
        IR::ST0 => 0,
        IR::ST1 => 1,
        IR::ST2 => 2,
        IR::ST3 => 3,
        IR::ST4 => 4,
        IR::ST5 => 5,
        IR::ST6 => 6,
        IR::ST7 => 7,
        _ => return None,
    };
    Some(n)
}

fn mem(raw: &Raw) -> Option<MemRef> {
    let seg = match raw.segment_prefix() {
        IR::FS => Seg::Fs,
        IR::GS => Seg::Gs,
        _ => Seg::None,
    };
    let (base, disp);
    match raw.memory_base() {
        IR::None => {
            base = None;
            disp = raw.memory_displacement64();
        }
        IR::RIP => {
            // iced folds RIP-relative addressing into an absolute target.
            base = None;
            disp = raw.memory_displacement64();
        }
        r => {
            base = Some(gpr(r)?.0);
            disp = raw.memory_displacement64();
        }
    }
    let index = match raw.memory_index() {
        IR::None => None,
        r => Some(gpr(r)?.0),
    };
    Some(MemRef {
        base,
        index,
        scale: raw.memory_index_scale() as u8,
        disp,
        seg,
    })
}

/// Width implied by a memory operand's declared size.
fn mem_width(raw: &Raw) -> Option<Width> {
    let w = match raw.memory_size() {
        MemorySize::UInt8 | MemorySize::Int8 => Width::W8,
        MemorySize::UInt16 | MemorySize::Int16 => Width::W16,
        MemorySize::UInt32 | MemorySize::Int32 => Width::W32,
        MemorySize::UInt64 | MemorySize::Int64 => Width::W64,
        _ => return None,
    };
    Some(w)
}

/// Lower an integer operand (register, memory, or immediate).
fn int_op(raw: &Raw, i: u32) -> Option<Operand> {
    match raw.op_kind(i) {
        OpKind::Register => {
            let (reg, _, high) = gpr(raw.op_register(i))?;
            Some(if high {
                Operand::HighReg(reg)
            } else {
                Operand::Reg(reg)
            })
        }
        OpKind::Memory => Some(Operand::Mem(mem(raw)?)),
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Some(Operand::Imm(raw.immediate(i))),
        _ => None,
    }
}

/// Destination register of a reg-only operand.
fn dst_reg(raw: &Raw, i: u32) -> Option<(Reg, Width)> {
    let (reg, width, high) = gpr(raw.op_register(i))?;
    if high {
        return None;
    }
    Some((reg, width))
}

/// Operation width: from the first register operand, else the memory size.
fn op_width(raw: &Raw) -> Option<Width> {
    for i in 0..raw.op_count() {
        if raw.op_kind(i) == OpKind::Register {
            if let Some((_, w, _)) = gpr(raw.op_register(i)) {
                return Some(w);
            }
        }
    }
    mem_width(raw)
}

fn sse_op(raw: &Raw, i: u32) -> Option<SseOperand> {
    match raw.op_kind(i) {
        OpKind::Register => {
            if let Some(x) = xmm(raw.op_register(i)) {
                Some(SseOperand::Xmm(x))
            } else {
                let (reg, width, high) = gpr(raw.op_register(i))?;
                if high {
                    return None;
                }
                Some(SseOperand::Gpr(reg, width))
            }
        }
        OpKind::Memory => Some(SseOperand::Mem(mem(raw)?)),
        _ => None,
    }
}

fn rep_of(raw: &Raw) -> Rep {
    if raw.has_repne_prefix() {
        Rep::RepNe
    } else if raw.has_rep_prefix() {
        Rep::RepE
    } else {
        Rep::None
    }
}

fn string_inst(op: StringOp, width: Width, raw: &Raw) -> Option<InstKind> {
    Some(InstKind::String {
        op,
        width,
        rep: rep_of(raw),
    })
}

fn alu(raw: &Raw, op: AluOp) -> Option<InstKind> {
    Some(InstKind::Alu {
        op,
        width: op_width(raw)?,
        dst: int_op(raw, 0)?,
        src: int_op(raw, 1)?,
    })
}

fn shift(raw: &Raw, op: ShiftOp) -> Option<InstKind> {
    Some(InstKind::Shift {
        op,
        width: op_width(raw)?,
        dst: int_op(raw, 0)?,
        count: int_op(raw, 1)?,
    })
}

fn unary(raw: &Raw, op: UnaryOp) -> Option<InstKind> {
    Some(InstKind::Unary {
        op,
        width: op_width(raw)?,
        dst: int_op(raw, 0)?,
    })
}

fn bit(raw: &Raw, op: BitOp) -> Option<InstKind> {
    Some(InstKind::Bit {
        op,
        width: op_width(raw)?,
        dst: int_op(raw, 0)?,
        bit: int_op(raw, 1)?,
    })
}

fn setcc(raw: &Raw, cond: Cond) -> Option<InstKind> {
    Some(InstKind::SetCc {
        cond,
        dst: int_op(raw, 0)?,
    })
}

fn cmov(raw: &Raw, cond: Cond) -> Option<InstKind> {
    let (dst, width) = dst_reg(raw, 0)?;
    Some(InstKind::CmovCc {
        cond,
        width,
        dst,
        src: int_op(raw, 1)?,
    })
}

fn jcc(raw: &Raw, cond: Cond) -> Option<InstKind> {
    Some(InstKind::JccRel {
        cond,
        target: raw.near_branch_target(),
    })
}

fn sse2(raw: &Raw, op: SseOp) -> Option<InstKind> {
    let dst = sse_op(raw, 0)?;
    let (src, imm) = if raw.op_count() >= 3 {
        (sse_op(raw, 1)?, Some(raw.immediate(2) as u8))
    } else if raw.op_count() == 2 && raw.op_kind(1) == OpKind::Immediate8 {
        // Shift-by-immediate forms: the register is both source and target.
        (dst, Some(raw.immediate(1) as u8))
    } else if raw.op_count() < 2 {
        // Single-operand forms (stmxcsr/ldmxcsr).
        (dst, None)
    } else {
        (sse_op(raw, 1)?, None)
    };
    let has_mem = raw.op_kind(0) == OpKind::Memory
        || (raw.op_count() > 1 && raw.op_kind(1) == OpKind::Memory);
    let mem_width = if has_mem { mem_width(raw) } else { None };
    Some(InstKind::Sse(SseInst {
        op,
        dst,
        src,
        imm,
        mem_width,
    }))
}

/// x87 memory operand classified by the declared operand size.
fn x87_mem(raw: &Raw) -> Option<X87Operand> {
    let m = mem(raw)?;
    let op = match raw.memory_size() {
        MemorySize::Int16 | MemorySize::UInt16 => X87Operand::M16(m),
        MemorySize::Int32 | MemorySize::UInt32 | MemorySize::Float32 => X87Operand::M32(m),
        MemorySize::Int64 | MemorySize::UInt64 | MemorySize::Float64 => X87Operand::M64(m),
        MemorySize::Float80 => X87Operand::M80(m),
        _ => X87Operand::Image(m),
    };
    Some(op)
}

fn x87_unary(raw: &Raw, op: X87Op) -> Option<InstKind> {
    let operand = if raw.op_count() == 0 {
        None
    } else if raw.op_kind(0) == OpKind::Register {
        Some(X87Operand::St(st_reg(raw.op_register(0))?))
    } else {
        Some(x87_mem(raw)?)
    };
    Some(InstKind::X87(X87Inst {
        op,
        operand,
        st: 0,
    }))
}

/// Two-operand x87 arithmetic: `st(i), st(0)` / `st(0), st(i)` / `st(0), m`.
fn x87_arith(raw: &Raw, op: X87Op) -> Option<InstKind> {
    if raw.op_count() == 0 {
        // The no-operand "p" forms act on st(1), st(0).
        return Some(InstKind::X87(X87Inst {
            op,
            operand: Some(X87Operand::St(0)),
            st: 1,
        }));
    }
    if raw.op_kind(0) == OpKind::Memory {
        return Some(InstKind::X87(X87Inst {
            op,
            operand: Some(x87_mem(raw)?),
            st: 0,
        }));
    }
    let dst = st_reg(raw.op_register(0))?;
    let src = if raw.op_count() > 1 {
        st_reg(raw.op_register(1))?
    } else {
        0
    };
    Some(InstKind::X87(X87Inst {
        op,
        operand: Some(X87Operand::St(src)),
        st: dst,
    }))
}

fn lower_kind(raw: &Raw) -> Option<InstKind> {
    use Mnemonic as M;

    // String instructions share mnemonics with SSE (movsd/cmpsd); classify
    // them by exact code first.
    match raw.code() {
        Code::Movsb_m8_m8 => return string_inst(StringOp::Movs, Width::W8, raw),
        Code::Movsw_m16_m16 => return string_inst(StringOp::Movs, Width::W16, raw),
        Code::Movsd_m32_m32 => return string_inst(StringOp::Movs, Width::W32, raw),
        Code::Movsq_m64_m64 => return string_inst(StringOp::Movs, Width::W64, raw),
        Code::Stosb_m8_AL => return string_inst(StringOp::Stos, Width::W8, raw),
        Code::Stosw_m16_AX => return string_inst(StringOp::Stos, Width::W16, raw),
        Code::Stosd_m32_EAX => return string_inst(StringOp::Stos, Width::W32, raw),
        Code::Stosq_m64_RAX => return string_inst(StringOp::Stos, Width::W64, raw),
        Code::Lodsb_AL_m8 => return string_inst(StringOp::Lods, Width::W8, raw),
        Code::Lodsw_AX_m16 => return string_inst(StringOp::Lods, Width::W16, raw),
        Code::Lodsd_EAX_m32 => return string_inst(StringOp::Lods, Width::W32, raw),
        Code::Lodsq_RAX_m64 => return string_inst(StringOp::Lods, Width::W64, raw),
        Code::Scasb_AL_m8 => return string_inst(StringOp::Scas, Width::W8, raw),
        Code::Scasw_AX_m16 => return string_inst(StringOp::Scas, Width::W16, raw),
        Code::Scasd_EAX_m32 => return string_inst(StringOp::Scas, Width::W32, raw),
        Code::Scasq_RAX_m64 => return string_inst(StringOp::Scas, Width::W64, raw),
        Code::Cmpsb_m8_m8 => return string_inst(StringOp::Cmps, Width::W8, raw),
        Code::Cmpsw_m16_m16 => return string_inst(StringOp::Cmps, Width::W16, raw),
        Code::Cmpsd_m32_m32 => return string_inst(StringOp::Cmps, Width::W32, raw),
        Code::Cmpsq_m64_m64 => return string_inst(StringOp::Cmps, Width::W64, raw),
        _ => {}
    }

    match raw.mnemonic() {
        M::Add => alu(raw, AluOp::Add),
        M::Adc => alu(raw, AluOp::Adc),
        M::Sub => alu(raw, AluOp::Sub),
        M::Sbb => alu(raw, AluOp::Sbb),
        M::And => alu(raw, AluOp::And),
        M::Or => alu(raw, AluOp::Or),
        M::Xor => alu(raw, AluOp::Xor),
        M::Cmp => Some(InstKind::Cmp {
            width: op_width(raw)?,
            a: int_op(raw, 0)?,
            b: int_op(raw, 1)?,
        }),
        M::Test => Some(InstKind::Test {
            width: op_width(raw)?,
            a: int_op(raw, 0)?,
            b: int_op(raw, 1)?,
        }),
        M::Not => unary(raw, UnaryOp::Not),
        M::Neg => unary(raw, UnaryOp::Neg),
        M::Inc => unary(raw, UnaryOp::Inc),
        M::Dec => unary(raw, UnaryOp::Dec),
        M::Mul => Some(InstKind::Mul {
            width: op_width(raw)?,
            src: int_op(raw, 0)?,
        }),
        M::Imul => match raw.op_count() {
            1 => Some(InstKind::Imul1 {
                width: op_width(raw)?,
                src: int_op(raw, 0)?,
            }),
            2 => {
                let (dst, width) = dst_reg(raw, 0)?;
                Some(InstKind::Imul2 {
                    width,
                    dst,
                    src: int_op(raw, 1)?,
                })
            }
            3 => {
                let (dst, width) = dst_reg(raw, 0)?;
                Some(InstKind::Imul3 {
                    width,
                    dst,
                    src: int_op(raw, 1)?,
                    imm: raw.immediate(2),
                })
            }
            _ => None,
        },
        M::Div => Some(InstKind::Div {
            width: op_width(raw)?,
            src: int_op(raw, 0)?,
            signed: false,
        }),
        M::Idiv => Some(InstKind::Div {
            width: op_width(raw)?,
            src: int_op(raw, 0)?,
            signed: true,
        }),
        M::Shl => shift(raw, ShiftOp::Shl),
        M::Shr => shift(raw, ShiftOp::Shr),
        M::Sar => shift(raw, ShiftOp::Sar),
        M::Rol => shift(raw, ShiftOp::Rol),
        M::Ror => shift(raw, ShiftOp::Ror),
        M::Shld => Some(InstKind::ShiftD {
            left: true,
            width: op_width(raw)?,
            dst: int_op(raw, 0)?,
            src: dst_reg(raw, 1)?.0,
            count: int_op(raw, 2)?,
        }),
        M::Shrd => Some(InstKind::ShiftD {
            left: false,
            width: op_width(raw)?,
            dst: int_op(raw, 0)?,
            src: dst_reg(raw, 1)?.0,
            count: int_op(raw, 2)?,
        }),
        M::Mov => Some(InstKind::Mov {
            width: op_width(raw)?,
            dst: int_op(raw, 0)?,
            src: int_op(raw, 1)?,
        }),
        M::Movsx | M::Movsxd => {
            let (dst, dst_width) = dst_reg(raw, 0)?;
            let src = int_op(raw, 1)?;
            let src_width = match raw.op_kind(1) {
                OpKind::Register => gpr(raw.op_register(1))?.1,
                _ => mem_width(raw)?,
            };
            Some(InstKind::MovExt {
                sign: true,
                dst,
                dst_width,
                src,
                src_width,
            })
        }
        M::Movzx => {
            let (dst, dst_width) = dst_reg(raw, 0)?;
            let src = int_op(raw, 1)?;
            let src_width = match raw.op_kind(1) {
                OpKind::Register => gpr(raw.op_register(1))?.1,
                _ => mem_width(raw)?,
            };
            Some(InstKind::MovExt {
                sign: false,
                dst,
                dst_width,
                src,
                src_width,
            })
        }
        M::Lea => {
            let (dst, width) = dst_reg(raw, 0)?;
            Some(InstKind::Lea {
                width,
                dst,
                mem: mem(raw)?,
            })
        }
        M::Push => {
            let width = op_width(raw).unwrap_or(Width::W64);
            Some(InstKind::Push {
                width,
                src: int_op(raw, 0)?,
            })
        }
        M::Pop => Some(InstKind::Pop {
            width: op_width(raw)?,
            dst: int_op(raw, 0)?,
        }),
        M::Xchg => Some(InstKind::Xchg {
            width: op_width(raw)?,
            a: int_op(raw, 0)?,
            b: int_op(raw, 1)?,
        }),
        M::Xadd => Some(InstKind::Xadd {
            width: op_width(raw)?,
            dst: int_op(raw, 0)?,
            src: int_op(raw, 1)?,
        }),
        M::Cmpxchg => Some(InstKind::Cmpxchg {
            width: op_width(raw)?,
            dst: int_op(raw, 0)?,
            src: int_op(raw, 1)?,
        }),
        M::Seto => setcc(raw, Cond::O),
        M::Setno => setcc(raw, Cond::No),
        M::Setb => setcc(raw, Cond::B),
        M::Setae => setcc(raw, Cond::Ae),
        M::Sete => setcc(raw, Cond::E),
        M::Setne => setcc(raw, Cond::Ne),
        M::Setbe => setcc(raw, Cond::Be),
        M::Seta => setcc(raw, Cond::A),
        M::Sets => setcc(raw, Cond::S),
        M::Setns => setcc(raw, Cond::Ns),
        M::Setp => setcc(raw, Cond::P),
        M::Setnp => setcc(raw, Cond::Np),
        M::Setl => setcc(raw, Cond::L),
        M::Setge => setcc(raw, Cond::Ge),
        M::Setle => setcc(raw, Cond::Le),
        M::Setg => setcc(raw, Cond::G),
        M::Cmovo => cmov(raw, Cond::O),
        M::Cmovno => cmov(raw, Cond::No),
        M::Cmovb => cmov(raw, Cond::B),
        M::Cmovae => cmov(raw, Cond::Ae),
        M::Cmove => cmov(raw, Cond::E),
        M::Cmovne => cmov(raw, Cond::Ne),
        M::Cmovbe => cmov(raw, Cond::Be),
        M::Cmova => cmov(raw, Cond::A),
        M::Cmovs => cmov(raw, Cond::S),
        M::Cmovns => cmov(raw, Cond::Ns),
        M::Cmovp => cmov(raw, Cond::P),
        M::Cmovnp => cmov(raw, Cond::Np),
        M::Cmovl => cmov(raw, Cond::L),
        M::Cmovge => cmov(raw, Cond::Ge),
        M::Cmovle => cmov(raw, Cond::Le),
        M::Cmovg => cmov(raw, Cond::G),
        M::Jo => jcc(raw, Cond::O),
        M::Jno => jcc(raw, Cond::No),
        M::Jb => jcc(raw, Cond::B),
        M::Jae => jcc(raw, Cond::Ae),
        M::Je => jcc(raw, Cond::E),
        M::Jne => jcc(raw, Cond::Ne),
        M::Jbe => jcc(raw, Cond::Be),
        M::Ja => jcc(raw, Cond::A),
        M::Js => jcc(raw, Cond::S),
        M::Jns => jcc(raw, Cond::Ns),
        M::Jp => jcc(raw, Cond::P),
        M::Jnp => jcc(raw, Cond::Np),
        M::Jl => jcc(raw, Cond::L),
        M::Jge => jcc(raw, Cond::Ge),
        M::Jle => jcc(raw, Cond::Le),
        M::Jg => jcc(raw, Cond::G),
        M::Jmp => match raw.op_kind(0) {
            OpKind::NearBranch64 | OpKind::NearBranch32 | OpKind::NearBranch16 => {
                Some(InstKind::JmpRel {
                    target: raw.near_branch_target(),
                })
            }
            _ => Some(InstKind::JmpInd {
                src: int_op(raw, 0)?,
            }),
        },
        M::Call => match raw.op_kind(0) {
            OpKind::NearBranch64 | OpKind::NearBranch32 | OpKind::NearBranch16 => {
                Some(InstKind::CallRel {
                    target: raw.near_branch_target(),
                })
            }
            _ => Some(InstKind::CallInd {
                src: int_op(raw, 0)?,
            }),
        },
        M::Ret => {
            let pop = if raw.op_count() > 0 {
                raw.immediate(0) as u16
            } else {
                0
            };
            Some(InstKind::Ret { pop })
        }
        M::Leave => Some(InstKind::Leave),
        M::Nop | M::Fnop | M::Pause | M::Endbr64 => Some(InstKind::Nop),
        M::Mfence | M::Lfence | M::Sfence => Some(InstKind::Nop),
        M::Prefetcht0 | M::Prefetcht1 | M::Prefetcht2 | M::Prefetchnta => Some(InstKind::Nop),
        M::Ud2 => Some(InstKind::Ud2),
        M::Hlt => Some(InstKind::Hlt),
        M::Syscall => Some(InstKind::Syscall),
        M::Cpuid => Some(InstKind::Cpuid),
        M::Rdtsc => Some(InstKind::Rdtsc),
        M::Xgetbv => Some(InstKind::Xgetbv),
        M::Bt => bit(raw, BitOp::Test),
        M::Bts => bit(raw, BitOp::Set),
        M::Btr => bit(raw, BitOp::Reset),
        M::Btc => bit(raw, BitOp::Complement),
        M::Bsf => {
            let (dst, width) = dst_reg(raw, 0)?;
            Some(InstKind::BitScan {
                reverse: false,
                width,
                dst,
                src: int_op(raw, 1)?,
            })
        }
        M::Bsr => {
            let (dst, width) = dst_reg(raw, 0)?;
            Some(InstKind::BitScan {
                reverse: true,
                width,
                dst,
                src: int_op(raw, 1)?,
            })
        }
        M::Popcnt | M::Tzcnt | M::Lzcnt => {
            let (dst, width) = dst_reg(raw, 0)?;
            let op = match raw.mnemonic() {
                M::Popcnt => CountOp::Popcnt,
                M::Tzcnt => CountOp::Tzcnt,
                _ => CountOp::Lzcnt,
            };
            Some(InstKind::Count {
                op,
                width,
                dst,
                src: int_op(raw, 1)?,
            })
        }
        M::Bswap => {
            let (reg, width) = dst_reg(raw, 0)?;
            Some(InstKind::Bswap { width, reg })
        }
        M::Cbw => Some(InstKind::Ext { op: ExtOp::Cbw }),
        M::Cwde => Some(InstKind::Ext { op: ExtOp::Cwde }),
        M::Cdqe => Some(InstKind::Ext { op: ExtOp::Cdqe }),
        M::Cwd => Some(InstKind::Ext { op: ExtOp::Cwd }),
        M::Cdq => Some(InstKind::Ext { op: ExtOp::Cdq }),
        M::Cqo => Some(InstKind::Ext { op: ExtOp::Cqo }),
        M::Cld => Some(InstKind::DirFlag { set: false }),
        M::Std => Some(InstKind::DirFlag { set: true }),
        M::Clc => Some(InstKind::CarryFlag { set: Some(false) }),
        M::Stc => Some(InstKind::CarryFlag { set: Some(true) }),
        M::Cmc => Some(InstKind::CarryFlag { set: None }),

        // SSE family.
        M::Movss => sse2(raw, SseOp::Movss),
        M::Movsd => sse2(raw, SseOp::Movsd),
        M::Movaps | M::Movapd => sse2(raw, SseOp::Movaps),
        M::Movups | M::Movupd => sse2(raw, SseOp::Movups),
        M::Movdqa => sse2(raw, SseOp::Movdqa),
        M::Movdqu => sse2(raw, SseOp::Movdqu),
        M::Movd => sse2(raw, SseOp::Movd),
        M::Movq => sse2(raw, SseOp::Movq),
        M::Movlps | M::Movlpd => sse2(raw, SseOp::Movlps),
        M::Movhps | M::Movhpd => sse2(raw, SseOp::Movhps),
        M::Movmskps => sse2(raw, SseOp::Movmskps),
        M::Movmskpd => sse2(raw, SseOp::Movmskpd),
        M::Pxor => sse2(raw, SseOp::Pxor),
        M::Pand => sse2(raw, SseOp::Pand),
        M::Pandn => sse2(raw, SseOp::Pandn),
        M::Por => sse2(raw, SseOp::Por),
        M::Ptest => sse2(raw, SseOp::Ptest),
        M::Andps => sse2(raw, SseOp::Andps),
        M::Andpd => sse2(raw, SseOp::Andpd),
        M::Andnps => sse2(raw, SseOp::Andnps),
        M::Andnpd => sse2(raw, SseOp::Andnpd),
        M::Orps => sse2(raw, SseOp::Orps),
        M::Orpd => sse2(raw, SseOp::Orpd),
        M::Xorps => sse2(raw, SseOp::Xorps),
        M::Xorpd => sse2(raw, SseOp::Xorpd),
        M::Pcmpeqb => sse2(raw, SseOp::Pcmpeqb),
        M::Pcmpeqw => sse2(raw, SseOp::Pcmpeqw),
        M::Pcmpeqd => sse2(raw, SseOp::Pcmpeqd),
        M::Pcmpeqq => sse2(raw, SseOp::Pcmpeqq),
        M::Pcmpgtb => sse2(raw, SseOp::Pcmpgtb),
        M::Pcmpgtw => sse2(raw, SseOp::Pcmpgtw),
        M::Pcmpgtd => sse2(raw, SseOp::Pcmpgtd),
        M::Pmovmskb => sse2(raw, SseOp::Pmovmskb),
        M::Paddb => sse2(raw, SseOp::Paddb),
        M::Paddw => sse2(raw, SseOp::Paddw),
        M::Paddd => sse2(raw, SseOp::Paddd),
        M::Paddq => sse2(raw, SseOp::Paddq),
        M::Psubb => sse2(raw, SseOp::Psubb),
        M::Psubw => sse2(raw, SseOp::Psubw),
        M::Psubd => sse2(raw, SseOp::Psubd),
        M::Psubq => sse2(raw, SseOp::Psubq),
        M::Pmaxub => sse2(raw, SseOp::Pmaxub),
        M::Pminub => sse2(raw, SseOp::Pminub),
        M::Psllw => sse2(raw, SseOp::Psllw),
        M::Pslld => sse2(raw, SseOp::Pslld),
        M::Psllq => sse2(raw, SseOp::Psllq),
        M::Psrlw => sse2(raw, SseOp::Psrlw),
        M::Psrld => sse2(raw, SseOp::Psrld),
        M::Psrlq => sse2(raw, SseOp::Psrlq),
        M::Pslldq => sse2(raw, SseOp::Pslldq),
        M::Psrldq => sse2(raw, SseOp::Psrldq),
        M::Pshufd => sse2(raw, SseOp::Pshufd),
        M::Pshufb => sse2(raw, SseOp::Pshufb),
        M::Shufps => sse2(raw, SseOp::Shufps),
        M::Shufpd => sse2(raw, SseOp::Shufpd),
        M::Punpcklbw => sse2(raw, SseOp::Punpcklbw),
        M::Punpcklwd => sse2(raw, SseOp::Punpcklwd),
        M::Punpckldq => sse2(raw, SseOp::Punpckldq),
        M::Punpcklqdq => sse2(raw, SseOp::Punpcklqdq),
        M::Punpckhbw => sse2(raw, SseOp::Punpckhbw),
        M::Punpckhwd => sse2(raw, SseOp::Punpckhwd),
        M::Punpckhdq => sse2(raw, SseOp::Punpckhdq),
        M::Punpckhqdq => sse2(raw, SseOp::Punpckhqdq),
        M::Packuswb => sse2(raw, SseOp::Packuswb),
        M::Packusdw => sse2(raw, SseOp::Packusdw),
        M::Packsswb => sse2(raw, SseOp::Packsswb),
        M::Packssdw => sse2(raw, SseOp::Packssdw),
        M::Addss => sse2(raw, SseOp::Addss),
        M::Addsd => sse2(raw, SseOp::Addsd),
        M::Subss => sse2(raw, SseOp::Subss),
        M::Subsd => sse2(raw, SseOp::Subsd),
        M::Mulss => sse2(raw, SseOp::Mulss),
        M::Mulsd => sse2(raw, SseOp::Mulsd),
        M::Divss => sse2(raw, SseOp::Divss),
        M::Divsd => sse2(raw, SseOp::Divsd),
        M::Minss => sse2(raw, SseOp::Minss),
        M::Minsd => sse2(raw, SseOp::Minsd),
        M::Maxss => sse2(raw, SseOp::Maxss),
        M::Maxsd => sse2(raw, SseOp::Maxsd),
        M::Sqrtss => sse2(raw, SseOp::Sqrtss),
        M::Sqrtsd => sse2(raw, SseOp::Sqrtsd),
        M::Comiss => sse2(raw, SseOp::Comiss),
        M::Comisd => sse2(raw, SseOp::Comisd),
        M::Ucomiss => sse2(raw, SseOp::Ucomiss),
        M::Ucomisd => sse2(raw, SseOp::Ucomisd),
        M::Cmpss => sse2(raw, SseOp::Cmpss),
        M::Cmpsd => sse2(raw, SseOp::Cmpsd),
        M::Cvtsi2ss => sse2(raw, SseOp::Cvtsi2ss),
        M::Cvtsi2sd => sse2(raw, SseOp::Cvtsi2sd),
        M::Cvtss2sd => sse2(raw, SseOp::Cvtss2sd),
        M::Cvtsd2ss => sse2(raw, SseOp::Cvtsd2ss),
        M::Cvttss2si => sse2(raw, SseOp::Cvttss2si),
        M::Cvttsd2si => sse2(raw, SseOp::Cvttsd2si),
        M::Cvtss2si => sse2(raw, SseOp::Cvtss2si),
        M::Cvtsd2si => sse2(raw, SseOp::Cvtsd2si),
        M::Stmxcsr => sse2(raw, SseOp::Stmxcsr),
        M::Ldmxcsr => sse2(raw, SseOp::Ldmxcsr),

        // x87 family.
        M::Fld => x87_unary(raw, X87Op::Fld),
        M::Fild => x87_unary(raw, X87Op::Fild),
        M::Fst => x87_unary(raw, X87Op::Fst),
        M::Fstp => x87_unary(raw, X87Op::Fstp),
        M::Fist => x87_unary(raw, X87Op::Fist),
        M::Fistp => x87_unary(raw, X87Op::Fistp),
        M::Fldz => x87_unary(raw, X87Op::Fldz),
        M::Fld1 => x87_unary(raw, X87Op::Fld1),
        M::Fxch => x87_unary(raw, X87Op::Fxch),
        M::Fchs => x87_unary(raw, X87Op::Fchs),
        M::Fabs => x87_unary(raw, X87Op::Fabs),
        M::Fadd => x87_arith(raw, X87Op::Fadd),
        M::Faddp => x87_arith(raw, X87Op::Faddp),
        M::Fsub => x87_arith(raw, X87Op::Fsub),
        M::Fsubp => x87_arith(raw, X87Op::Fsubp),
        M::Fsubr => x87_arith(raw, X87Op::Fsubr),
        M::Fsubrp => x87_arith(raw, X87Op::Fsubrp),
        M::Fmul => x87_arith(raw, X87Op::Fmul),
        M::Fmulp => x87_arith(raw, X87Op::Fmulp),
        M::Fdiv => x87_arith(raw, X87Op::Fdiv),
        M::Fdivp => x87_arith(raw, X87Op::Fdivp),
        M::Fdivr => x87_arith(raw, X87Op::Fdivr),
        M::Fdivrp => x87_arith(raw, X87Op::Fdivrp),
        M::Fcomi => x87_arith(raw, X87Op::Fcomi),
        M::Fcomip => x87_arith(raw, X87Op::Fcomip),
        M::Fucomi => x87_arith(raw, X87Op::Fucomi),
        M::Fucomip => x87_arith(raw, X87Op::Fucomip),
        M::Fcmovb => x87_arith(raw, X87Op::Fcmov(Cond::B)),
        M::Fcmove => x87_arith(raw, X87Op::Fcmov(Cond::E)),
        M::Fcmovbe => x87_arith(raw, X87Op::Fcmov(Cond::Be)),
        M::Fcmovu => x87_arith(raw, X87Op::Fcmov(Cond::P)),
        M::Fcmovnb => x87_arith(raw, X87Op::Fcmov(Cond::Ae)),
        M::Fcmovne => x87_arith(raw, X87Op::Fcmov(Cond::Ne)),
        M::Fcmovnbe => x87_arith(raw, X87Op::Fcmov(Cond::A)),
        M::Fcmovnu => x87_arith(raw, X87Op::Fcmov(Cond::Np)),
        M::Frndint => x87_unary(raw, X87Op::Frndint),
        M::Fnstcw => x87_unary(raw, X87Op::Fnstcw),
        M::Fldcw => x87_unary(raw, X87Op::Fldcw),
        M::Fnstsw => {
            let operand = if raw.op_kind(0) == OpKind::Register {
                Some(X87Operand::Ax)
            } else {
                Some(x87_mem(raw)?)
            };
            Some(InstKind::X87(X87Inst {
                op: X87Op::Fnstsw,
                operand,
                st: 0,
            }))
        }
        M::Fnstenv => x87_unary(raw, X87Op::Fnstenv),
        M::Fldenv => x87_unary(raw, X87Op::Fldenv),
        M::Wait => x87_unary(raw, X87Op::Fwait),
        M::Fxsave => x87_unary(raw, X87Op::Fxsave),
        M::Fxrstor => x87_unary(raw, X87Op::Fxrstor),

        _ => None,
    }
}
