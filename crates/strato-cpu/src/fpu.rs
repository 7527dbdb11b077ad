//! The floating helper: SSE and x87 execution.
//!
//! Scalar arithmetic goes through host floats, which preserves IEEE
//! semantics for the operations themselves; the x87 stack is modelled with
//! doubles, so the 80-bit extended precision is approximated. The packed
//! integer subset covers what compiled libc string/memory routines lean on.

use strato_mmu::Mmu;
use strato_x86::{MemRef, SseInst, SseOp, SseOperand, Width, X87Inst, X87Op, X87Operand};

use crate::exec::ea;
use crate::fault::Fault;
use crate::state::CpuState;

fn addr_of(state: &CpuState, m: &MemRef) -> u64 {
    ea(state, m)
}

fn read_u128(mmu: &Mmu, addr: u64) -> Result<u128, Fault> {
    Ok(mmu.read128(addr)?)
}

fn src_u128(state: &CpuState, mmu: &Mmu, op: SseOperand) -> Result<u128, Fault> {
    match op {
        SseOperand::Xmm(x) => Ok(state.xmm[x as usize]),
        SseOperand::Gpr(reg, width) => Ok(state.read_reg_w(reg, width) as u128),
        SseOperand::Mem(m) => read_u128(mmu, addr_of(state, &m)),
    }
}

fn src_u64(state: &CpuState, mmu: &Mmu, op: SseOperand) -> Result<u64, Fault> {
    match op {
        SseOperand::Xmm(x) => Ok(state.xmm[x as usize] as u64),
        SseOperand::Gpr(reg, width) => Ok(state.read_reg_w(reg, width)),
        SseOperand::Mem(m) => Ok(mmu.read64(addr_of(state, &m))?),
    }
}

fn src_u32(state: &CpuState, mmu: &Mmu, op: SseOperand) -> Result<u32, Fault> {
    match op {
        SseOperand::Xmm(x) => Ok(state.xmm[x as usize] as u32),
        SseOperand::Gpr(reg, _) => Ok(state.read_reg_w(reg, Width::W32) as u32),
        SseOperand::Mem(m) => Ok(mmu.read32(addr_of(state, &m))?),
    }
}

fn dst_u128(state: &mut CpuState, mmu: &mut Mmu, op: SseOperand, v: u128) -> Result<(), Fault> {
    match op {
        SseOperand::Xmm(x) => {
            state.xmm[x as usize] = v;
            Ok(())
        }
        SseOperand::Gpr(reg, width) => {
            state.write_reg_w(reg, width, v as u64);
            Ok(())
        }
        SseOperand::Mem(m) => Ok(mmu.write128(addr_of(state, &m), v)?),
    }
}

fn set_low32(x: u128, v: u32) -> u128 {
    (x & !0xffff_ffffu128) | v as u128
}

fn set_low64(x: u128, v: u64) -> u128 {
    (x & !(u64::MAX as u128)) | v as u128
}

/// Apply `f` lane-wise over two 128-bit values.
fn map_lanes(a: u128, b: u128, lane_bytes: u32, f: impl Fn(u64, u64) -> u64) -> u128 {
    let lane_bits = lane_bytes * 8;
    let mask = if lane_bits == 64 {
        u64::MAX
    } else {
        (1u64 << lane_bits) - 1
    };
    let mut out = 0u128;
    let lanes = 128 / lane_bits;
    for i in 0..lanes {
        let shift = i * lane_bits;
        let la = ((a >> shift) as u64) & mask;
        let lb = ((b >> shift) as u64) & mask;
        out |= ((f(la, lb) & mask) as u128) << shift;
    }
    out
}

/// Scalar-float compare result flags (ucomis/comis/fcomi all share this).
fn compare_floats(state: &mut CpuState, a: f64, b: f64) {
    let (zf, pf, cf) = if a.is_nan() || b.is_nan() {
        (true, true, true)
    } else if a < b {
        (false, false, true)
    } else if a > b {
        (false, false, false)
    } else {
        (true, false, false)
    };
    state.flags.zf = zf;
    state.flags.pf = pf;
    state.flags.cf = cf;
    state.flags.of = false;
    state.flags.sf = false;
}

fn cmp_predicate(pred: u8, a: f64, b: f64) -> bool {
    let unordered = a.is_nan() || b.is_nan();
    match pred & 7 {
        0 => !unordered && a == b,
        1 => !unordered && a < b,
        2 => !unordered && a <= b,
        3 => unordered,
        4 => unordered || a != b,
        5 => unordered || !(a < b),
        6 => unordered || !(a <= b),
        _ => !unordered,
    }
}

/// SSE min/max keep the second operand when the lanes compare equal or
/// either is NaN.
fn sse_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() || a >= b {
        b
    } else {
        a
    }
}

fn sse_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() || a <= b {
        b
    } else {
        a
    }
}

fn f32_bin(
    state: &mut CpuState,
    mmu: &Mmu,
    inst: &SseInst,
    rip: u64,
    f: impl Fn(f32, f32) -> f32,
) -> Result<(), Fault> {
    let SseOperand::Xmm(d) = inst.dst else {
        return Err(Fault::Unsupported { rip, what: "scalar float store form" });
    };
    let a = f32::from_bits(state.xmm[d as usize] as u32);
    let b = f32::from_bits(src_u32(state, mmu, inst.src)?);
    let r = f(a, b);
    state.xmm[d as usize] = set_low32(state.xmm[d as usize], r.to_bits());
    Ok(())
}

fn f64_bin(
    state: &mut CpuState,
    mmu: &Mmu,
    inst: &SseInst,
    rip: u64,
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), Fault> {
    let SseOperand::Xmm(d) = inst.dst else {
        return Err(Fault::Unsupported { rip, what: "scalar float store form" });
    };
    let a = f64::from_bits(state.xmm[d as usize] as u64);
    let b = f64::from_bits(src_u64(state, mmu, inst.src)?);
    let r = f(a, b);
    state.xmm[d as usize] = set_low64(state.xmm[d as usize], r.to_bits());
    Ok(())
}

fn bitwise(state: &mut CpuState, mmu: &mut Mmu, inst: &SseInst, f: impl Fn(u128, u128) -> u128) -> Result<(), Fault> {
    let a = src_u128(state, mmu, inst.dst)?;
    let b = src_u128(state, mmu, inst.src)?;
    dst_u128(state, mmu, inst.dst, f(a, b))
}

fn saturate_i16_to_u8(v: i16) -> u8 {
    v.clamp(0, 255) as u8
}

fn saturate_i16_to_i8(v: i16) -> i8 {
    v.clamp(-128, 127) as i8
}

fn saturate_i32_to_i16(v: i32) -> i16 {
    v.clamp(-32768, 32767) as i16
}

fn saturate_i32_to_u16(v: i32) -> u16 {
    v.clamp(0, 65535) as u16
}

pub(crate) fn sse(state: &mut CpuState, mmu: &mut Mmu, inst: &SseInst, rip: u64) -> Result<(), Fault> {
    use SseOp::*;
    match inst.op {
        Movss => match (inst.dst, inst.src) {
            (SseOperand::Xmm(d), SseOperand::Mem(m)) => {
                let v = mmu.read32(addr_of(state, &m))?;
                state.xmm[d as usize] = v as u128;
            }
            (SseOperand::Xmm(d), src) => {
                let v = src_u32(state, mmu, src)?;
                state.xmm[d as usize] = set_low32(state.xmm[d as usize], v);
            }
            (SseOperand::Mem(m), src) => {
                let v = src_u32(state, mmu, src)?;
                mmu.write32(addr_of(state, &m), v)?;
            }
            _ => return Err(Fault::Unsupported { rip, what: "movss form" }),
        },
        Movsd => match (inst.dst, inst.src) {
            (SseOperand::Xmm(d), SseOperand::Mem(m)) => {
                let v = mmu.read64(addr_of(state, &m))?;
                state.xmm[d as usize] = v as u128;
            }
            (SseOperand::Xmm(d), src) => {
                let v = src_u64(state, mmu, src)?;
                state.xmm[d as usize] = set_low64(state.xmm[d as usize], v);
            }
            (SseOperand::Mem(m), src) => {
                let v = src_u64(state, mmu, src)?;
                mmu.write64(addr_of(state, &m), v)?;
            }
            _ => return Err(Fault::Unsupported { rip, what: "movsd form" }),
        },
        Movaps | Movups | Movdqa | Movdqu => {
            let v = src_u128(state, mmu, inst.src)?;
            dst_u128(state, mmu, inst.dst, v)?;
        }
        Movd => match (inst.dst, inst.src) {
            (SseOperand::Xmm(d), src) => {
                let v = src_u32(state, mmu, src)?;
                state.xmm[d as usize] = v as u128;
            }
            (dst, SseOperand::Xmm(s)) => {
                let v = state.xmm[s as usize] as u32;
                match dst {
                    SseOperand::Gpr(reg, _) => state.write_reg_w(reg, Width::W32, v as u64),
                    SseOperand::Mem(m) => mmu.write32(addr_of(state, &m), v)?,
                    SseOperand::Xmm(_) => unreachable!(),
                }
            }
            _ => return Err(Fault::Unsupported { rip, what: "movd form" }),
        },
        Movq => match (inst.dst, inst.src) {
            (SseOperand::Xmm(d), src) => {
                let v = src_u64(state, mmu, src)?;
                state.xmm[d as usize] = v as u128;
            }
            (dst, SseOperand::Xmm(s)) => {
                let v = state.xmm[s as usize] as u64;
                match dst {
                    SseOperand::Gpr(reg, _) => state.write_reg(reg, v),
                    SseOperand::Mem(m) => mmu.write64(addr_of(state, &m), v)?,
                    SseOperand::Xmm(_) => unreachable!(),
                }
            }
            _ => return Err(Fault::Unsupported { rip, what: "movq form" }),
        },
        Movlps => match (inst.dst, inst.src) {
            (SseOperand::Xmm(d), src) => {
                let v = src_u64(state, mmu, src)?;
                state.xmm[d as usize] = set_low64(state.xmm[d as usize], v);
            }
            (SseOperand::Mem(m), SseOperand::Xmm(s)) => {
                mmu.write64(addr_of(state, &m), state.xmm[s as usize] as u64)?;
            }
            _ => return Err(Fault::Unsupported { rip, what: "movlps form" }),
        },
        Movhps => match (inst.dst, inst.src) {
            (SseOperand::Xmm(d), src) => {
                let v = src_u64(state, mmu, src)?;
                state.xmm[d as usize] =
                    (state.xmm[d as usize] & u64::MAX as u128) | ((v as u128) << 64);
            }
            (SseOperand::Mem(m), SseOperand::Xmm(s)) => {
                mmu.write64(addr_of(state, &m), (state.xmm[s as usize] >> 64) as u64)?;
            }
            _ => return Err(Fault::Unsupported { rip, what: "movhps form" }),
        },
        Movmskps => {
            let v = src_u128(state, mmu, inst.src)?;
            let mut mask = 0u64;
            for i in 0..4 {
                if (v >> (32 * i + 31)) & 1 != 0 {
                    mask |= 1 << i;
                }
            }
            let SseOperand::Gpr(reg, _) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "movmskps dst" });
            };
            state.write_reg_w(reg, Width::W32, mask);
        }
        Movmskpd => {
            let v = src_u128(state, mmu, inst.src)?;
            let mut mask = 0u64;
            for i in 0..2 {
                if (v >> (64 * i + 63)) & 1 != 0 {
                    mask |= 1 << i;
                }
            }
            let SseOperand::Gpr(reg, _) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "movmskpd dst" });
            };
            state.write_reg_w(reg, Width::W32, mask);
        }
        Pxor | Xorps | Xorpd => bitwise(state, mmu, inst, |a, b| a ^ b)?,
        Pand | Andps | Andpd => bitwise(state, mmu, inst, |a, b| a & b)?,
        Pandn | Andnps | Andnpd => bitwise(state, mmu, inst, |a, b| !a & b)?,
        Por | Orps | Orpd => bitwise(state, mmu, inst, |a, b| a | b)?,
        Ptest => {
            let a = src_u128(state, mmu, inst.dst)?;
            let b = src_u128(state, mmu, inst.src)?;
            state.flags.zf = a & b == 0;
            state.flags.cf = !a & b == 0;
            state.flags.of = false;
            state.flags.sf = false;
            state.flags.pf = false;
        }
        Pcmpeqb => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 1, |x, y| if x == y { 0xff } else { 0 })
        })?,
        Pcmpeqw => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 2, |x, y| if x == y { 0xffff } else { 0 })
        })?,
        Pcmpeqd => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 4, |x, y| if x == y { 0xffff_ffff } else { 0 })
        })?,
        Pcmpeqq => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 8, |x, y| if x == y { u64::MAX } else { 0 })
        })?,
        Pcmpgtb => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 1, |x, y| if (x as i8) > (y as i8) { 0xff } else { 0 })
        })?,
        Pcmpgtw => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 2, |x, y| if (x as i16) > (y as i16) { 0xffff } else { 0 })
        })?,
        Pcmpgtd => bitwise(state, mmu, inst, |a, b| {
            map_lanes(a, b, 4, |x, y| {
                if (x as i32) > (y as i32) {
                    0xffff_ffff
                } else {
                    0
                }
            })
        })?,
        Pmovmskb => {
            let v = src_u128(state, mmu, inst.src)?;
            let mut mask = 0u64;
            for i in 0..16 {
                if (v >> (8 * i + 7)) & 1 != 0 {
                    mask |= 1 << i;
                }
            }
            let SseOperand::Gpr(reg, _) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "pmovmskb dst" });
            };
            state.write_reg_w(reg, Width::W32, mask);
        }
        Paddb => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 1, |x, y| x.wrapping_add(y)))?,
        Paddw => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 2, |x, y| x.wrapping_add(y)))?,
        Paddd => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 4, |x, y| x.wrapping_add(y)))?,
        Paddq => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 8, |x, y| x.wrapping_add(y)))?,
        Psubb => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 1, |x, y| x.wrapping_sub(y)))?,
        Psubw => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 2, |x, y| x.wrapping_sub(y)))?,
        Psubd => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 4, |x, y| x.wrapping_sub(y)))?,
        Psubq => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 8, |x, y| x.wrapping_sub(y)))?,
        Pmaxub => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 1, |x, y| x.max(y)))?,
        Pminub => bitwise(state, mmu, inst, |a, b| map_lanes(a, b, 1, |x, y| x.min(y)))?,
        Psllw | Pslld | Psllq | Psrlw | Psrld | Psrlq => {
            let lane_bytes = match inst.op {
                Psllw | Psrlw => 2,
                Pslld | Psrld => 4,
                _ => 8,
            };
            let left = matches!(inst.op, Psllw | Pslld | Psllq);
            let count = match inst.imm {
                Some(n) => n as u64,
                None => src_u64(state, mmu, inst.src)?,
            };
            let a = src_u128(state, mmu, inst.dst)?;
            let lane_bits = lane_bytes * 8;
            let out = if count >= lane_bits as u64 {
                0
            } else {
                map_lanes(a, 0, lane_bytes, |x, _| if left { x << count } else { x >> count })
            };
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Pslldq | Psrldq => {
            let n = inst.imm.unwrap_or(0).min(16) as u32;
            let a = src_u128(state, mmu, inst.dst)?;
            let out = if n == 16 {
                0
            } else if matches!(inst.op, Pslldq) {
                a << (n * 8)
            } else {
                a >> (n * 8)
            };
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Pshufd => {
            let sel = inst.imm.unwrap_or(0);
            let src = src_u128(state, mmu, inst.src)?;
            let mut out = 0u128;
            for i in 0..4u32 {
                let which = ((sel >> (2 * i)) & 3) as u32;
                let dword = (src >> (32 * which)) as u32;
                out |= (dword as u128) << (32 * i);
            }
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Pshufb => {
            let a = src_u128(state, mmu, inst.dst)?;
            let sel = src_u128(state, mmu, inst.src)?;
            let mut out = 0u128;
            for i in 0..16u32 {
                let s = (sel >> (8 * i)) as u8;
                if s & 0x80 == 0 {
                    let byte = (a >> (8 * (s as u32 & 0xf))) as u8;
                    out |= (byte as u128) << (8 * i);
                }
            }
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Shufps => {
            let sel = inst.imm.unwrap_or(0);
            let a = src_u128(state, mmu, inst.dst)?;
            let b = src_u128(state, mmu, inst.src)?;
            let pick = |v: u128, which: u8| (v >> (32 * which as u32)) as u32;
            let out = (pick(a, sel & 3) as u128)
                | ((pick(a, (sel >> 2) & 3) as u128) << 32)
                | ((pick(b, (sel >> 4) & 3) as u128) << 64)
                | ((pick(b, (sel >> 6) & 3) as u128) << 96);
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Shufpd => {
            let sel = inst.imm.unwrap_or(0);
            let a = src_u128(state, mmu, inst.dst)?;
            let b = src_u128(state, mmu, inst.src)?;
            let lo = if sel & 1 == 0 { a as u64 } else { (a >> 64) as u64 };
            let hi = if sel & 2 == 0 { b as u64 } else { (b >> 64) as u64 };
            dst_u128(state, mmu, inst.dst, (lo as u128) | ((hi as u128) << 64))?;
        }
        Punpcklbw | Punpcklwd | Punpckldq | Punpcklqdq | Punpckhbw | Punpckhwd | Punpckhdq
        | Punpckhqdq => {
            let lane_bits: u32 = match inst.op {
                Punpcklbw | Punpckhbw => 8,
                Punpcklwd | Punpckhwd => 16,
                Punpckldq | Punpckhdq => 32,
                _ => 64,
            };
            let high = matches!(inst.op, Punpckhbw | Punpckhwd | Punpckhdq | Punpckhqdq);
            let a = src_u128(state, mmu, inst.dst)?;
            let b = src_u128(state, mmu, inst.src)?;
            let mask = if lane_bits == 64 {
                u64::MAX as u128
            } else {
                (1u128 << lane_bits) - 1
            };
            let half = 64 / lane_bits;
            let offset = if high { half } else { 0 };
            let mut out = 0u128;
            for i in 0..half {
                let la = (a >> ((offset + i) * lane_bits)) & mask;
                let lb = (b >> ((offset + i) * lane_bits)) & mask;
                out |= la << (2 * i * lane_bits);
                out |= lb << ((2 * i + 1) * lane_bits);
            }
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Packuswb | Packsswb => {
            let a = src_u128(state, mmu, inst.dst)?;
            let b = src_u128(state, mmu, inst.src)?;
            let mut out = 0u128;
            for i in 0..8u32 {
                let v = (a >> (16 * i)) as u16 as i16;
                let byte = if matches!(inst.op, Packuswb) {
                    saturate_i16_to_u8(v)
                } else {
                    saturate_i16_to_i8(v) as u8
                };
                out |= (byte as u128) << (8 * i);
            }
            for i in 0..8u32 {
                let v = (b >> (16 * i)) as u16 as i16;
                let byte = if matches!(inst.op, Packuswb) {
                    saturate_i16_to_u8(v)
                } else {
                    saturate_i16_to_i8(v) as u8
                };
                out |= (byte as u128) << (64 + 8 * i);
            }
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Packssdw | Packusdw => {
            let a = src_u128(state, mmu, inst.dst)?;
            let b = src_u128(state, mmu, inst.src)?;
            let mut out = 0u128;
            for i in 0..4u32 {
                let v = (a >> (32 * i)) as u32 as i32;
                let word = if matches!(inst.op, Packssdw) {
                    saturate_i32_to_i16(v) as u16
                } else {
                    saturate_i32_to_u16(v)
                };
                out |= (word as u128) << (16 * i);
            }
            for i in 0..4u32 {
                let v = (b >> (32 * i)) as u32 as i32;
                let word = if matches!(inst.op, Packssdw) {
                    saturate_i32_to_i16(v) as u16
                } else {
                    saturate_i32_to_u16(v)
                };
                out |= (word as u128) << (64 + 16 * i);
            }
            dst_u128(state, mmu, inst.dst, out)?;
        }
        Addss => f32_bin(state, mmu, inst, rip, |a, b| a + b)?,
        Addsd => f64_bin(state, mmu, inst, rip, |a, b| a + b)?,
        Subss => f32_bin(state, mmu, inst, rip, |a, b| a - b)?,
        Subsd => f64_bin(state, mmu, inst, rip, |a, b| a - b)?,
        Mulss => f32_bin(state, mmu, inst, rip, |a, b| a * b)?,
        Mulsd => f64_bin(state, mmu, inst, rip, |a, b| a * b)?,
        Divss => f32_bin(state, mmu, inst, rip, |a, b| a / b)?,
        Divsd => f64_bin(state, mmu, inst, rip, |a, b| a / b)?,
        Minss => f32_bin(state, mmu, inst, rip, |a, b| sse_min(a as f64, b as f64) as f32)?,
        Minsd => f64_bin(state, mmu, inst, rip, sse_min)?,
        Maxss => f32_bin(state, mmu, inst, rip, |a, b| sse_max(a as f64, b as f64) as f32)?,
        Maxsd => f64_bin(state, mmu, inst, rip, sse_max)?,
        Sqrtss => f32_bin(state, mmu, inst, rip, |_, b| b.sqrt())?,
        Sqrtsd => f64_bin(state, mmu, inst, rip, |_, b| b.sqrt())?,
        Comiss | Ucomiss => {
            let a = f32::from_bits(src_u32(state, mmu, inst.dst)?) as f64;
            let b = f32::from_bits(src_u32(state, mmu, inst.src)?) as f64;
            compare_floats(state, a, b);
        }
        Comisd | Ucomisd => {
            let a = f64::from_bits(src_u64(state, mmu, inst.dst)?);
            let b = f64::from_bits(src_u64(state, mmu, inst.src)?);
            compare_floats(state, a, b);
        }
        Cmpss => {
            let pred = inst.imm.unwrap_or(0);
            let SseOperand::Xmm(d) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "cmpss dst" });
            };
            let a = f32::from_bits(state.xmm[d as usize] as u32) as f64;
            let b = f32::from_bits(src_u32(state, mmu, inst.src)?) as f64;
            let mask = if cmp_predicate(pred, a, b) { u32::MAX } else { 0 };
            state.xmm[d as usize] = set_low32(state.xmm[d as usize], mask);
        }
        Cmpsd => {
            let pred = inst.imm.unwrap_or(0);
            let SseOperand::Xmm(d) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "cmpsd dst" });
            };
            let a = f64::from_bits(state.xmm[d as usize] as u64);
            let b = f64::from_bits(src_u64(state, mmu, inst.src)?);
            let mask = if cmp_predicate(pred, a, b) { u64::MAX } else { 0 };
            state.xmm[d as usize] = set_low64(state.xmm[d as usize], mask);
        }
        Cvtsi2ss | Cvtsi2sd => {
            let width = match inst.src {
                SseOperand::Gpr(_, w) => w,
                SseOperand::Mem(_) => inst.mem_width.unwrap_or(Width::W32),
                SseOperand::Xmm(_) => {
                    return Err(Fault::Unsupported { rip, what: "cvtsi2 src" })
                }
            };
            let raw = src_u64(state, mmu, inst.src)?;
            let v = width.sign_extend(raw) as i64;
            let SseOperand::Xmm(d) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "cvtsi2 dst" });
            };
            if matches!(inst.op, Cvtsi2ss) {
                state.xmm[d as usize] =
                    set_low32(state.xmm[d as usize], (v as f32).to_bits());
            } else {
                state.xmm[d as usize] =
                    set_low64(state.xmm[d as usize], (v as f64).to_bits());
            }
        }
        Cvtss2sd => {
            let v = f32::from_bits(src_u32(state, mmu, inst.src)?);
            let SseOperand::Xmm(d) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "cvtss2sd dst" });
            };
            state.xmm[d as usize] = set_low64(state.xmm[d as usize], (v as f64).to_bits());
        }
        Cvtsd2ss => {
            let v = f64::from_bits(src_u64(state, mmu, inst.src)?);
            let SseOperand::Xmm(d) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "cvtsd2ss dst" });
            };
            state.xmm[d as usize] = set_low32(state.xmm[d as usize], (v as f32).to_bits());
        }
        Cvttss2si | Cvtss2si | Cvttsd2si | Cvtsd2si => {
            let v = if matches!(inst.op, Cvttss2si | Cvtss2si) {
                f32::from_bits(src_u32(state, mmu, inst.src)?) as f64
            } else {
                f64::from_bits(src_u64(state, mmu, inst.src)?)
            };
            let v = if matches!(inst.op, Cvttss2si | Cvttsd2si) {
                v.trunc()
            } else {
                v.round_ties_even()
            };
            let SseOperand::Gpr(reg, width) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "cvt2si dst" });
            };
            let out = if width == Width::W64 {
                if v.is_nan() || v < i64::MIN as f64 || v > i64::MAX as f64 {
                    i64::MIN as u64
                } else {
                    v as i64 as u64
                }
            } else if v.is_nan() || v < i32::MIN as f64 || v > i32::MAX as f64 {
                i32::MIN as u32 as u64
            } else {
                v as i32 as u32 as u64
            };
            state.write_reg_w(reg, width, out);
        }
        Stmxcsr => {
            let SseOperand::Mem(m) = inst.dst else {
                return Err(Fault::Unsupported { rip, what: "stmxcsr dst" });
            };
            mmu.write32(addr_of(state, &m), state.fpu.mxcsr)?;
        }
        Ldmxcsr => {
            let SseOperand::Mem(m) = inst.src else {
                return Err(Fault::Unsupported { rip, what: "ldmxcsr src" });
            };
            state.fpu.mxcsr = mmu.read32(addr_of(state, &m))?;
        }
    }
    Ok(())
}

/// Convert an 80-bit extended float (as 10 little-endian bytes) to f64.
fn f80_to_f64(bytes: [u8; 10]) -> f64 {
    let mantissa = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
    let se = u16::from_le_bytes([bytes[8], bytes[9]]);
    let sign = se & 0x8000 != 0;
    let exp = (se & 0x7fff) as i32;
    let value = if exp == 0 {
        (mantissa as f64) * 2f64.powi(-16382 - 63)
    } else if exp == 0x7fff {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else {
        (mantissa as f64) * 2f64.powi(exp - 16383 - 63)
    };
    if sign {
        -value
    } else {
        value
    }
}

/// Convert f64 to the 80-bit extended format.
fn f64_to_f80(v: f64) -> [u8; 10] {
    let bits = v.to_bits();
    let sign = (bits >> 63) as u16;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & 0xf_ffff_ffff_ffff;
    let (se, mantissa) = if exp == 0x7ff {
        // Inf/NaN: integer bit set, payload in the top fraction bits.
        (0x7fffu16, (1u64 << 63) | (frac << 11))
    } else if exp == 0 && frac == 0 {
        (0, 0)
    } else if exp == 0 {
        // Subnormal double: normalize into the explicit integer bit.
        let shift = frac.leading_zeros() - 11;
        let mantissa = frac << (shift + 11);
        let e = -1022 - shift as i32 + 16383;
        (e as u16, mantissa)
    } else {
        let e = exp - 1023 + 16383;
        (e as u16, (1u64 << 63) | (frac << 11))
    };
    let mut out = [0u8; 10];
    out[0..8].copy_from_slice(&mantissa.to_le_bytes());
    out[8..10].copy_from_slice(&((sign << 15) | se).to_le_bytes());
    out
}

/// Round per the x87 control-word RC field.
fn round_by_fcw(fcw: u16, v: f64) -> f64 {
    match (fcw >> 10) & 3 {
        0 => v.round_ties_even(),
        1 => v.floor(),
        2 => v.ceil(),
        _ => v.trunc(),
    }
}

fn x87_load(state: &CpuState, mmu: &Mmu, operand: X87Operand, rip: u64) -> Result<f64, Fault> {
    match operand {
        X87Operand::St(i) => Ok(state.fpu.st(i)),
        X87Operand::M32(m) => Ok(f32::from_bits(mmu.read32(addr_of(state, &m))?) as f64),
        X87Operand::M64(m) => Ok(f64::from_bits(mmu.read64(addr_of(state, &m))?)),
        X87Operand::M80(m) => {
            let addr = addr_of(state, &m);
            let mut bytes = [0u8; 10];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = mmu.read8(addr + i as u64)?;
            }
            Ok(f80_to_f64(bytes))
        }
        X87Operand::M16(m) => Ok(mmu.read16(addr_of(state, &m))? as i16 as f64),
        _ => Err(Fault::Unsupported { rip, what: "x87 load operand" }),
    }
}

pub(crate) fn x87(state: &mut CpuState, mmu: &mut Mmu, inst: &X87Inst, rip: u64) -> Result<(), Fault> {
    use X87Op::*;
    match inst.op {
        Fld => {
            let v = x87_load(state, mmu, inst.operand.ok_or(Fault::Unsupported { rip, what: "fld operand" })?, rip)?;
            state.fpu.push(v);
        }
        Fild => {
            let v = match inst.operand {
                Some(X87Operand::M16(m)) => mmu.read16(addr_of(state, &m))? as i16 as f64,
                Some(X87Operand::M32(m)) => mmu.read32(addr_of(state, &m))? as i32 as f64,
                Some(X87Operand::M64(m)) => mmu.read64(addr_of(state, &m))? as i64 as f64,
                _ => return Err(Fault::Unsupported { rip, what: "fild operand" }),
            };
            state.fpu.push(v);
        }
        Fldz => state.fpu.push(0.0),
        Fld1 => state.fpu.push(1.0),
        Fst | Fstp => {
            let v = state.fpu.st(0);
            match inst.operand {
                Some(X87Operand::St(i)) => state.fpu.set_st(i, v),
                Some(X87Operand::M32(m)) => mmu.write32(addr_of(state, &m), (v as f32).to_bits())?,
                Some(X87Operand::M64(m)) => mmu.write64(addr_of(state, &m), v.to_bits())?,
                Some(X87Operand::M80(m)) => {
                    let addr = addr_of(state, &m);
                    for (i, b) in f64_to_f80(v).iter().enumerate() {
                        mmu.write8(addr + i as u64, *b)?;
                    }
                }
                _ => return Err(Fault::Unsupported { rip, what: "fst operand" }),
            }
            if matches!(inst.op, Fstp) {
                state.fpu.pop();
            }
        }
        Fist | Fistp => {
            let v = round_by_fcw(state.fpu.fcw, state.fpu.st(0));
            match inst.operand {
                Some(X87Operand::M16(m)) => {
                    mmu.write16(addr_of(state, &m), v as i16 as u16)?
                }
                Some(X87Operand::M32(m)) => {
                    mmu.write32(addr_of(state, &m), v as i32 as u32)?
                }
                Some(X87Operand::M64(m)) => {
                    mmu.write64(addr_of(state, &m), v as i64 as u64)?
                }
                _ => return Err(Fault::Unsupported { rip, what: "fist operand" }),
            }
            if matches!(inst.op, Fistp) {
                state.fpu.pop();
            }
        }
        Fxch => {
            let i = match inst.operand {
                Some(X87Operand::St(i)) => i,
                None => 1,
                _ => return Err(Fault::Unsupported { rip, what: "fxch operand" }),
            };
            let a = state.fpu.st(0);
            let b = state.fpu.st(i);
            state.fpu.set_st(0, b);
            state.fpu.set_st(i, a);
        }
        Fchs => {
            let v = -state.fpu.st(0);
            state.fpu.set_st(0, v);
        }
        Fabs => {
            let v = state.fpu.st(0).abs();
            state.fpu.set_st(0, v);
        }
        Fadd | Faddp | Fsub | Fsubp | Fsubr | Fsubrp | Fmul | Fmulp | Fdiv | Fdivp | Fdivr
        | Fdivrp => {
            let operand = inst
                .operand
                .ok_or(Fault::Unsupported { rip, what: "x87 arith operand" })?;
            let rhs = x87_load(state, mmu, operand, rip)?;
            let dst = if matches!(operand, X87Operand::St(_)) {
                inst.st
            } else {
                0
            };
            let lhs = state.fpu.st(dst);
            let res = match inst.op {
                Fadd | Faddp => lhs + rhs,
                Fsub | Fsubp => lhs - rhs,
                Fsubr | Fsubrp => rhs - lhs,
                Fmul | Fmulp => lhs * rhs,
                Fdiv | Fdivp => lhs / rhs,
                _ => rhs / lhs,
            };
            state.fpu.set_st(dst, res);
            if matches!(inst.op, Faddp | Fsubp | Fsubrp | Fmulp | Fdivp | Fdivrp) {
                state.fpu.pop();
            }
        }
        Fcomi | Fcomip | Fucomi | Fucomip => {
            let i = match inst.operand {
                Some(X87Operand::St(i)) => i,
                _ => 1,
            };
            let (a, b) = (state.fpu.st(0), state.fpu.st(i));
            compare_floats(state, a, b);
            if matches!(inst.op, Fcomip | Fucomip) {
                state.fpu.pop();
            }
        }
        Fcmov(cond) => {
            let i = match inst.operand {
                Some(X87Operand::St(i)) => i,
                _ => 1,
            };
            if state.flags.cond(cond) {
                let v = state.fpu.st(i);
                state.fpu.set_st(0, v);
            }
        }
        Frndint => {
            let v = round_by_fcw(state.fpu.fcw, state.fpu.st(0));
            state.fpu.set_st(0, v);
        }
        Fnstcw => {
            let Some(X87Operand::M16(m)) = inst.operand else {
                return Err(Fault::Unsupported { rip, what: "fnstcw operand" });
            };
            mmu.write16(addr_of(state, &m), state.fpu.fcw)?;
        }
        Fldcw => {
            let Some(X87Operand::M16(m)) = inst.operand else {
                return Err(Fault::Unsupported { rip, what: "fldcw operand" });
            };
            state.fpu.fcw = mmu.read16(addr_of(state, &m))?;
        }
        Fnstsw => {
            let sw = (state.fpu.fsw & !0x3800) | ((state.fpu.top as u16 & 7) << 11);
            match inst.operand {
                Some(X87Operand::Ax) => {
                    state.write_reg_w(strato_x86::Reg::Rax, Width::W16, sw as u64)
                }
                Some(X87Operand::M16(m)) => mmu.write16(addr_of(state, &m), sw)?,
                _ => return Err(Fault::Unsupported { rip, what: "fnstsw operand" }),
            }
        }
        Fnstenv | Fldenv => {
            let m = match inst.operand {
                Some(X87Operand::Image(m)) | Some(X87Operand::M32(m)) => m,
                _ => return Err(Fault::Unsupported { rip, what: "fenv operand" }),
            };
            let addr = addr_of(state, &m);
            if matches!(inst.op, Fnstenv) {
                // 28-byte protected-mode environment; unused words zeroed.
                mmu.write32(addr, state.fpu.fcw as u32)?;
                let sw = (state.fpu.fsw & !0x3800) | ((state.fpu.top as u16 & 7) << 11);
                mmu.write32(addr + 4, sw as u32)?;
                for off in (8..28).step_by(4) {
                    mmu.write32(addr + off, 0)?;
                }
            } else {
                state.fpu.fcw = mmu.read32(addr)? as u16;
                let sw = mmu.read32(addr + 4)? as u16;
                state.fpu.fsw = sw & !0x3800;
                state.fpu.top = ((sw >> 11) & 7) as u8;
            }
        }
        Fwait => {}
        Fxsave | Fxrstor => {
            let m = match inst.operand {
                Some(X87Operand::Image(m))
                | Some(X87Operand::M16(m))
                | Some(X87Operand::M32(m))
                | Some(X87Operand::M64(m)) => m,
                _ => return Err(Fault::Unsupported { rip, what: "fxsave operand" }),
            };
            let addr = addr_of(state, &m);
            if matches!(inst.op, Fxsave) {
                for off in (0..512).step_by(8) {
                    mmu.write64(addr + off, 0)?;
                }
                mmu.write16(addr, state.fpu.fcw)?;
                let sw = (state.fpu.fsw & !0x3800) | ((state.fpu.top as u16 & 7) << 11);
                mmu.write16(addr + 2, sw)?;
                mmu.write32(addr + 24, state.fpu.mxcsr)?;
                for i in 0..8u64 {
                    mmu.write64(addr + 32 + 16 * i, state.fpu.st[i as usize].to_bits())?;
                }
                for i in 0..16u64 {
                    mmu.write128(addr + 160 + 16 * i, state.xmm[i as usize])?;
                }
            } else {
                state.fpu.fcw = mmu.read16(addr)?;
                let sw = mmu.read16(addr + 2)?;
                state.fpu.fsw = sw & !0x3800;
                state.fpu.top = ((sw >> 11) & 7) as u8;
                state.fpu.mxcsr = mmu.read32(addr + 24)?;
                for i in 0..8u64 {
                    state.fpu.st[i as usize] = f64::from_bits(mmu.read64(addr + 32 + 16 * i)?);
                }
                for i in 0..16u64 {
                    state.xmm[i as usize] = mmu.read128(addr + 160 + 16 * i)?;
                }
            }
        }
    }
    Ok(())
}
