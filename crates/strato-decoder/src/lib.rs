//! On-demand disassembly of guest code.
//!
//! `decode_range` walks a byte buffer from a base address and lowers every
//! encoding into the `strato-x86` instruction model. Decoding never fails:
//! encodings the backend rejects, and encodings the interpreter has no
//! semantics for, become `InstKind::Unknown` sentinels carrying the raw
//! bytes. A trailing undecodable stream ends the range.

mod lower;

use iced_x86::{Code, Decoder, DecoderOptions};
use strato_x86::{Inst, InstKind, MAX_INST_LEN};

/// A decoded, contiguous run of instructions starting at `base`.
/// `next_addr` is the first address not covered by the run.
#[derive(Debug)]
pub struct DecodedRange {
    pub insts: Vec<Inst>,
    pub next_addr: u64,
}

/// Decode `bytes` as 64-bit code placed at `base` until the buffer ends or an
/// undecodable byte stream is reached.
pub fn decode_range(bytes: &[u8], base: u64) -> DecodedRange {
    let mut decoder = Decoder::with_ip(64, bytes, base, DecoderOptions::NONE);
    let mut insts = Vec::new();
    let mut next_addr = base;
    let mut raw = iced_x86::Instruction::default();
    while decoder.can_decode() {
        let ip = decoder.ip();
        decoder.decode_out(&mut raw);
        if raw.code() == Code::INVALID {
            // Keep the head of the unrecognized stream for diagnostics and
            // stop; anything past this point has no reliable boundaries.
            let offset = (ip - base) as usize;
            let tail = &bytes[offset..];
            let len = tail.len().min(MAX_INST_LEN);
            let mut sentinel = [0u8; MAX_INST_LEN];
            sentinel[..len].copy_from_slice(&tail[..len]);
            insts.push(Inst {
                addr: ip,
                len: len as u8,
                lock: false,
                kind: InstKind::Unknown { bytes: sentinel },
            });
            next_addr = ip + len as u64;
            return DecodedRange { insts, next_addr };
        }
        let offset = (ip - base) as usize;
        insts.push(lower::lower(&raw, ip, &bytes[offset..offset + raw.len()]));
        next_addr = ip + raw.len() as u64;
    }
    DecodedRange { insts, next_addr }
}

/// Decode a single instruction at `ip`. Returns `None` for an empty buffer.
pub fn decode_one(bytes: &[u8], ip: u64) -> Option<Inst> {
    decode_range(bytes, ip).insts.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_x86::{AluOp, MemRef, Operand, Reg, Seg, Width};

    #[test]
    fn decodes_contiguous_run() {
        // nop; add eax, 1; ret
        let bytes = [0x90, 0x83, 0xC0, 0x01, 0xC3];
        let range = decode_range(&bytes, 0x1000);
        assert_eq!(range.insts.len(), 3);
        assert_eq!(range.next_addr, 0x1005);
        for pair in range.insts.windows(2) {
            assert_eq!(pair[0].next_addr(), pair[1].addr);
        }
    }

    #[test]
    fn rip_relative_memory_lowering_is_absolute() {
        // mov rax, qword ptr [rip+0x12345678]
        let bytes = [0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12];
        let inst = decode_one(&bytes, 0x1000).unwrap();
        let expected = 0x1000 + bytes.len() as u64 + 0x12345678;
        match inst.kind {
            InstKind::Mov {
                width: Width::W64,
                dst: Operand::Reg(Reg::Rax),
                src: Operand::Mem(MemRef { base: None, index: None, disp, .. }),
            } => assert_eq!(disp, expected),
            other => panic!("unexpected lowering: {other:?}"),
        }
    }

    #[test]
    fn fs_segment_override_is_kept() {
        // mov rax, qword ptr fs:[0x10]
        let bytes = [0x64, 0x48, 0x8B, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00];
        let inst = decode_one(&bytes, 0).unwrap();
        match inst.kind {
            InstKind::Mov {
                src: Operand::Mem(m),
                ..
            } => assert_eq!(m.seg, Seg::Fs),
            other => panic!("unexpected lowering: {other:?}"),
        }
    }

    #[test]
    fn lock_prefix_is_flagged() {
        // lock add dword ptr [rsi], ecx
        let bytes = [0xF0, 0x01, 0x0E];
        let inst = decode_one(&bytes, 0).unwrap();
        assert!(inst.lock);
        assert!(matches!(
            inst.kind,
            InstKind::Alu {
                op: AluOp::Add,
                width: Width::W32,
                ..
            }
        ));
    }

    #[test]
    fn undecodable_stream_becomes_unknown_sentinel_and_ends_range() {
        // 0x06 is invalid in 64-bit mode.
        let bytes = [0x90, 0x06, 0x90];
        let range = decode_range(&bytes, 0x2000);
        assert!(matches!(range.insts[0].kind, InstKind::Nop));
        assert!(matches!(range.insts[1].kind, InstKind::Unknown { .. }));
        assert_eq!(range.insts.len(), 2);
    }
}
