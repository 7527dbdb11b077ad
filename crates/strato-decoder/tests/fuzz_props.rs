//! Decoder robustness properties over arbitrary byte soup.

use proptest::prelude::*;
use strato_decoder::decode_range;

proptest! {
    /// Decoding must never panic, and the produced run must be contiguous:
    /// every instruction starts exactly where its predecessor ended.
    #[test]
    fn decoding_is_total_and_contiguous(
        bytes in proptest::collection::vec(any::<u8>(), 0..256),
        base in 0u64..0x1_0000_0000,
    ) {
        let range = decode_range(&bytes, base);
        let mut expected = base;
        for inst in &range.insts {
            prop_assert_eq!(inst.addr, expected);
            prop_assert!(inst.len >= 1);
            prop_assert!(inst.len as usize <= strato_x86::MAX_INST_LEN);
            expected = inst.addr + inst.len as u64;
        }
        prop_assert_eq!(range.next_addr, expected);
        prop_assert!(range.next_addr <= base + bytes.len() as u64);
    }
}
