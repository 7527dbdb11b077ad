//! Kernel time.
//!
//! Kernel time is synthetic: it advances as guest instructions retire, at a
//! fixed nominal rate, plus explicit fast-forwards when every thread is
//! parked on a timed blocker. Blocker deadlines are expressed in the same
//! clock.

use strato_abi::types::{Timespec, Timeval, NSEC_PER_SEC};
use strato_mmu::{MemFault, Mmu};

/// Nanoseconds of kernel time per retired instruction (nominal 1 GHz at
/// 1 IPC).
pub const NANOS_PER_INSTRUCTION: u64 = 1;

/// A point in kernel time. `nanoseconds` is always normalized below one
/// second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PreciseTime {
    pub seconds: u64,
    pub nanoseconds: u64,
}

impl PreciseTime {
    pub const ZERO: PreciseTime = PreciseTime {
        seconds: 0,
        nanoseconds: 0,
    };

    pub fn from_nanos(nanos: u64) -> PreciseTime {
        PreciseTime {
            seconds: nanos / NSEC_PER_SEC,
            nanoseconds: nanos % NSEC_PER_SEC,
        }
    }

    pub fn from_millis(millis: u64) -> PreciseTime {
        PreciseTime::from_nanos(millis.saturating_mul(1_000_000))
    }

    pub fn from_timespec(ts: Timespec) -> PreciseTime {
        PreciseTime {
            seconds: ts.tv_sec.max(0) as u64,
            nanoseconds: (ts.tv_nsec.max(0) as u64).min(NSEC_PER_SEC - 1),
        }
    }

    pub fn add(self, other: PreciseTime) -> PreciseTime {
        let mut seconds = self.seconds + other.seconds;
        let mut nanoseconds = self.nanoseconds + other.nanoseconds;
        if nanoseconds >= NSEC_PER_SEC {
            seconds += nanoseconds / NSEC_PER_SEC;
            nanoseconds %= NSEC_PER_SEC;
        }
        PreciseTime {
            seconds,
            nanoseconds,
        }
    }

    pub fn as_nanos(self) -> u64 {
        self.seconds * NSEC_PER_SEC + self.nanoseconds
    }
}

/// Read a guest `struct timespec`; a null pointer means "no deadline".
pub fn read_timespec(mmu: &Mmu, ptr: u64) -> Result<Option<Timespec>, MemFault> {
    if ptr == 0 {
        return Ok(None);
    }
    let sec = mmu.read64(ptr)? as i64;
    let nsec = mmu.read64(ptr + 8)? as i64;
    Ok(Some(Timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }))
}

pub fn write_timespec(mmu: &mut Mmu, ptr: u64, time: PreciseTime) -> Result<(), MemFault> {
    mmu.write64(ptr, time.seconds)?;
    mmu.write64(ptr + 8, time.nanoseconds)
}

pub fn write_timeval(mmu: &mut Mmu, ptr: u64, time: PreciseTime) -> Result<(), MemFault> {
    let tv = Timeval {
        tv_sec: time.seconds as i64,
        tv_usec: (time.nanoseconds / 1_000) as i64,
    };
    mmu.write64(ptr, tv.tv_sec as u64)?;
    mmu.write64(ptr + 8, tv.tv_usec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_normalizes_nanoseconds() {
        let a = PreciseTime {
            seconds: 1,
            nanoseconds: 800_000_000,
        };
        let b = PreciseTime {
            seconds: 0,
            nanoseconds: 400_000_000,
        };
        let sum = a.add(b);
        assert_eq!(sum.seconds, 2);
        assert_eq!(sum.nanoseconds, 200_000_000);
    }

    #[test]
    fn ordering_is_lexicographic_on_seconds_then_nanos() {
        let early = PreciseTime {
            seconds: 1,
            nanoseconds: 999_999_999,
        };
        let late = PreciseTime {
            seconds: 2,
            nanoseconds: 0,
        };
        assert!(early < late);
    }
}
