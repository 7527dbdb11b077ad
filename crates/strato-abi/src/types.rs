//! Guest-memory struct layouts the emulator parses itself.
//!
//! Most syscall buffers (stat, utsname, sysinfo, ...) are produced by the
//! host translation layer and copied into guest memory as raw bytes, so only
//! the structs the kernel emulation actually interprets get a layout here.
//! All fields follow the x86-64 ABI ordering exactly.

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub const SIZE: u64 = 16;

    pub fn from_words(sec: u64, nsec: u64) -> Timespec {
        Timespec {
            tv_sec: sec as i64,
            tv_nsec: nsec as i64,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timeval {
    pub tv_sec: i64,
    pub tv_usec: i64,
}

impl Timeval {
    pub const SIZE: u64 = 16;
}

/// One pollfd slot, 8 bytes in guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pollfd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

impl Pollfd {
    pub const SIZE: u64 = 8;

    pub fn from_bytes(raw: [u8; 8]) -> Pollfd {
        Pollfd {
            fd: i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            events: i16::from_le_bytes([raw[4], raw[5]]),
            revents: i16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&self.fd.to_le_bytes());
        raw[4..6].copy_from_slice(&self.events.to_le_bytes());
        raw[6..8].copy_from_slice(&self.revents.to_le_bytes());
        raw
    }
}

/// epoll_event is packed on x86-64: 4-byte events immediately followed by the
/// 8-byte data field, 12 bytes total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpollEvent {
    pub events: u32,
    pub data: u64,
}

impl EpollEvent {
    pub const SIZE: u64 = 12;

    pub fn from_bytes(raw: [u8; 12]) -> EpollEvent {
        EpollEvent {
            events: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            data: u64::from_le_bytes([
                raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11],
            ]),
        }
    }

    pub fn to_bytes(self) -> [u8; 12] {
        let mut raw = [0u8; 12];
        raw[0..4].copy_from_slice(&self.events.to_le_bytes());
        raw[4..12].copy_from_slice(&self.data.to_le_bytes());
        raw
    }
}

/// One iovec slot: pointer then length.
#[derive(Clone, Copy, Debug)]
pub struct Iovec {
    pub base: u64,
    pub len: u64,
}

impl Iovec {
    pub const SIZE: u64 = 16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pollfd_round_trips_through_guest_bytes() {
        let p = Pollfd {
            fd: 7,
            events: 0x0001,
            revents: 0x0010,
        };
        assert_eq!(Pollfd::from_bytes(p.to_bytes()), p);
    }

    #[test]
    fn epoll_event_layout_is_packed() {
        let e = EpollEvent {
            events: 0x8000_0001,
            data: 0xdead_beef,
        };
        let raw = e.to_bytes();
        assert_eq!(raw.len(), 12);
        assert_eq!(EpollEvent::from_bytes(raw), e);
    }
}
