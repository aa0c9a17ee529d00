//! The MET signal wire unit and the atomic batch-size probe (spec §3, §6).

use std::os::unix::io::RawFd;

use nix::unistd::{fpathconf, sysconf, PathconfVar, SysconfVar};

use crate::error::MetError;

/// Packed size of one signal on the wire: `u8 source, u8 id, u16 cargo, f64 time`.
///
/// Built by hand rather than derived from `#[repr(C)]`, since a natural
/// `repr(C)` layout would pad the struct to 16 bytes to satisfy `f64`'s
/// alignment; both sides of the pipe must agree on the same 12-byte
/// layout (spec §6).
pub const SIGNAL_WIRE_SIZE: usize = 12;

/// The `(source, id, cargo, time)` wire tuple (spec §3).
///
/// `id` is kept as a raw `u8` here: it is validated against the closed
/// `SignalId` set only where that matters (the protocol state machine),
/// not at the wire-decode boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub source: u8,
    pub id: u8,
    pub cargo: u16,
    pub time: f64,
}

impl Signal {
    pub fn to_bytes(&self) -> [u8; SIGNAL_WIRE_SIZE] {
        let mut buf = [0u8; SIGNAL_WIRE_SIZE];
        buf[0] = self.source;
        buf[1] = self.id;
        buf[2..4].copy_from_slice(&self.cargo.to_ne_bytes());
        buf[4..12].copy_from_slice(&self.time.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; SIGNAL_WIRE_SIZE]) -> Self {
        Signal {
            source: buf[0],
            id: buf[1],
            cargo: u16::from_ne_bytes([buf[2], buf[3]]),
            time: f64::from_ne_bytes(buf[4..12].try_into().expect("slice is 8 bytes")),
        }
    }
}

/// Time must be finite, `>= 0`, `<= f64::MAX` (spec §3). `is_finite` already
/// excludes NaN/infinity, and `f64::MAX` is the largest finite value, so the
/// upper bound falls out of finiteness for free.
pub fn time_in_range(time: f64) -> bool {
    time.is_finite() && time >= 0.0
}

/// `AWMSIG`: the number of whole signals guaranteed to cross a pipe
/// atomically, per `min(PIPE_BUF, page_size) / signal_size`
/// (spec §2, `original_source/c/metatomic.c`).
pub fn atomic_signal_capacity(fd: RawFd) -> Result<usize, MetError> {
    let pipe_buf = fpathconf(fd, PathconfVar::PIPE_BUF)
        .map_err(|_| MetError::Syser)?
        .ok_or(MetError::Syser)? as usize;
    let page_size = sysconf(SysconfVar::PAGE_SIZE)
        .map_err(|_| MetError::Syser)?
        .ok_or(MetError::Syser)? as usize;

    let atomic_bytes = pipe_buf.min(page_size);
    Ok(atomic_bytes / SIGNAL_WIRE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let sig = Signal {
            source: 3,
            id: 7,
            cargo: 0xbeef,
            time: 123.456,
        };
        let bytes = sig.to_bytes();
        assert_eq!(bytes.len(), SIGNAL_WIRE_SIZE);
        assert_eq!(Signal::from_bytes(&bytes), sig);
    }

    #[test]
    fn time_bounds() {
        assert!(time_in_range(0.0));
        assert!(time_in_range(f64::MAX));
        assert!(!time_in_range(-0.001));
        assert!(!time_in_range(f64::NAN));
        assert!(!time_in_range(f64::INFINITY));
    }

    #[test]
    fn atomic_capacity_on_a_real_pipe() {
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        let cap = atomic_signal_capacity(r).expect("probe succeeds");
        assert!(cap > 0);
        nix::unistd::close(r).ok();
    }
}
