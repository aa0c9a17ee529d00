//! The controller-side signal pipe pair (spec §4.4).
//!
//! Each controller owns the write end of its own request pipe and the
//! read end of the shared broadcast pipe; the server owns the other
//! ends. Grounded on `met-shm::EventCounter`'s blocking-mode toggle and
//! EINTR-retry pattern, applied here to `read`/`write` on a pipe fd
//! instead of an eventfd.

use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{read, write};

use met_proto::{
    atomic_signal_capacity, time_in_range, ControllerId, MetError, Signal, SignalId,
    SIGNAL_WIRE_SIZE,
};

/// One `(id, cargo, time)` entry to send; `time: None` asks `send` to
/// stamp a shared wall-clock reading for this entry.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingSignal {
    pub id: SignalId,
    pub cargo: u16,
    pub time: Option<f64>,
}

fn now_as_met_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn set_blocking(fd: RawFd, blocking: bool) -> Result<OFlag, MetError> {
    let cur = fcntl(fd, FcntlArg::F_GETFL).map_err(|_| MetError::Syser)?;
    let cur = OFlag::from_bits_truncate(cur);
    let new = if blocking {
        cur & !OFlag::O_NONBLOCK
    } else {
        cur | OFlag::O_NONBLOCK
    };
    if new != cur {
        fcntl(fd, FcntlArg::F_SETFL(new)).map_err(|_| MetError::Syser)?;
    }
    Ok(cur)
}

fn restore_flags(fd: RawFd, original: OFlag) -> Result<(), MetError> {
    fcntl(fd, FcntlArg::F_SETFL(original)).map_err(|_| MetError::Syser)?;
    Ok(())
}

/// A controller's send/receive handle for one pipe pair.
pub struct SignalEndpoint {
    id: ControllerId,
    request_write_fd: RawFd,
    broadcast_read_fd: RawFd,
    awmsig: usize,
}

impl SignalEndpoint {
    /// `request_write_fd` and `broadcast_read_fd` must both be probed with
    /// the same `AWMSIG`, since the batch-size guarantee is per pipe fd
    /// (spec §2).
    pub fn new(
        id: ControllerId,
        request_write_fd: RawFd,
        broadcast_read_fd: RawFd,
    ) -> Result<Self, MetError> {
        let awmsig = atomic_signal_capacity(request_write_fd)?;
        Ok(SignalEndpoint {
            id,
            request_write_fd,
            broadcast_read_fd,
            awmsig,
        })
    }

    pub fn awmsig(&self) -> usize {
        self.awmsig
    }

    pub fn request_fd(&self) -> RawFd {
        self.request_write_fd
    }

    pub fn broadcast_fd(&self) -> RawFd {
        self.broadcast_read_fd
    }

    /// Send path (spec §4.4). Clamps `entries` to `AWMSIG`, stamps missing
    /// times with one shared wall-clock reading, stamps `source` with this
    /// controller's id, and writes the whole batch in one call, retrying a
    /// partial write until complete. Returns the number of signals sent.
    pub fn send(&self, entries: &[OutgoingSignal], blocking: bool) -> Result<usize, MetError> {
        let entries = &entries[..entries.len().min(self.awmsig)];
        if entries.is_empty() {
            return Ok(0);
        }

        let shared_now = if entries.iter().any(|e| e.time.is_none()) {
            Some(now_as_met_time())
        } else {
            None
        };

        let mut buf = Vec::with_capacity(entries.len() * SIGNAL_WIRE_SIZE);
        for e in entries {
            let time = e.time.unwrap_or_else(|| shared_now.expect("stamped above"));
            if !time_in_range(time) {
                return Err(MetError::Pbtim);
            }
            let sig = Signal {
                source: self.id.get(),
                id: e.id as u8,
                cargo: e.cargo,
                time,
            };
            buf.extend_from_slice(&sig.to_bytes());
        }

        let original = set_blocking(self.request_write_fd, blocking)?;
        let result = self.write_all(&buf);
        restore_flags(self.request_write_fd, original)?;
        result?;

        Ok(entries.len())
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), MetError> {
        let mut written = 0;
        while written < buf.len() {
            match write(self.request_write_fd, &buf[written..]) {
                Ok(n) => written += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(MetError::Clgrp),
                Err(Errno::EPIPE) => return Err(MetError::Brkrp),
                Err(_) => return Err(MetError::Syser),
            }
        }
        Ok(())
    }

    /// Receive path (spec §4.4). Reads up to `AWMSIG` signals from the
    /// broadcast pipe in a single `read`; a fractional final signal is a
    /// protocol breach.
    pub fn recv(&self, blocking: bool) -> Result<Vec<Signal>, MetError> {
        let mut buf = vec![0u8; self.awmsig * SIGNAL_WIRE_SIZE];

        let original = set_blocking(self.broadcast_read_fd, blocking)?;
        let result = self.read_once(&mut buf);
        restore_flags(self.broadcast_read_fd, original)?;
        let n = result?;

        if n % SIGNAL_WIRE_SIZE != 0 {
            return Err(MetError::Intrn);
        }

        let mut signals = Vec::with_capacity(n / SIGNAL_WIRE_SIZE);
        for chunk in buf[..n].chunks_exact(SIGNAL_WIRE_SIZE) {
            let arr: [u8; SIGNAL_WIRE_SIZE] = chunk.try_into().expect("chunks_exact");
            signals.push(Signal::from_bytes(&arr));
        }
        Ok(signals)
    }

    fn read_once(&self, buf: &mut [u8]) -> Result<usize, MetError> {
        loop {
            match read(self.broadcast_read_fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(0),
                Err(Errno::EPIPE) => return Err(MetError::Brkbp),
                Err(_) => return Err(MetError::Syser),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_pair() -> (SignalEndpoint, RawFd, RawFd) {
        let (req_r, req_w) = nix::unistd::pipe().unwrap();
        let (bc_r, bc_w) = nix::unistd::pipe().unwrap();
        let ep = SignalEndpoint::new(ControllerId::child(1).unwrap(), req_w, bc_r).unwrap();
        (ep, req_r, bc_w)
    }

    #[test]
    fn send_stamps_source_and_missing_time() {
        let (ep, req_r, bc_w) = endpoint_pair();
        let n = ep
            .send(
                &[OutgoingSignal {
                    id: SignalId::Ready,
                    cargo: 1,
                    time: None,
                }],
                false,
            )
            .unwrap();
        assert_eq!(n, 1);

        let mut buf = [0u8; SIGNAL_WIRE_SIZE];
        nix::unistd::read(req_r, &mut buf).unwrap();
        let sig = Signal::from_bytes(&buf);
        assert_eq!(sig.source, 1);
        assert_eq!(sig.id, SignalId::Ready as u8);
        assert!(time_in_range(sig.time));

        nix::unistd::close(req_r).ok();
        nix::unistd::close(bc_w).ok();
    }

    #[test]
    fn recv_rejects_fractional_signal() {
        let (ep, req_r, bc_w) = endpoint_pair();
        nix::unistd::write(bc_w, &[0u8; SIGNAL_WIRE_SIZE - 1]).unwrap();
        let err = ep.recv(false).unwrap_err();
        assert_eq!(err, MetError::Intrn);

        nix::unistd::close(req_r).ok();
        nix::unistd::close(bc_w).ok();
    }

    #[test]
    fn recv_returns_all_whole_signals_in_one_read() {
        let (ep, req_r, bc_w) = endpoint_pair();
        let sig = Signal {
            source: 0,
            id: SignalId::Null as u8,
            cargo: 0,
            time: 1.0,
        };
        let mut batch = Vec::new();
        batch.extend_from_slice(&sig.to_bytes());
        batch.extend_from_slice(&sig.to_bytes());
        nix::unistd::write(bc_w, &batch).unwrap();

        let got = ep.recv(false).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], sig);

        nix::unistd::close(req_r).ok();
        nix::unistd::close(bc_w).ok();
    }
}
