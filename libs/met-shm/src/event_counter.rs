//! Kernel-backed event counters used as the reader/writer rendezvous
//! (spec §3, §4.5, §6), grounded on `libs/shmempipe`'s eventfd usage and
//! `original_source/c/meteventfd.c`.
//!
//! Two flavors share this type, distinguished only by the `EFD_SEMAPHORE`
//! flag at creation:
//! - the **readers' counter** (non-semaphore): `post` adds, a read drains
//!   the whole accumulated value in one call.
//! - a **writer-per-reader counter** (semaphore): `post` adds, a read
//!   always drains exactly one unit.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};

use met_proto::MetError;

pub struct EventCounter {
    fd: RawFd,
}

impl EventCounter {
    /// Create a new eventfd-backed counter, close-on-exec and non-blocking
    /// by default. `semaphore` selects `EFD_SEMAPHORE` read semantics.
    pub fn create(semaphore: bool, initial: u32) -> Result<Self, MetError> {
        let mut flags = EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK;
        if semaphore {
            flags |= EfdFlags::EFD_SEMAPHORE;
        }
        let fd = eventfd(initial, flags).map_err(|_| MetError::Syser)?;
        Ok(EventCounter { fd })
    }

    /// Wrap an inherited fd (post-fork, handed down by the lifecycle manager).
    ///
    /// # Safety
    /// `fd` must be a valid, open eventfd that this process now owns
    /// exclusively.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        EventCounter { fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Post `value` (always `1` for a writer-per-reader counter; any count
    /// for the readers' counter).
    pub fn post(&self, value: u64) -> Result<(), MetError> {
        match write(self.fd, &value.to_ne_bytes()) {
            Ok(8) => Ok(()),
            Ok(_) => Err(MetError::Intrn),
            Err(_) => Err(MetError::Syser),
        }
    }

    fn set_blocking(&self, blocking: bool) -> Result<(), MetError> {
        let cur = fcntl(self.fd, FcntlArg::F_GETFL).map_err(|_| MetError::Syser)?;
        let cur = OFlag::from_bits_truncate(cur);
        let new = if blocking {
            cur & !OFlag::O_NONBLOCK
        } else {
            cur | OFlag::O_NONBLOCK
        };
        fcntl(self.fd, FcntlArg::F_SETFL(new)).map_err(|_| MetError::Syser)?;
        Ok(())
    }

    /// Non-blocking drain. `Ok(None)` means the counter was at zero
    /// (EAGAIN); the caller should treat this as "no new data".
    fn try_read(&self) -> Result<Option<u64>, MetError> {
        let mut buf = [0u8; 8];
        match read(self.fd, &mut buf) {
            Ok(8) => Ok(Some(u64::from_ne_bytes(buf))),
            Ok(_) => Err(MetError::Intrn),
            Err(Errno::EAGAIN) => Ok(None),
            Err(_) => Err(MetError::Syser),
        }
    }

    /// Blocking drain, retrying across `EINTR` (spec §5's interruption rule).
    fn read_blocking(&self) -> Result<u64, MetError> {
        loop {
            let mut buf = [0u8; 8];
            match read(self.fd, &mut buf) {
                Ok(8) => return Ok(u64::from_ne_bytes(buf)),
                Ok(_) => return Err(MetError::Intrn),
                Err(Errno::EINTR) => continue,
                Err(_) => return Err(MetError::Syser),
            }
        }
    }

    /// Read the counter, blocking or not per `blocking`. The descriptor's
    /// blocking mode is toggled for the duration of the call and restored
    /// to non-blocking afterwards, matching the "restore blocking mode if
    /// changed" step in spec §4.5.
    pub fn read_once(&self, blocking: bool) -> Result<Option<u64>, MetError> {
        if !blocking {
            return self.try_read();
        }
        self.set_blocking(true)?;
        let result = self.read_blocking().map(Some);
        self.set_blocking(false)?;
        result
    }
}

impl Drop for EventCounter {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}
