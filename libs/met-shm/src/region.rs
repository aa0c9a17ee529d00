//! A mapped POSIX shared-memory region backing one slot (spec §3, §4.6).
//!
//! Grounded on `libs/shmempipe`'s `create`/`open_existing`: `shm_open` +
//! `ftruncate` + `mmap(MAP_SHARED)`, close the backing fd once mapped, and
//! `munmap` on drop.

use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use met_proto::MetError;

/// A mapped, fixed-capacity byte buffer shared between the writer and its
/// readers. Owns the mapping; does not own the shm name (callers `unlink`
/// it once, per the lifecycle in spec §4.6).
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the region is handed to exactly one controller's Slot, which is
// responsible for the reader/writer handshake serializing all access.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    pub fn create(name: &str, capacity: usize) -> Result<Self, MetError> {
        let flags = OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_TRUNC | OFlag::O_CLOEXEC;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let fd = mman::shm_open(name, flags, mode).map_err(|_| MetError::Syser)?;
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        file.set_len(capacity as u64).map_err(|_| MetError::Syser)?;
        Self::map(file, capacity)
    }

    pub fn open_existing(name: &str, capacity: usize) -> Result<Self, MetError> {
        let flags = OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let fd = mman::shm_open(name, flags, mode).map_err(|_| MetError::Syser)?;
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        Self::map(file, capacity)
    }

    fn map(file: std::fs::File, capacity: usize) -> Result<Self, MetError> {
        let len = NonZeroUsize::new(capacity).ok_or(MetError::Intrn)?;
        let ptr = unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|_| MetError::Syser)?;
        drop(file);

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(MetError::Syser)?;
        Ok(SharedRegion {
            ptr,
            len: capacity,
        })
    }

    /// Remove the shm filesystem name; existing mappings remain valid
    /// (spec §3's lifecycle: "unlinked after the initial readiness barrier").
    pub fn unlink(name: &str) -> Result<(), MetError> {
        mman::shm_unlink(name).map_err(|_| MetError::Syser)
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}
