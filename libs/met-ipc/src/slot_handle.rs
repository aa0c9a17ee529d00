//! The per-controller shared-region access mode (spec §3, §4.5): a slot is
//! `write`, `read`, or `both`, fixed at launch. `Slot` wraps `met-shm`'s
//! `WriterSlot`/`ReaderSlot` in that role, and is the one place that
//! enforces the deadlock guard: a `both`-role slot may never be used
//! blocking, since the same controller would then be waiting on itself.

use met_proto::MetError;
use met_shm::{Array, ReaderSlot, WriterSlot};

pub enum Slot {
    Write(WriterSlot),
    Read(ReaderSlot),
    Both {
        writer: WriterSlot,
        reader: ReaderSlot,
    },
}

impl Slot {
    pub fn write(&mut self, arrays: &[Array], blocking: bool) -> Result<bool, MetError> {
        match self {
            Slot::Write(w) => w.write(arrays, blocking),
            Slot::Both { writer, .. } => {
                if blocking {
                    return Err(MetError::Intrn);
                }
                writer.write(arrays, false)
            }
            Slot::Read(_) => Err(MetError::Intrn),
        }
    }

    pub fn read(&mut self, blocking: bool) -> Result<Option<Vec<Array>>, MetError> {
        match self {
            Slot::Read(r) => r.read(blocking),
            Slot::Both { reader, .. } => {
                if blocking {
                    return Err(MetError::Intrn);
                }
                reader.read(false)
            }
            Slot::Write(_) => Err(MetError::Intrn),
        }
    }

    /// Descriptors the readiness multiplexer should monitor for this
    /// slot, in the order a `both`-role slot should report them: write
    /// readiness first, then read readiness.
    pub fn readiness_fds(&self) -> Vec<std::os::unix::io::RawFd> {
        match self {
            Slot::Write(w) => vec![w.readiness_fd()],
            Slot::Read(r) => vec![r.readiness_fd()],
            Slot::Both { writer, reader } => vec![writer.readiness_fd(), reader.readiness_fd()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use met_proto::MetError;
    use met_shm::{EventCounter, NumericClass, SharedRegion};

    fn dup(c: &EventCounter) -> EventCounter {
        let fd = nix::unistd::dup(c.as_raw_fd()).unwrap();
        unsafe { EventCounter::from_raw_fd(fd) }
    }

    #[test]
    fn both_role_rejects_blocking_write_and_read() {
        let name = format!("/met-ipc-slot-test-{}", std::process::id());
        let region_w = SharedRegion::create(&name, 4096).unwrap();
        let region_r = SharedRegion::open_existing(&name, 4096).unwrap();

        let readers_counter = EventCounter::create(false, 0).unwrap();
        let readers_counter_dup = dup(&readers_counter);
        let writer_counter = EventCounter::create(true, 0).unwrap();
        let writer_counter_dup = dup(&writer_counter);

        let writer = WriterSlot::new(region_w, readers_counter, vec![writer_counter]);
        let reader = ReaderSlot::new(region_r, writer_counter_dup, readers_counter_dup);
        let mut slot = Slot::Both { writer, reader };

        let arr = Array::Numeric {
            class: NumericClass::F64,
            dims: vec![1],
            real: vec![0u8; 8],
            imag: None,
        };

        assert_eq!(
            slot.write(std::slice::from_ref(&arr), true).unwrap_err(),
            MetError::Intrn
        );
        assert_eq!(slot.read(true).unwrap_err(), MetError::Intrn);

        assert!(slot.write(std::slice::from_ref(&arr), false).unwrap());

        SharedRegion::unlink(&name).ok();
    }
}
