//! The write/read handshake over one shared-memory slot (spec §4.5).
//!
//! `WriterSlot` and `ReaderSlot` are deliberately separate types: a slot
//! has at most one writer and zero or more readers (spec §3), and giving
//! each role its own type makes "blocking read while also a writer" a
//! type-level question the combined handle in `met-ipc` answers, rather
//! than a runtime flag threaded through a single do-everything struct.

use crate::array::Array;
use crate::codec::{decode_slot, encode_slot};
use crate::event_counter::EventCounter;
use crate::region::SharedRegion;
use met_proto::MetError;

/// The single writer's end of a slot.
pub struct WriterSlot {
    region: SharedRegion,
    /// Non-semaphore: accumulates one post per reader per write.
    readers_counter: EventCounter,
    /// Semaphore, one per reader: the writer posts exactly one unit to each.
    writer_counters: Vec<EventCounter>,
    num_readers: u32,
    /// Readers acknowledged so far towards the next write, carried across
    /// calls (spec §4.5 step 3's "readers ready" accumulator).
    readers_ready: u32,
}

impl WriterSlot {
    pub fn new(
        region: SharedRegion,
        readers_counter: EventCounter,
        writer_counters: Vec<EventCounter>,
    ) -> Self {
        let num_readers = writer_counters.len() as u32;
        WriterSlot {
            region,
            readers_counter,
            writer_counters,
            num_readers,
            readers_ready: 0,
        }
    }

    pub fn num_readers(&self) -> u32 {
        self.num_readers
    }

    /// Raw fd to monitor for "may be postable" readiness (spec §4.3): do
    /// not read it directly, only poll it — reading is `write`'s job.
    pub fn readiness_fd(&self) -> std::os::unix::io::RawFd {
        self.readers_counter.as_raw_fd()
    }

    /// Non-blocking check: drains any newly-posted acknowledgements into
    /// the accumulator and reports whether all readers have now caught up.
    fn poll_ready(&mut self, blocking: bool) -> Result<bool, MetError> {
        if self.readers_ready >= self.num_readers {
            return Ok(true);
        }
        match self.readers_counter.read_once(blocking)? {
            Some(v) => {
                self.readers_ready += v as u32;
                Ok(self.readers_ready >= self.num_readers)
            }
            None => Ok(false),
        }
    }

    /// Write path (spec §4.5). Returns `true` if the batch was published,
    /// `false` if (non-blocking only) not all readers had drained yet.
    pub fn write(&mut self, arrays: &[Array], blocking: bool) -> Result<bool, MetError> {
        if blocking {
            loop {
                if self.poll_ready(true)? {
                    break;
                }
            }
        } else if !self.poll_ready(false)? {
            return Ok(false);
        }

        encode_slot(self.region.as_mut_slice(), arrays)?;

        for wc in &self.writer_counters {
            wc.post(1)?;
        }

        self.readers_ready = 0;
        Ok(true)
    }
}

/// One reader's end of a slot.
pub struct ReaderSlot {
    region: SharedRegion,
    /// Semaphore, this reader's own counter: drains exactly one unit per write.
    writer_counter: EventCounter,
    /// Non-semaphore, shared by all readers of the slot: this reader posts
    /// its acknowledgement here.
    readers_counter: EventCounter,
}

impl ReaderSlot {
    pub fn new(region: SharedRegion, writer_counter: EventCounter, readers_counter: EventCounter) -> Self {
        ReaderSlot {
            region,
            writer_counter,
            readers_counter,
        }
    }

    pub fn readiness_fd(&self) -> std::os::unix::io::RawFd {
        self.writer_counter.as_raw_fd()
    }

    /// Read path (spec §4.5). `Ok(None)` means no new data was posted.
    pub fn read(&mut self, blocking: bool) -> Result<Option<Vec<Array>>, MetError> {
        let posted = match self.writer_counter.read_once(blocking)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if posted == 0 {
            return Ok(None);
        }
        if posted != 1 {
            return Err(MetError::Intrn);
        }

        let arrays = decode_slot(self.region.as_slice())?;
        self.readers_counter.post(1)?;
        Ok(Some(arrays))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::NumericClass;

    /// The real lifecycle manager hands each controller its own dup'd fds
    /// across `fork`; here in-process we `dup` explicitly to get the same
    /// "two independent owners of one kernel counter" shape.
    fn dup_counter(c: &EventCounter) -> EventCounter {
        let fd = nix::unistd::dup(c.as_raw_fd()).unwrap();
        unsafe { EventCounter::from_raw_fd(fd) }
    }

    fn make_pair(name: &str, num_readers: usize) -> (WriterSlot, Vec<ReaderSlot>) {
        let w_region = SharedRegion::create(name, 4096).unwrap();
        let readers_counter_w = EventCounter::create(false, 0).unwrap();

        let mut writer_counters = Vec::new();
        let mut readers = Vec::new();
        for _ in 0..num_readers {
            let wc_writer_side = EventCounter::create(true, 0).unwrap();
            let wc_reader_side = dup_counter(&wc_writer_side);
            let r_region = SharedRegion::open_existing(name, 4096).unwrap();
            let r_readers_counter = dup_counter(&readers_counter_w);
            writer_counters.push(wc_writer_side);
            readers.push(ReaderSlot::new(r_region, wc_reader_side, r_readers_counter));
        }

        (
            WriterSlot::new(w_region, readers_counter_w, writer_counters),
            readers,
        )
    }

    #[test]
    fn single_reader_round_trip() {
        let name = format!("/met-shm-slot-test-{}", std::process::id());
        let (mut writer, mut readers) = make_pair(&name, 1);

        let arr = Array::Numeric {
            class: NumericClass::F64,
            dims: vec![2, 2],
            real: vec![9u8; 2 * 2 * 8],
            imag: None,
        };

        assert!(writer.write(std::slice::from_ref(&arr), false).unwrap());
        let got = readers[0].read(false).unwrap().unwrap();
        assert_eq!(got, vec![arr]);

        // not ready yet: reader hasn't been drained by the writer's next poll
        assert!(!writer.write(&[], false).unwrap());

        SharedRegion::unlink(&name).ok();
    }
}
