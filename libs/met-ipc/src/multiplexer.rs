//! The controller-side readiness wait over the broadcast pipe and every
//! shared-memory slot the controller touches (spec §4.3).
//!
//! Grounded on `original_source/c/metepoll.c`'s single `epoll` instance
//! registering every monitored descriptor, with a re-entered wait across
//! `EINTR` and a deadline recomputed from elapsed time. This multiplexer
//! is strictly non-destructive: it only ever calls `epoll_wait`, never a
//! `read` on any registered fd — draining a slot's counter is `Slot`'s
//! job, not the multiplexer's, so a readiness report can be produced
//! without racing the consumer that acts on it.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::unistd::close;

use met_proto::MetError;

/// Index into the slots registered with a multiplexer, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotToken(u32);

const BROADCAST_DATA: u64 = u64::MAX;

/// One readiness wait's outcome (spec §4.3): a timestamp taken
/// immediately before returning, whether the broadcast pipe has data,
/// and the ordered set of actionable slots.
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub timestamp: f64,
    pub broadcast_ready: bool,
    pub actionable_slots: Vec<SlotToken>,
}

fn now_as_met_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct ReadinessMultiplexer {
    epoll_fd: RawFd,
    slot_fds: Vec<RawFd>,
    /// Preallocated once at construction so the wait loop never allocates.
    events: Vec<EpollEvent>,
}

impl ReadinessMultiplexer {
    /// `broadcast_fd` is always registered; `slot_fds` are the per-slot
    /// descriptors to watch, in the order their readiness should be
    /// reported (the writer's readers'-counter fd for role `write`, the
    /// reader's writer-counter fd for role `read`, both for role `both`).
    pub fn new(broadcast_fd: RawFd, slot_fds: Vec<RawFd>) -> Result<Self, MetError> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|_| MetError::Syser)?;

        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, BROADCAST_DATA);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, broadcast_fd, &mut event)
            .map_err(|_| MetError::Syser)?;

        for (i, fd) in slot_fds.iter().enumerate() {
            let mut event = EpollEvent::new(EpollFlags::EPOLLIN, i as u64);
            epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, *fd, &mut event).map_err(|_| MetError::Syser)?;
        }

        let capacity = slot_fds.len() + 1;
        Ok(ReadinessMultiplexer {
            epoll_fd,
            slot_fds,
            events: vec![EpollEvent::empty(); capacity],
        })
    }

    /// Wait for readiness. `deadline == None` waits indefinitely; re-enters
    /// the kernel wait across `EINTR`, recomputing the remaining timeout
    /// from elapsed wall-clock time each time (spec §5).
    pub fn wait(&mut self, deadline: Option<Duration>) -> Result<ReadinessReport, MetError> {
        let start = Instant::now();

        loop {
            let timeout_ms: isize = match deadline {
                None => -1,
                Some(d) => {
                    let elapsed = start.elapsed();
                    if elapsed >= d {
                        0
                    } else {
                        (d - elapsed).as_millis() as isize
                    }
                }
            };

            match epoll_wait(self.epoll_fd, &mut self.events, timeout_ms) {
                Ok(n) => {
                    let timestamp = now_as_met_time();
                    let mut broadcast_ready = false;
                    let mut actionable_slots = Vec::with_capacity(n);
                    for ev in &self.events[..n] {
                        if ev.data() == BROADCAST_DATA {
                            broadcast_ready = true;
                        } else {
                            actionable_slots.push(SlotToken(ev.data() as u32));
                        }
                    }
                    actionable_slots.sort();
                    return Ok(ReadinessReport {
                        timestamp,
                        broadcast_ready,
                        actionable_slots,
                    });
                }
                Err(Errno::EINTR) => continue,
                Err(_) => return Err(MetError::Syser),
            }
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_fds.len()
    }
}

impl Drop for ReadinessMultiplexer {
    fn drop(&mut self) {
        let _ = close(self.epoll_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::write;

    #[test]
    fn reports_broadcast_readiness() {
        let (bc_r, bc_w) = nix::unistd::pipe().unwrap();
        let mut mux = ReadinessMultiplexer::new(bc_r, vec![]).unwrap();

        write(bc_w, b"x").unwrap();
        let report = mux.wait(Some(Duration::from_millis(500))).unwrap();
        assert!(report.broadcast_ready);
        assert!(report.actionable_slots.is_empty());

        nix::unistd::close(bc_r).ok();
        nix::unistd::close(bc_w).ok();
    }

    #[test]
    fn reports_slot_readiness_in_registration_order() {
        let (bc_r, _bc_w) = nix::unistd::pipe().unwrap();
        let (s0_r, s0_w) = nix::unistd::pipe().unwrap();
        let (s1_r, s1_w) = nix::unistd::pipe().unwrap();
        let mut mux = ReadinessMultiplexer::new(bc_r, vec![s0_r, s1_r]).unwrap();

        write(s1_w, b"y").unwrap();
        write(s0_w, b"x").unwrap();
        let report = mux.wait(Some(Duration::from_millis(500))).unwrap();
        assert!(!report.broadcast_ready);
        assert_eq!(report.actionable_slots, vec![SlotToken(0), SlotToken(1)]);

        for fd in [bc_r, s0_r, s0_w, s1_r, s1_w] {
            nix::unistd::close(fd).ok();
        }
    }

    #[test]
    fn times_out_with_nothing_ready() {
        let (bc_r, _bc_w) = nix::unistd::pipe().unwrap();
        let mut mux = ReadinessMultiplexer::new(bc_r, vec![]).unwrap();

        let report = mux.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(!report.broadcast_ready);
        assert!(report.actionable_slots.is_empty());

        nix::unistd::close(bc_r).ok();
    }
}
