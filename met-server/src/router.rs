//! The server's signal-routing loop (spec §4.1), grounded on
//! `original_source/c/metepoll.c`'s single `epoll` instance over every
//! request pipe, re-armed on a 250 ms timeout so process-level signals
//! are still observed when the pipes stay silent.

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::unistd::{close, read, write};
use tracing::{debug, error, info, warn};

use met_proto::{
    atomic_signal_capacity, time_in_range, ControllerId, ErrorAccumulator, MetError, RouterState,
    Signal, SignalId, SignalOutcome, SIGNAL_WIRE_SIZE,
};

use crate::clock;
use crate::trial_index::TrialIndexFile;

const POLL_INTERVAL_MS: isize = 250;

pub struct Router {
    epoll_fd: RawFd,
    request_fds: Vec<RawFd>,
    broadcast_fds: Vec<RawFd>,
    awmsig: Vec<usize>,
    state: RouterState,
    trial_index: TrialIndexFile,
    errors: ErrorAccumulator,
}

impl Router {
    pub fn new(
        request_fds: Vec<RawFd>,
        broadcast_fds: Vec<RawFd>,
        trial_index: TrialIndexFile,
    ) -> Result<Self, MetError> {
        assert_eq!(request_fds.len(), broadcast_fds.len());
        let n = request_fds.len() as u8;

        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|_| MetError::Syser)?;
        let mut awmsig = Vec::with_capacity(request_fds.len());
        for (i, fd) in request_fds.iter().enumerate() {
            let mut event = EpollEvent::new(EpollFlags::EPOLLIN, i as u64);
            epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, *fd, &mut event).map_err(|_| MetError::Syser)?;
            awmsig.push(atomic_signal_capacity(*fd)?);
        }

        Ok(Router {
            epoll_fd,
            request_fds,
            broadcast_fds,
            awmsig,
            state: RouterState::new(n),
            trial_index,
            errors: ErrorAccumulator::new(),
        })
    }

    /// Run until an accepted `mquit` or a protocol breach. Returns the
    /// final error kind either way (`MetError::None` on clean shutdown),
    /// matching spec §6's "exit code is the last-recorded error kind".
    pub fn run(&mut self) -> MetError {
        let mut events = vec![EpollEvent::empty(); self.request_fds.len()];

        loop {
            let n = match epoll_wait(self.epoll_fd, &mut events, POLL_INTERVAL_MS) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(_) => return self.abort(MetError::Syser),
            };
            if n == 0 {
                continue; // periodic 250ms wake, nothing ready
            }

            let mut ready: Vec<usize> = events[..n].iter().map(|e| e.data() as usize).collect();
            ready.sort_unstable();

            // One shared, shrinking budget across every pipe drained into
            // this batch, so the combined broadcast never exceeds AWMSIG
            // (original_source/c/metsigsrv.c's `ns = awmsig - s - 1`).
            let mut remaining = self.awmsig.iter().copied().min().unwrap_or(1).saturating_sub(1).max(1);
            let mut batch = Vec::new();
            for &pipe_idx in &ready {
                if remaining == 0 {
                    break;
                }
                match self.drain_pipe(pipe_idx, &mut batch, &mut remaining) {
                    Ok(()) => {}
                    Err(e) => return self.abort(e),
                }
            }

            if batch.is_empty() {
                continue;
            }

            let quit_cargo = self.broadcast(&batch);

            if let Some(cargo) = quit_cargo {
                let kind = MetError::from_kind(cargo as u8).unwrap_or(MetError::Intrn);
                info!(cargo, "accepted mquit, exiting router loop");
                return kind;
            }
        }
    }

    /// Read whole signals ready on `request_fds[pipe_idx]`, bounded by the
    /// shared cross-pipe `remaining` budget, validate each, and append
    /// accepted signals (plus a synthesized `mstart` if the batch just
    /// closed the trial-init barrier) to `batch`. Decrements `remaining`
    /// by every signal actually pushed, including a synthesized `mstart`.
    fn drain_pipe(
        &mut self,
        pipe_idx: usize,
        batch: &mut Vec<Signal>,
        remaining: &mut usize,
    ) -> Result<(), MetError> {
        if *remaining == 0 {
            return Ok(());
        }
        let fd = self.request_fds[pipe_idx];
        let cap = (*remaining).min(self.awmsig[pipe_idx].saturating_sub(1).max(1));
        let mut buf = vec![0u8; cap * SIGNAL_WIRE_SIZE];

        let n = loop {
            match read(fd, &mut buf) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break 0,
                Err(Errno::EPIPE) => return Err(MetError::Brkrp),
                Err(_) => return Err(MetError::Syser),
            }
        };

        if n % SIGNAL_WIRE_SIZE != 0 {
            return Err(MetError::Intrn);
        }
        if n == 0 {
            return Ok(());
        }

        let owner = ControllerId::child((pipe_idx + 1) as u8)?;

        for chunk in buf[..n].chunks_exact(SIGNAL_WIRE_SIZE) {
            let raw: [u8; SIGNAL_WIRE_SIZE] = chunk.try_into().expect("chunks_exact");
            let sig = Signal::from_bytes(&raw);

            if sig.source != owner.get() {
                return Err(MetError::Pbsrc);
            }
            if !time_in_range(sig.time) {
                return Err(MetError::Pbtim);
            }
            let id = SignalId::try_from(sig.id)?;

            let outcome = self.state.apply(owner, id, sig.cargo)?;
            batch.push(sig);
            *remaining = remaining.saturating_sub(1);

            if outcome == SignalOutcome::AcceptedAndMstartRequired {
                let trial = self.trial_index.read()?;
                batch.push(Signal {
                    source: ControllerId::SERVER.get(),
                    id: SignalId::Start as u8,
                    cargo: trial,
                    time: clock::now(),
                });
                *remaining = remaining.saturating_sub(1);
                debug!(trial, "synthesized mstart");
            }
        }
        Ok(())
    }

    /// Broadcast `batch` to every child, attempting every pipe even after
    /// one fails (spec §4.1 step 6). Returns `Some(cargo)` if `batch`
    /// contains an accepted `mquit`.
    fn broadcast(&mut self, batch: &[Signal]) -> Option<u16> {
        let mut bytes = Vec::with_capacity(batch.len() * SIGNAL_WIRE_SIZE);
        for sig in batch {
            bytes.extend_from_slice(&sig.to_bytes());
        }

        for (i, fd) in self.broadcast_fds.iter().enumerate() {
            if let Err(e) = write_whole(*fd, &bytes) {
                let child = ControllerId::child((i + 1) as u8).ok();
                warn!(?child, kind = ?e, "broadcast failed for this pipe");
                self.errors.record(e);
            }
        }

        batch
            .iter()
            .find(|s| s.id == SignalId::Quit as u8)
            .map(|s| s.cargo)
    }

    /// Best-effort final `mquit` broadcast on the way out (spec §4.1
    /// failure semantics), then returns the accumulated error kind.
    fn abort(&mut self, err: MetError) -> MetError {
        error!(kind = ?err, "router aborting");
        self.errors.record(err);
        let final_kind = self.errors.get();

        let quit = Signal {
            source: ControllerId::SERVER.get(),
            id: SignalId::Quit as u8,
            cargo: final_kind.kind() as u16,
            time: clock::now(),
        };
        let bytes = quit.to_bytes();
        for fd in &self.broadcast_fds {
            let _ = write_whole(*fd, &bytes);
        }

        final_kind
    }
}

fn write_whole(fd: RawFd, buf: &[u8]) -> Result<(), MetError> {
    match write(fd, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(MetError::Intrn),
        Err(Errno::EAGAIN) => Err(MetError::Clgbp),
        Err(Errno::EPIPE) => Err(MetError::Brkbp),
        Err(_) => Err(MetError::Syser),
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let _ = close(self.epoll_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn pipe_nonblocking() -> (RawFd, RawFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        use nix::fcntl::{fcntl, FcntlArg, OFlag};
        for fd in [r, w] {
            let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
            fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).unwrap();
        }
        (r, w)
    }

    fn trial_file(value: &str) -> TrialIndexFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{value}").unwrap();
        let path = f.into_temp_path();
        let path = path.keep().unwrap();
        TrialIndexFile::new(path)
    }

    #[test]
    fn happy_trial_two_children_synthesizes_mstart() {
        let (req1_r, req1_w) = pipe_nonblocking();
        let (req2_r, req2_w) = pipe_nonblocking();
        let (bc1_r, bc1_w) = pipe_nonblocking();
        let (bc2_r, bc2_w) = pipe_nonblocking();

        let mut router = Router::new(
            vec![req1_r, req2_r],
            vec![bc1_w, bc2_w],
            trial_file("7"),
        )
        .unwrap();

        let send = |fd: RawFd, source: u8, id: SignalId, cargo: u16| {
            let sig = Signal {
                source,
                id: id as u8,
                cargo,
                time: 1.0,
            };
            nix::unistd::write(fd, &sig.to_bytes()).unwrap();
        };

        send(req1_w, 1, SignalId::Ready, met_proto::ready_cargo::TRIGGER);
        send(req1_w, 1, SignalId::Ready, met_proto::ready_cargo::REPLY);
        send(req2_w, 2, SignalId::Ready, met_proto::ready_cargo::REPLY);

        // drive one iteration manually via drain_pipe to avoid blocking on epoll_wait
        let mut batch = Vec::new();
        let mut remaining = usize::MAX;
        router.drain_pipe(0, &mut batch, &mut remaining).unwrap();
        router.drain_pipe(1, &mut batch, &mut remaining).unwrap();

        assert_eq!(batch.len(), 4);
        assert_eq!(batch[3].id, SignalId::Start as u8);
        assert_eq!(batch[3].cargo, 7);
        assert_eq!(batch[3].source, 0);

        for fd in [req1_r, req1_w, req2_r, req2_w, bc1_r, bc1_w, bc2_r, bc2_w] {
            nix::unistd::close(fd).ok();
        }
    }

    #[test]
    fn shared_budget_caps_the_combined_batch_across_pipes() {
        let (req1_r, req1_w) = pipe_nonblocking();
        let (req2_r, req2_w) = pipe_nonblocking();
        let (bc1_r, bc1_w) = pipe_nonblocking();
        let (bc2_r, bc2_w) = pipe_nonblocking();
        let mut router = Router::new(vec![req1_r, req2_r], vec![bc1_w, bc2_w], trial_file("0")).unwrap();

        let send = |fd: RawFd, source: u8| {
            let sig = Signal { source, id: SignalId::Null as u8, cargo: 0, time: 1.0 };
            nix::unistd::write(fd, &sig.to_bytes()).unwrap();
        };
        for _ in 0..2 {
            send(req1_w, 1);
            send(req2_w, 2);
        }

        // A budget of 3, shared across both pipes, must never let the
        // combined batch exceed 3 even though each pipe has 2 ready.
        let mut batch = Vec::new();
        let mut remaining = 3usize;
        router.drain_pipe(0, &mut batch, &mut remaining).unwrap();
        router.drain_pipe(1, &mut batch, &mut remaining).unwrap();

        assert!(batch.len() <= 3, "combined batch exceeded the shared AWMSIG budget");
        assert_eq!(remaining, 0);

        for fd in [req1_r, req1_w, req2_r, req2_w, bc1_r, bc1_w, bc2_r, bc2_w] {
            nix::unistd::close(fd).ok();
        }
    }

    #[test]
    fn mismatched_source_is_a_breach() {
        let (req1_r, req1_w) = pipe_nonblocking();
        let (bc1_r, bc1_w) = pipe_nonblocking();
        let mut router = Router::new(vec![req1_r], vec![bc1_w], trial_file("0")).unwrap();

        let sig = Signal {
            source: 2, // pipe 0 is owned by child 1
            id: SignalId::Null as u8,
            cargo: 0,
            time: 1.0,
        };
        nix::unistd::write(req1_w, &sig.to_bytes()).unwrap();

        let mut batch = Vec::new();
        let mut remaining = usize::MAX;
        let err = router.drain_pipe(0, &mut batch, &mut remaining).unwrap_err();
        assert_eq!(err, MetError::Pbsrc);

        for fd in [req1_r, req1_w, bc1_r, bc1_w] {
            nix::unistd::close(fd).ok();
        }
    }
}
