//! Resource creation, fork-exec, the initial-ready barrier, and shutdown
//! escalation (spec §4.6). Grounded on the teacher's RAII-on-drop style
//! (`shmempipe`'s typestate cleanup) for resource ownership, and on
//! `original_source/c/metserver.c` for the escalation timings.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::sys::signal::{kill, Signal as UnixSignal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, execvp, fork, pipe2, read, setpgid, tcsetpgrp, ForkResult, Pid};
use tracing::{info, warn};

use met_proto::{ready_cargo, ControllerId, MetError, Signal, SignalId, SIGNAL_WIRE_SIZE};
use met_shm::{EventCounter, SharedRegion};

use crate::config::{ChildSpec, LaunchConfig, SlotName, SlotRole, SLOTS};

const SLOT_CAPACITY_BYTES: usize = 1 << 20;
const BARRIER_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);
const SHUTDOWN_FINAL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct PipePair {
    server_fd: RawFd,
    child_fd: RawFd,
}

fn make_pipe() -> Result<PipePair, MetError> {
    let (r, w) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|_| MetError::Syser)?;
    Ok(PipePair { server_fd: r, child_fd: w })
}

struct SlotResources {
    name: String,
    region: SharedRegion,
    readers_counter: EventCounter,
    /// One semaphore counter per reader, in reader-declaration order.
    writer_counters: Vec<EventCounter>,
}

pub struct Resources {
    request: Vec<PipePair>,
    broadcast: Vec<PipePair>,
    slots: [Option<SlotResources>; 3],
    /// `reader_index[slot][child_idx]` is this child's position among the
    /// slot's readers, if it reads that slot.
    reader_index: [Vec<Option<usize>>; 3],
}

impl Resources {
    pub fn create(config: &LaunchConfig) -> Result<Self, MetError> {
        let n = config.num_children();
        let mut request = Vec::with_capacity(n);
        let mut broadcast = Vec::with_capacity(n);
        for _ in 0..n {
            request.push(make_pipe()?);
            broadcast.push(make_pipe()?);
        }

        let mut slots: [Option<SlotResources>; 3] = [None, None, None];
        let mut reader_index: [Vec<Option<usize>>; 3] =
            [vec![None; n], vec![None; n], vec![None; n]];

        for slot in SLOTS {
            let reader_count = config.declared_readers[slot.index()] as usize;
            if reader_count == 0 {
                continue;
            }

            let name = format!("/met-{}-{}", slot.as_str(), std::process::id());
            let region = SharedRegion::create(&name, SLOT_CAPACITY_BYTES)?;
            let readers_counter = EventCounter::create(false, 0)?;

            let mut writer_counters = Vec::with_capacity(reader_count);
            let mut k = 0;
            for (ci, child) in config.children.iter().enumerate() {
                if child.roles.contains(&(slot, SlotRole::Read)) {
                    reader_index[slot.index()][ci] = Some(k);
                    writer_counters.push(EventCounter::create(true, 0)?);
                    k += 1;
                }
            }

            slots[slot.index()] = Some(SlotResources {
                name,
                region,
                readers_counter,
                writer_counters,
            });
        }

        Ok(Resources {
            request,
            broadcast,
            slots,
            reader_index,
        })
    }

    fn unlink_all(&self) {
        for slot in SLOTS {
            if let Some(res) = &self.slots[slot.index()] {
                if let Err(e) = SharedRegion::unlink(&res.name) {
                    warn!(slot = slot.as_str(), kind = ?e, "shm unlink failed");
                }
            }
        }
    }

    pub fn request_server_fds(&self) -> Vec<RawFd> {
        self.request.iter().map(|p| p.server_fd).collect()
    }

    pub fn broadcast_server_fds(&self) -> Vec<RawFd> {
        self.broadcast.iter().map(|p| p.server_fd).collect()
    }
}

pub struct ChildProcess {
    pub pid: Pid,
    pub id: ControllerId,
}

/// Flags naming, for one child, every inherited-fd and shm-name argument
/// the lifecycle manager conveys across `exec` (spec §3's "file
/// descriptors pass across exec only for children that declared the
/// matching access mode"). The runtime on the other side of `exec` is
/// out of scope; this is the contract it must honor.
fn build_argv(ci: usize, spec: &ChildSpec, resources: &Resources) -> Vec<String> {
    let mut argv = vec![spec.function_name.clone()];
    argv.extend(spec.runtime_opts.split_whitespace().map(str::to_string));
    argv.extend(spec.passthrough.iter().cloned());

    argv.push("--met-request-fd".to_string());
    argv.push(resources.request[ci].child_fd.to_string());
    argv.push("--met-broadcast-fd".to_string());
    argv.push(resources.broadcast[ci].child_fd.to_string());

    for slot in SLOTS {
        let Some(role) = spec
            .roles
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, r)| *r)
        else {
            continue;
        };
        let res = resources.slots[slot.index()]
            .as_ref()
            .expect("validated slot has resources");

        argv.push(format!("--met-shm-{}-name", slot.as_str()));
        argv.push(res.name.clone());
        argv.push(format!("--met-shm-{}-readers-fd", slot.as_str()));
        argv.push(res.readers_counter.as_raw_fd().to_string());

        match role {
            SlotRole::Write => {
                argv.push(format!("--met-shm-{}-writer-fds", slot.as_str()));
                let fds: Vec<String> = res
                    .writer_counters
                    .iter()
                    .map(|c| c.as_raw_fd().to_string())
                    .collect();
                argv.push(fds.join(","));
            }
            SlotRole::Read => {
                let k = resources.reader_index[slot.index()][ci].expect("role Read implies index");
                argv.push(format!("--met-shm-{}-writer-fd", slot.as_str()));
                argv.push(res.writer_counters[k].as_raw_fd().to_string());
            }
        }
    }

    argv
}

fn lower_cloexec(fd: RawFd) -> Result<(), MetError> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(|_| MetError::Syser)?;
    let flags = nix::fcntl::FdFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFD(flags & !nix::fcntl::FdFlag::FD_CLOEXEC)).map_err(|_| MetError::Syser)?;
    Ok(())
}

/// Clear close-on-exec for exactly the descriptors `ci` needs, per its
/// declared roles (spec §4.6 step 3).
fn lower_cloexec_for_child(ci: usize, spec: &ChildSpec, resources: &Resources) -> Result<(), MetError> {
    lower_cloexec(resources.request[ci].child_fd)?;
    lower_cloexec(resources.broadcast[ci].child_fd)?;

    for slot in SLOTS {
        let Some(role) = spec
            .roles
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, r)| *r)
        else {
            continue;
        };
        let res = resources.slots[slot.index()].as_ref().expect("validated");
        lower_cloexec(res.readers_counter.as_raw_fd())?;
        match role {
            SlotRole::Write => {
                for c in &res.writer_counters {
                    lower_cloexec(c.as_raw_fd())?;
                }
            }
            SlotRole::Read => {
                let k = resources.reader_index[slot.index()][ci].expect("role Read implies index");
                lower_cloexec(res.writer_counters[k].as_raw_fd())?;
            }
        }
    }
    Ok(())
}

const STDIN_FILENO: RawFd = 0;

fn foreground(pgrp: Pid) {
    // Best-effort: under a CI harness with no controlling terminal this
    // legitimately fails and is not itself a launch error.
    if let Err(e) = tcsetpgrp(STDIN_FILENO, pgrp) {
        if e != Errno::ENOTTY && e != Errno::ENXIO {
            warn!(kind = ?e, "tcsetpgrp failed");
        }
    }
}

/// Fork and exec every child, all in one new foreground process group
/// (spec §4.6 step 3).
pub fn spawn_children(config: &LaunchConfig, resources: &Resources) -> Result<Vec<ChildProcess>, MetError> {
    let mut children = Vec::with_capacity(config.num_children());
    let mut pgrp: Option<Pid> = None;

    for (ci, spec) in config.children.iter().enumerate() {
        let id = ControllerId::child((ci + 1) as u8)?;
        let argv = build_argv(ci, spec, resources);

        match unsafe { fork() }.map_err(|_| MetError::Syser)? {
            ForkResult::Parent { child: pid } => {
                let target = pgrp.unwrap_or(pid);
                let _ = setpgid(pid, target);
                pgrp.get_or_insert(pid);
                info!(child = id.get(), pid = pid.as_raw(), "forked child");
                children.push(ChildProcess { pid, id });
            }
            ForkResult::Child => {
                let target = pgrp.unwrap_or_else(|| Pid::from_raw(0));
                let _ = setpgid(Pid::from_raw(0), target);

                if lower_cloexec_for_child(ci, spec, resources).is_err() {
                    std::process::exit(MetError::Syser.kind() as i32);
                }

                let prog = std::ffi::CString::new(argv[0].as_bytes()).expect("no interior nul");
                let cargs: Vec<std::ffi::CString> = argv
                    .iter()
                    .map(|a| std::ffi::CString::new(a.as_bytes()).expect("no interior nul"))
                    .collect();
                let _ = execvp(&prog, &cargs);
                std::process::exit(MetError::Syser.kind() as i32);
            }
        }
    }

    if let Some(pgrp) = pgrp {
        foreground(pgrp);
    }
    Ok(children)
}

/// Wait up to 60 s for exactly one `mready(reply)` from each child on its
/// own request pipe (spec §4.6 step 4).
pub fn initial_ready_barrier(resources: &Resources, children: &[ChildProcess]) -> Result<(), MetError> {
    let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|_| MetError::Syser)?;
    for (i, fd) in resources.request_server_fds().iter().enumerate() {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, i as u64);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, *fd, &mut event).map_err(|_| MetError::Syser)?;
    }

    let result = run_barrier(epoll_fd, resources, children);
    let _ = close(epoll_fd);
    result
}

fn run_barrier(epoll_fd: RawFd, resources: &Resources, children: &[ChildProcess]) -> Result<(), MetError> {
    let n = children.len();
    let mut replied = vec![false; n];
    let mut remaining = n;
    let start = Instant::now();
    let request_fds = resources.request_server_fds();
    let mut events = vec![EpollEvent::empty(); n];

    while remaining > 0 {
        let elapsed = start.elapsed();
        if elapsed >= BARRIER_TIMEOUT {
            return Err(MetError::Tmout);
        }
        let timeout_ms = (BARRIER_TIMEOUT - elapsed).as_millis() as isize;

        let ready = match epoll_wait(epoll_fd, &mut events, timeout_ms) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(_) => return Err(MetError::Syser),
        };

        for ev in &events[..ready] {
            let idx = ev.data() as usize;
            let fd = request_fds[idx];
            let mut buf = [0u8; SIGNAL_WIRE_SIZE];
            let n_read = match read(fd, &mut buf) {
                Ok(n) => n,
                Err(Errno::EAGAIN) => continue,
                Err(Errno::EPIPE) => return Err(MetError::Brkrp),
                Err(_) => return Err(MetError::Syser),
            };
            if n_read != SIGNAL_WIRE_SIZE {
                return Err(MetError::Intrn);
            }
            let sig = Signal::from_bytes(&buf);
            let owner = ControllerId::child((idx + 1) as u8)?;
            if sig.source != owner.get() || sig.id != SignalId::Ready as u8 || sig.cargo != ready_cargo::REPLY {
                return Err(MetError::Pbsig);
            }
            if replied[idx] {
                return Err(MetError::Pbsig);
            }
            replied[idx] = true;
            remaining -= 1;
        }
    }
    Ok(())
}

/// Broadcast a single `mwait(init)` stamped with a fresh wall-clock
/// reading (spec §4.6 step 6).
pub fn broadcast_init(resources: &Resources) -> Result<(), MetError> {
    let sig = Signal {
        source: ControllerId::SERVER.get(),
        id: SignalId::Wait as u8,
        cargo: met_proto::wait_cargo::INIT_OR_FINISH,
        time: crate::clock::now(),
    };
    let bytes = sig.to_bytes();
    for fd in resources.broadcast_server_fds() {
        match nix::unistd::write(fd, &bytes) {
            Ok(n) if n == bytes.len() => {}
            _ => return Err(MetError::Brkbp),
        }
    }
    Ok(())
}

pub fn unlink_shm(resources: &Resources) {
    resources.unlink_all();
}

/// Shutdown escalation (spec §4.6 step 7): broadcast `mquit`, wait up to
/// 20 s, close pipes to cascade broken-pipe signals, wait another 20 s,
/// finally kill the process group and wait 1 s.
pub fn shutdown(resources: &Resources, children: &[ChildProcess], final_error: MetError) {
    let quit = Signal {
        source: ControllerId::SERVER.get(),
        id: SignalId::Quit as u8,
        cargo: final_error.kind() as u16,
        time: crate::clock::now(),
    };
    let bytes = quit.to_bytes();
    for fd in resources.broadcast_server_fds() {
        let _ = nix::unistd::write(fd, &bytes);
    }

    if reap_all(children, SHUTDOWN_GRACE) {
        return;
    }

    for fd in resources.broadcast_server_fds() {
        let _ = close(fd);
    }
    for fd in resources.request_server_fds() {
        let _ = close(fd);
    }

    if reap_all(children, SHUTDOWN_GRACE) {
        return;
    }

    if let Some(first) = children.first() {
        let pgrp = Pid::from_raw(-first.pid.as_raw());
        let _ = kill(pgrp, UnixSignal::SIGKILL);
    }
    reap_all(children, SHUTDOWN_FINAL_WAIT);
}

/// Poll every child with `WNOHANG` until all have exited or `timeout`
/// elapses. Returns `true` once every child has been reaped.
fn reap_all(children: &[ChildProcess], timeout: Duration) -> bool {
    let start = Instant::now();
    let mut pending: Vec<Pid> = children.iter().map(|c| c.pid).collect();

    while !pending.is_empty() && start.elapsed() < timeout {
        pending.retain(|pid| !matches!(
            waitpid(*pid, Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..))
        ));
        if pending.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    pending.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChildSpec;

    fn sample_config() -> LaunchConfig {
        LaunchConfig {
            declared_readers: [0, 1, 0],
            children: vec![
                ChildSpec {
                    runtime_opts: String::new(),
                    roles: vec![(SlotName::Eye, SlotRole::Write)],
                    function_name: "stimfn".to_string(),
                    passthrough: vec![],
                },
                ChildSpec {
                    runtime_opts: String::new(),
                    roles: vec![(SlotName::Eye, SlotRole::Read)],
                    function_name: "recfn".to_string(),
                    passthrough: vec![],
                },
            ],
        }
    }

    #[test]
    fn argv_carries_fd_and_shm_name_flags_per_role() {
        let config = sample_config();
        let resources = Resources::create(&config).unwrap();

        let writer_argv = build_argv(0, &config.children[0], &resources);
        assert!(writer_argv.contains(&"--met-shm-eye-writer-fds".to_string()));
        assert!(writer_argv.contains(&"--met-shm-eye-name".to_string()));
        assert!(!writer_argv.iter().any(|a| a == "--met-shm-stim-name"));

        let reader_argv = build_argv(1, &config.children[1], &resources);
        assert!(reader_argv.contains(&"--met-shm-eye-writer-fd".to_string()));
        assert!(reader_argv.contains(&"--met-request-fd".to_string()));

        resources.unlink_all();
    }

    #[test]
    fn reap_all_detects_a_child_that_exits_immediately() {
        let pid = match unsafe { fork() }.unwrap() {
            ForkResult::Child => std::process::exit(0),
            ForkResult::Parent { child } => child,
        };
        let done = reap_all(&[ChildProcess { pid, id: ControllerId::child(1).unwrap() }], Duration::from_secs(2));
        assert!(done);
    }
}
