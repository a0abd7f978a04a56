//! Synchronous signal delivery via `signalfd`, wired into the tokio event loop.
//!
//! Grounded in the original program's `sigchan.c` (signalfd setup, RUNNING vs DRAINING dispatch)
//! and in the teacher's own [`crate::pidfd::PidFd`] for the raw-syscall-to-`AsyncFd<OwnedFd>`
//! wrapping pattern: open the fd with a raw syscall, wrap it in `OwnedFd`, hand that to
//! `AsyncFd::new`.

use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;

use crate::service::Event;

/// The signal set this supervisor cares about, matching the original's `sigchan_init` mask.
pub fn mask() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGUSR1);
    set.add(Signal::SIGUSR2);
    set.add(Signal::SIGPWR);
    set
}

/// Whether the event loop is still servicing notifications normally, or is in the drain phase
/// that only waits out already-running children before shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Running,
    Draining,
}

/// One decoded signalfd delivery translated into the supervisor's own vocabulary.
#[derive(Debug, Clone, Copy)]
pub enum SignalEvent {
    /// A child exited; `pid`/`event` identify which service and what happened.
    ChildExit { pid: nix::unistd::Pid, event: Event },
    /// A shutdown-class signal was received (SIGTERM/SIGUSR1/SIGUSR2/SIGPWR); only the first one
    /// observed determines the eventual reboot mode (see [`SignalChannel::shutdown_signal`]).
    Shutdown,
}

pub struct SignalChannel {
    fd: AsyncFd<OwnedFd>,
    mode: DispatchMode,
    drain_counter: u32,
    /// First shutdown-class signal observed; subsequent ones are recorded but do not change the
    /// eventual reboot mode (`reboot(mode)` in §6 is selected by the first one received).
    shutdown_signal: Option<Signal>,
}

impl SignalChannel {
    /// Blocks `mask()` on the calling thread (required before `signalfd` delivers anything
    /// through the fd rather than the default disposition) then opens the non-blocking signalfd.
    pub fn new() -> std::io::Result<Self> {
        let set = mask();
        nix::sys::signal::sigprocmask(nix::sys::signal::SigmaskHow::SIG_BLOCK, Some(&set), None)
            .map_err(std::io::Error::from)?;

        let raw_set: &libc::sigset_t = set.as_ref();
        let raw: RawFd = unsafe {
            libc::signalfd(
                -1,
                raw_set as *const libc::sigset_t,
                libc::SFD_CLOEXEC | libc::SFD_NONBLOCK,
            )
        };
        if raw < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        let fd = AsyncFd::new(owned)?;
        Ok(SignalChannel {
            fd,
            mode: DispatchMode::Running,
            drain_counter: 0,
            shutdown_signal: None,
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// The signal that triggered shutdown, if any has been observed yet. Used by the caller to
    /// pick `reboot(2)`'s mode: SIGTERM→reboot, SIGUSR1→halt, SIGUSR2/SIGPWR→power-off.
    pub fn shutdown_signal(&self) -> Option<Signal> {
        self.shutdown_signal
    }

    pub fn begin_running(&mut self) {
        self.mode = DispatchMode::Running;
    }

    /// Enters DRAINING with the drain counter set to `remaining` (how many services
    /// `TargetController::stop` observed as not yet STOPPED).
    pub fn begin_draining(&mut self, remaining: u32) {
        self.mode = DispatchMode::Draining;
        self.drain_counter = remaining;
    }

    /// Call once for every service that reaches STOPPED while draining. Returns `true` once the
    /// counter reaches zero, at which point the caller should terminate the loop.
    pub fn decrement_drain(&mut self) -> bool {
        debug_assert_eq!(self.mode, DispatchMode::Draining);
        self.drain_counter = self.drain_counter.saturating_sub(1);
        self.drain_counter == 0
    }

    /// Waits for the next signalfd delivery and translates it. SIGCHLD fans out into a reap loop
    /// (`waitid` with `WNOHANG`) that can itself yield zero, one, or more [`SignalEvent::ChildExit`]
    /// events per delivery; everything else is a single one-shot event. Draining mode still reaps
    /// children (so exits are observed) but callers are expected to ignore `Shutdown`/`UserSignal`
    /// while draining, per the original's `sigchan_dispatch` split.
    pub async fn recv(&mut self) -> std::io::Result<Vec<SignalEvent>> {
        loop {
            let mut guard = self.fd.readable_mut().await?;
            let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
            let n = unsafe {
                libc::read(
                    guard.get_inner().as_raw_fd(),
                    info.as_mut_ptr() as *mut libc::c_void,
                    std::mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    guard.clear_ready();
                    continue;
                }
                return Err(err);
            }
            guard.clear_ready();
            let info = unsafe { info.assume_init() };
            let signo = info.ssi_signo as i32;

            if signo == Signal::SIGCHLD as i32 {
                return Ok(self.reap_all());
            }
            if let Ok(sig) = Signal::try_from(signo) {
                if self.shutdown_signal.is_none() {
                    self.shutdown_signal = Some(sig);
                }
                return Ok(vec![SignalEvent::Shutdown]);
            }
        }
    }

    /// Drains every currently-reapable child via non-blocking `waitpid(-1, WNOHANG)`, matching
    /// the original's loop-until-`ECHILD` pattern so a single SIGCHLD delivery (which coalesces
    /// under POSIX) never loses a sibling exit.
    fn reap_all(&self) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    events.push(SignalEvent::ChildExit {
                        pid,
                        event: Event::Exit(code),
                    });
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    events.push(SignalEvent::ChildExit {
                        pid,
                        event: Event::Exit(-(sig as i32)),
                    });
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                _ => continue,
            }
        }
        events
    }
}
