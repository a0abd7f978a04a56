//! Single-threaded cooperative driver tying [`SignalChannel`], [`ControlServer`], and the
//! repository's timer together, grounded in the original program's `loop.c` readiness
//! multiplexer and in SPEC_FULL.md §4.7's `tokio::select!` mapping.

use std::path::PathBuf;

use tokio::time::Instant as TokioInstant;

use crate::control::ControlServer;
use crate::repository::Repository;
use crate::service::RunState;
use crate::signal_channel::{DispatchMode, SignalChannel, SignalEvent};
use crate::target;

pub struct EventLoop {
    pub repo: Repository,
    pub sigchan: SignalChannel,
    pub control: ControlServer,
    pub root: PathBuf,
    pub services_dir: PathBuf,
}

impl EventLoop {
    /// Runs until a shutdown signal is observed and the drain completes, returning the signal
    /// that triggered it so the caller can pick `reboot(2)`'s mode. Every wakeup handles exactly
    /// one of: a SignalChannel delivery, a control-plane datagram, or the nearest timer expiry —
    /// no worker is ever reentered while another is running, since everything executes on this
    /// one task.
    pub async fn run(&mut self) -> nix::sys::signal::Signal {
        loop {
            let timer = self.repo.next_timer();
            let sleep = async {
                match timer {
                    Some((deadline, _)) => tokio::time::sleep_until(TokioInstant::from_std(deadline)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                signals = self.sigchan.recv() => {
                    match signals {
                        Ok(events) => self.handle_signal_events(events),
                        Err(err) => tracing::error!("signal channel error: {err}"),
                    }
                }

                _ = self.control.socket().readable(), if !self.control.has_pending_writes() => {
                    self.control.service_one(&mut self.repo, &self.root, &self.services_dir).await;
                }

                _ = async {}, if self.control.has_pending_writes() => {
                    self.control.flush().await;
                }

                () = sleep => {
                    if let Some((_, id)) = self.repo.next_timer() {
                        self.repo.handle_timer_expiry(id);
                    }
                }
            }

            if self.sigchan.mode() == DispatchMode::Draining && self.drain_complete() {
                return self
                    .sigchan
                    .shutdown_signal()
                    .unwrap_or(nix::sys::signal::Signal::SIGTERM);
            }
        }
    }

    fn handle_signal_events(&mut self, events: Vec<SignalEvent>) {
        for event in events {
            match event {
                SignalEvent::ChildExit { pid, event } => {
                    if let Some(id) = self.repo.find_by_pid(pid) {
                        let was_active = matches!(
                            self.repo.service(id).state,
                            RunState::Starting | RunState::Ready | RunState::Stopping
                        );
                        self.repo.handle_event(id, event);
                        if was_active
                            && self.sigchan.mode() == DispatchMode::Draining
                            && self.repo.service(id).state == RunState::Stopped
                        {
                            // Bookkeeping only: `drain_complete()` below is the actual
                            // termination check, since it also covers the degenerate case of
                            // a drain that starts with nothing left to stop.
                            let _ = self.sigchan.decrement_drain();
                        }
                    } else {
                        tracing::debug!("reaped untracked pid {pid}");
                    }
                }
                SignalEvent::Shutdown => {
                    if self.sigchan.mode() == DispatchMode::Running {
                        tracing::info!("shutdown signal received, draining services");
                        target::stop(&mut self.repo, &mut self.sigchan);
                    }
                }
            }
        }
    }

    fn drain_complete(&self) -> bool {
        self.repo
            .ids()
            .all(|id| self.repo.service(id).state == RunState::Stopped)
    }
}
