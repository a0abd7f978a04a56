//! Ordered collection of services plus the state-machine transition logic.
//!
//! Grounded in the original program's `repo.c` for loading/lookup and `svc.c` for the
//! transition functions (`svc_handle_on_evts`/`svc_handle_off_evts`/`svc_handle_on_notif`/
//! `svc_handle_off_notif`/timer expiry). The transition logic lives here rather than on
//! [`Service`] because every transition may need to reach across to other services (notifier
//! sources, observer sinks); with index-based handles there is nothing to borrow across call
//! boundaries, so a single `&mut Repository` threaded through the call graph replaces the
//! original's raw `svc *` pointer chasing.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::{self, ConfigError};
use crate::descriptor::ServiceDescriptor;
use crate::observer;
use crate::service::{EdgeKind, Event, RunState, Service, ServiceId};
use crate::spawn;

pub const START_CMD_TIMEOUT: Duration = Duration::from_secs(1);
pub const STOP_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Insertion-ordered collection of [`Service`]s, keyed additionally by name and origin filename.
pub struct Repository {
    services: Vec<Service>,
    by_name: HashMap<String, ServiceId>,
    by_origin: HashMap<String, ServiceId>,
}

impl Repository {
    pub fn new() -> Self {
        Repository {
            services: Vec::new(),
            by_name: HashMap::new(),
            by_origin: HashMap::new(),
        }
    }

    pub fn insert(&mut self, descriptor: ServiceDescriptor) -> ServiceId {
        let id = ServiceId(self.services.len());
        self.by_name.insert(descriptor.name.clone(), id);
        self.by_origin.insert(descriptor.origin.clone(), id);
        self.services.push(Service::new(descriptor));
        id
    }

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    pub fn service_mut(&mut self, id: ServiceId) -> &mut Service {
        &mut self.services[id.0]
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ServiceId> {
        (0..self.services.len()).map(ServiceId)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    pub fn find_by_origin(&self, origin: &str) -> Option<ServiceId> {
        self.by_origin.get(origin).copied()
    }

    /// Earliest still-armed timer across the whole repository, if any. Recomputed by scanning
    /// current deadlines each time rather than maintained as a standing min-heap — the same
    /// on-demand-over-incremental tradeoff `may_start`/`may_stop` make for notifier readiness,
    /// and it sidesteps any risk of the event loop's heap entry going stale relative to
    /// `timer_generation` (a disarm-then-rearm within one tick can never desync the two).
    pub fn next_timer(&self) -> Option<(Instant, ServiceId)> {
        self.services
            .iter()
            .enumerate()
            .filter_map(|(i, svc)| svc.timer_deadline.map(|deadline| (deadline, ServiceId(i))))
            .min_by_key(|&(deadline, _)| deadline)
    }

    /// Linear scan is acceptable per §4.1 — N is small for an embedded service repository.
    pub fn find_by_pid(&self, pid: Pid) -> Option<ServiceId> {
        self.services
            .iter()
            .position(|svc| svc.child == Some(pid))
            .map(ServiceId)
    }

    /// Loads every `*.conf` file directly under `dir`, then performs the starton/stopon wiring
    /// pass. Malformed files are skipped (logged), matching `tinit_repo_load`'s non-fatal
    /// behavior for individual bad entries. Returns the collected (non-fatal) errors alongside
    /// the populated repository.
    pub fn load(dir: &Path) -> std::io::Result<(Repository, Vec<ConfigError>)> {
        let mut repo = Repository::new();
        let mut errors = Vec::new();

        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|ext| ext == "conf").unwrap_or(false))
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            match config::load_file(&entry.path()) {
                Ok(descriptor) => {
                    repo.insert(descriptor);
                }
                Err(err) => {
                    tracing::warn!("{err}");
                    errors.push(err);
                }
            }
        }

        // Second pass: wire starton/stopon edges now that every service is known, so forward
        // references (a service naming one defined in a later file) resolve correctly.
        for id in repo.ids() {
            let starton = repo.service(id).descriptor.starton.clone();
            for name in starton {
                match repo.find_by_name(&name) {
                    Some(src) => {
                        observer::register_edge(&mut repo, src, id, EdgeKind::Starton);
                    }
                    None => tracing::warn!(
                        "{}: starton notifying service '{name}' not found.",
                        repo.service(id).name(),
                    ),
                }
            }
            let stopon = repo.service(id).descriptor.stopon.clone();
            for name in stopon {
                match repo.find_by_name(&name) {
                    Some(src) => {
                        observer::register_edge(&mut repo, src, id, EdgeKind::Stopon);
                    }
                    None => tracing::warn!(
                        "{}: stopon notifying service '{name}' not found.",
                        repo.service(id).name(),
                    ),
                }
            }
        }

        Ok((repo, errors))
    }

    // ---- state machine: event-driven transitions -------------------------------------------

    /// `svc_start`: installs on-handlers, enters STARTING, and (if not blocked on starton
    /// notifiers) dispatches the first start command.
    pub fn start(&mut self, id: ServiceId) {
        tracing::info!("{}: starting service...", self.service(id).name());
        let svc = self.service_mut(id);
        svc.admin_on = true;
        svc.state = RunState::Starting;
        svc.disarm();
        svc.start_cmd_index = 0;

        if self.may_start(id) {
            self.spawn_start_cmd(id);
        }
    }

    /// `svc_stop`: installs off-handlers, enters STOPPING, and kills any running child with the
    /// configured stop signal (or advances the stop sequence immediately if there is none).
    pub fn stop(&mut self, id: ServiceId) {
        tracing::info!("{}: stopping service...", self.service(id).name());
        let svc = self.service_mut(id);
        svc.admin_on = false;
        svc.state = RunState::Stopping;
        svc.disarm();
        svc.stop_cmd_index = None;

        if !self.may_stop(id) {
            return;
        }

        let stop_sig = self.service(id).descriptor.stop_sig;
        match self.kill(id, stop_sig) {
            Ok(()) => {
                let deadline = Instant::now() + STOP_CMD_TIMEOUT;
                self.service_mut(id).arm(deadline);
            }
            Err(_) => self.spawn_stop_cmd(id),
        }
    }

    /// `svc_reload`: valid only in READY; sends the reload signal without changing state.
    pub fn reload(&mut self, id: ServiceId) -> Result<(), ()> {
        if self.service(id).state != RunState::Ready {
            return Err(());
        }
        tracing::info!("{}: reloading service...", self.service(id).name());
        let sig = self.service(id).descriptor.reload_sig;
        self.kill(id, sig).map_err(|_| ())
    }

    /// Dispatches a top-level event (`START`/`STOP`/`EXIT`) according to whichever handler
    /// family (`on`/`off`) is currently installed, mirroring `svc_handle_on_evts`/
    /// `svc_handle_off_evts`.
    pub fn handle_event(&mut self, id: ServiceId, event: Event) {
        if self.service(id).admin_on {
            self.handle_on_event(id, event);
        } else {
            self.handle_off_event(id, event);
        }
    }

    fn handle_on_event(&mut self, id: ServiceId, event: Event) {
        match (self.service(id).state, event) {
            (RunState::Starting, Event::Start) => {}
            (RunState::Starting, Event::Stop) => self.stop(id),
            (RunState::Starting, Event::Exit(status)) => {
                if status == 0 {
                    self.service_mut(id).start_cmd_index += 1;
                    self.spawn_start_cmd(id);
                } else if !self.service(id).is_armed() {
                    self.spawn_start_cmd(id);
                } else {
                    self.service_mut(id).child = None;
                }
            }
            (RunState::Ready, Event::Start) => {}
            (RunState::Ready, Event::Stop) => self.stop(id),
            (RunState::Ready, Event::Exit(_)) => {
                if !self.service(id).is_armed() {
                    self.service_mut(id).state = RunState::Starting;
                    self.spawn_start_cmd(id);
                } else {
                    self.service_mut(id).child = None;
                }
            }
            (state, event) => {
                tracing::error!(
                    "{}: unexpected {event:?} in {state:?} (on).",
                    self.service(id).name()
                );
            }
        }
    }

    fn handle_off_event(&mut self, id: ServiceId, event: Event) {
        match (self.service(id).state, event) {
            (RunState::Stopped, Event::Start) => self.start(id),
            (RunState::Stopped, Event::Stop) => {}
            (RunState::Stopping, Event::Start) => self.start(id),
            (RunState::Stopping, Event::Stop) => {}
            (RunState::Stopping, Event::Exit(_)) => self.spawn_stop_cmd(id),
            (state, event) => {
                tracing::error!(
                    "{}: unexpected {event:?} in {state:?} (off).",
                    self.service(id).name()
                );
            }
        }
    }

    /// Upstream notification: `src` just transitioned. Dispatches on edge `kind`, not on `sink`'s
    /// admin flag — a starton edge is only ever actionable for a sink waiting in STARTING, and a
    /// stopon edge only for a sink waiting in STOPPING, which `handle_on_notif`/`handle_off_notif`
    /// already guard on their own.
    pub fn notify(&mut self, sink: ServiceId, src: ServiceId, kind: EdgeKind) {
        match kind {
            EdgeKind::Starton => self.handle_on_notif(sink, src, kind),
            EdgeKind::Stopon => self.handle_off_notif(sink, src, kind),
        }
    }

    fn handle_on_notif(&mut self, sink: ServiceId, src: ServiceId, kind: EdgeKind) {
        debug_assert_eq!(kind, EdgeKind::Starton);
        match self.service(sink).state {
            RunState::Starting => {}
            RunState::Ready => return,
            _ => return,
        }
        if self.service(src).state != RunState::Ready {
            return;
        }
        if self.may_start(sink) {
            self.spawn_start_cmd(sink);
        }
    }

    fn handle_off_notif(&mut self, sink: ServiceId, src: ServiceId, kind: EdgeKind) {
        debug_assert_eq!(kind, EdgeKind::Stopon);
        match self.service(sink).state {
            RunState::Stopped => return,
            RunState::Stopping => {}
            _ => return,
        }
        if self.service(src).state != RunState::Stopped {
            return;
        }
        if self.may_stop(sink) {
            self.spawn_stop_cmd(sink);
        }
    }

    /// Whether every starton-notifier source has reached READY (no literal decrementing
    /// counter — recomputed by scanning current source states, see `observer.rs`'s module doc).
    fn may_start(&self, id: ServiceId) -> bool {
        self.service(id)
            .starton_notifiers
            .iter()
            .all(|&src| self.service(src).state == RunState::Ready)
    }

    /// Whether every stopon-notifier source has reached STOPPED.
    fn may_stop(&self, id: ServiceId) -> bool {
        self.service(id)
            .stopon_notifiers
            .iter()
            .all(|&src| self.service(src).state == RunState::Stopped)
    }

    /// `svc_spawn_start_cmd`: spawns the next start command, or the daemon once the start
    /// sequence is exhausted, marking the service READY in that same call — a daemon does not
    /// wait for its own EXIT event to be considered "started".
    fn spawn_start_cmd(&mut self, id: ServiceId) {
        let svc = self.service(id);
        let (argv, mark_ready) = if svc.start_cmd_index < svc.descriptor.start_cmds.len() {
            (Some(svc.descriptor.start_cmds[svc.start_cmd_index].clone()), false)
        } else {
            (svc.descriptor.daemon.clone(), true)
        };

        if let Some(argv) = argv {
            if !self.try_spawn(id, &argv, START_CMD_TIMEOUT) {
                return;
            }
        } else {
            self.service_mut(id).child = None;
        }

        if mark_ready {
            self.mark_ready(id);
        }
    }

    /// `svc_spawn_stop_cmd`: advances `stop_cmd_index`; marks STOPPED once the stop sequence is
    /// exhausted, otherwise spawns the next stop command.
    fn spawn_stop_cmd(&mut self, id: ServiceId) {
        let next = self.service(id).stop_cmd_index.map_or(0, |i| i + 1);
        if next >= self.service(id).descriptor.stop_cmds.len() {
            self.mark_stopped(id);
            return;
        }
        self.service_mut(id).stop_cmd_index = Some(next);
        let argv = self.service(id).descriptor.stop_cmds[next].clone();
        self.try_spawn(id, &argv, STOP_CMD_TIMEOUT);
    }

    /// Returns `true` if a child was actually spawned (vs. a fork/exec failure, which leaves the
    /// child slot empty and the timer disarmed so the service waits for STOP or another
    /// notification rather than respawning in a tight loop).
    fn try_spawn(&mut self, id: ServiceId, argv: &[String], timeout: Duration) -> bool {
        let descriptor = self.service(id).descriptor.clone();
        match spawn::spawn_child(&descriptor, argv) {
            Ok(pid) => {
                let svc = self.service_mut(id);
                svc.child = Some(pid);
                svc.arm(Instant::now() + timeout);
                true
            }
            Err(_) => {
                self.service_mut(id).child = None;
                false
            }
        }
    }

    fn kill(&self, id: ServiceId, signal: Signal) -> Result<(), nix::Error> {
        match self.service(id).child {
            Some(pid) => kill(pid, signal),
            None => Err(nix::Error::ESRCH),
        }
    }

    /// `svc_mark_ready`: sets state, then synchronously notifies every starton-observer sink.
    fn mark_ready(&mut self, id: ServiceId) {
        self.service_mut(id).state = RunState::Ready;
        tracing::info!("{}: service ready.", self.service(id).name());
        let sinks = self.service(id).starton_observers.clone();
        for sink in sinks {
            self.notify(sink, id, EdgeKind::Starton);
        }
    }

    /// `svc_mark_stopped`: sets state, clears the child slot, then synchronously notifies every
    /// stopon-observer sink.
    fn mark_stopped(&mut self, id: ServiceId) {
        let svc = self.service_mut(id);
        svc.child = None;
        svc.state = RunState::Stopped;
        tracing::info!("{}: service stopped.", self.service(id).name());
        let sinks = self.service(id).stopon_observers.clone();
        for sink in sinks {
            self.notify(sink, id, EdgeKind::Stopon);
        }
    }

    // ---- timer expiry -----------------------------------------------------------------------

    /// `svc_expire_on`/`svc_expire_off` combined: dispatch depends on which handler family is
    /// currently installed.
    pub fn handle_timer_expiry(&mut self, id: ServiceId) {
        self.service_mut(id).disarm();
        if self.service(id).admin_on {
            self.expire_on(id);
        } else {
            self.expire_off(id);
        }
    }

    fn expire_on(&mut self, id: ServiceId) {
        match self.service(id).state {
            RunState::Ready => {}
            RunState::Starting => {
                if self.service(id).child.is_none() {
                    self.spawn_start_cmd(id);
                }
            }
            _ => {}
        }
    }

    fn expire_off(&mut self, id: ServiceId) {
        match self.service(id).state {
            RunState::Stopped => {}
            RunState::Stopping => {
                if self.kill(id, Signal::SIGKILL).is_err() {
                    self.spawn_stop_cmd(id);
                }
            }
            _ => {}
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ServiceDescriptor;
    use tempfile::tempdir;

    fn daemon_descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_owned(),
            origin: format!("{name}.conf"),
            description: None,
            stdin: None,
            stdout: None,
            environ: Vec::new(),
            start_cmds: Vec::new(),
            daemon: Some(vec!["/bin/true".to_owned()]),
            stop_cmds: Vec::new(),
            stop_sig: Signal::SIGTERM,
            reload_sig: Signal::SIGTERM,
            starton: Vec::new(),
            stopon: Vec::new(),
        }
    }

    #[test]
    fn lookup_by_name_and_origin() {
        let mut repo = Repository::new();
        let id = repo.insert(daemon_descriptor("echo"));
        assert_eq!(repo.find_by_name("echo"), Some(id));
        assert_eq!(repo.find_by_origin("echo.conf"), Some(id));
        assert_eq!(repo.find_by_name("missing"), None);
    }

    #[test]
    fn load_skips_malformed_and_wires_starton() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.conf"),
            r#"name = "a"; daemon = ( "/bin/true" ); starton = ( "b" );"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.conf"),
            r#"name = "b"; daemon = ( "/bin/true" );"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.conf"), "not a valid file").unwrap();

        let (repo, errors) = Repository::load(dir.path()).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(repo.len(), 2);

        let a = repo.find_by_name("a").unwrap();
        let b = repo.find_by_name("b").unwrap();
        assert_eq!(repo.service(a).starton_notifiers, vec![b]);
        assert_eq!(repo.service(b).starton_observers, vec![a]);
    }

    #[test]
    fn start_without_dependency_reaches_starting() {
        let mut repo = Repository::new();
        let id = repo.insert(daemon_descriptor("echo"));
        repo.start(id);
        // try_spawn calls fork() for real in this unit test environment; we only assert the
        // bookkeeping fields that don't require the child to actually exist yet.
        assert!(repo.service(id).admin_on);
    }

    #[test]
    fn stop_on_stopped_service_is_noop() {
        let mut repo = Repository::new();
        let id = repo.insert(daemon_descriptor("echo"));
        repo.handle_event(id, Event::Stop);
        assert_eq!(repo.service(id).state, RunState::Stopped);
    }

    #[test]
    fn chained_start_waits_for_upstream_ready() {
        let mut repo = Repository::new();
        let a = repo.insert(daemon_descriptor("a"));
        let b = repo.insert(daemon_descriptor("b"));
        observer::register_edge(&mut repo, b, a, EdgeKind::Starton);

        repo.service_mut(a).admin_on = true;
        repo.service_mut(a).state = RunState::Starting;
        assert!(!repo.may_start(a));

        repo.service_mut(b).state = RunState::Ready;
        assert!(repo.may_start(a));
    }
}
