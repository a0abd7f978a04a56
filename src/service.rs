//! Per-service state: the data half of the state machine described in SPEC_FULL.md §4.3.
//!
//! The transition logic itself lives on [`crate::repository::Repository`], since every
//! transition needs to reach across to other services (notifier sources, observer sinks) that a
//! lone `Service` has no access to. This module only owns the shape of one service's state,
//! grounded in the original program's `svc.h`.

use nix::unistd::Pid;
use std::time::Instant;

use crate::descriptor::ServiceDescriptor;

/// Stable handle into [`crate::repository::Repository`]. Cheap, `Copy`, never reused once
/// issued for the lifetime of the process (services are only ever appended, never removed,
/// except at final teardown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub usize);

/// Observed run state. Replaces the source's paired `handle_evts`/`handle_notif` function
/// pointers with a plain enum plus the `admin_on` flag below (REDESIGN FLAGS / §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

impl RunState {
    /// Numeric encoding used by the STATUS reply's `run_state` byte.
    pub fn as_u8(self) -> u8 {
        match self {
            RunState::Stopped => 0,
            RunState::Starting => 1,
            RunState::Ready => 2,
            RunState::Stopping => 3,
        }
    }
}

/// Which dependency relation an edge or notifier poll belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Starton,
    Stopon,
}

/// Events driving the per-service transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Stop,
    /// Exit status: non-negative is the process's exit code, negative is `-signo` for death by
    /// signal.
    Exit(i32),
}

/// One service's full mutable state. Owned by [`crate::repository::Repository`]; never touched
/// concurrently, since the whole supervisor runs on one thread.
#[derive(Debug)]
pub struct Service {
    pub descriptor: ServiceDescriptor,
    pub admin_on: bool,
    pub state: RunState,
    pub child: Option<Pid>,
    pub start_cmd_index: usize,
    /// `-1` (no command spawned yet this stop sequence) is represented as `None`; otherwise the
    /// index already spawned.
    pub stop_cmd_index: Option<usize>,
    pub timer_deadline: Option<Instant>,
    /// Bumped on every arm/disarm so the event loop's timer heap can discard stale entries
    /// instead of tracking cancellation explicitly.
    pub timer_generation: u64,

    /// Sources this service is still waiting on to reach READY before it may start.
    pub starton_notifiers: Vec<ServiceId>,
    /// Sources this service is still waiting on to reach STOPPED before it may stop.
    pub stopon_notifiers: Vec<ServiceId>,
    /// Sinks to notify when this service enters READY.
    pub starton_observers: Vec<ServiceId>,
    /// Sinks to notify when this service enters STOPPED.
    pub stopon_observers: Vec<ServiceId>,
}

impl Service {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Service {
            descriptor,
            admin_on: false,
            state: RunState::Stopped,
            child: None,
            start_cmd_index: 0,
            stop_cmd_index: None,
            timer_deadline: None,
            timer_generation: 0,
            starton_notifiers: Vec::new(),
            stopon_notifiers: Vec::new(),
            starton_observers: Vec::new(),
            stopon_observers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn notifiers(&self, kind: EdgeKind) -> &[ServiceId] {
        match kind {
            EdgeKind::Starton => &self.starton_notifiers,
            EdgeKind::Stopon => &self.stopon_notifiers,
        }
    }

    pub fn observers(&self, kind: EdgeKind) -> &[ServiceId] {
        match kind {
            EdgeKind::Starton => &self.starton_observers,
            EdgeKind::Stopon => &self.stopon_observers,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer_deadline.is_some()
    }

    pub fn arm(&mut self, deadline: Instant) {
        self.timer_deadline = Some(deadline);
        self.timer_generation += 1;
    }

    pub fn disarm(&mut self) {
        self.timer_deadline = None;
        self.timer_generation += 1;
    }
}
