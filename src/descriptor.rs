//! Immutable, parsed service configuration.
//!
//! Grounded in the original program's `conf.h`/`svc.h`: a `ServiceDescriptor` is produced once by
//! [`crate::config::load_file`] and never mutated again — the running [`crate::service::Service`]
//! only ever reads through a shared reference to one.

use nix::sys::signal::Signal;

pub const SVC_NAME_MAX: usize = 32;
pub const SVC_DESC_MAX: usize = 128;
pub const SVC_ENV_NAME_MAX: usize = 64;
pub const SVC_ENV_VALUE_MAX: usize = 1024;
pub const SVC_ARG_MAX: usize = 1024;

/// A single command to run, argv[0] included.
pub type Argv = Vec<String>;

/// Parsed, validated configuration for one service. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub origin: String,
    pub description: Option<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub environ: Vec<(String, String)>,
    pub start_cmds: Vec<Argv>,
    pub daemon: Option<Argv>,
    pub stop_cmds: Vec<Argv>,
    pub stop_sig: Signal,
    pub reload_sig: Signal,
    pub starton: Vec<String>,
    pub stopon: Vec<String>,
}

impl ServiceDescriptor {
    /// Invariant 7: the root configuration sequence must define at least one of start, stop, or
    /// daemon.
    pub fn has_action(&self) -> bool {
        !self.start_cmds.is_empty() || !self.stop_cmds.is_empty() || self.daemon.is_some()
    }
}
