//! Typed supervisor errors plus the `anyhow` boundary used by orchestration code.
//!
//! Per-service failures (spawn failures, abnormal exits, cycle rejections) never unwind the
//! event loop: they are logged and folded back into the service state machine. `Error` exists
//! for the handful of call sites — config loading, control-plane dispatch — that need to report
//! a specific reason to a caller rather than just log and move on.

use std::fmt::{Display, Formatter};

/// Errors surfaced by the supervisor's core components.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("service or target not found")]
    NotFound,
    #[error("dependency registration would form a cycle")]
    CycleDetected,
    #[error("malformed control-plane request")]
    ProtocolError,
    #[error("client credentials rejected")]
    CredentialRejected,
    #[error("status reply would exceed {0} bytes")]
    ReplyTooLarge(usize),
    #[error("invalid glob pattern")]
    BadPattern,
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),
}

impl SupervisorError {
    /// Maps an error onto the positive-errno convention used by the wire protocol's `ret` field.
    pub fn to_errno(&self) -> u16 {
        match self {
            SupervisorError::NotFound => libc::ENOENT as u16,
            SupervisorError::CycleDetected => libc::EINVAL as u16,
            SupervisorError::ProtocolError => libc::EBADMSG as u16,
            SupervisorError::CredentialRejected => libc::EACCES as u16,
            SupervisorError::ReplyTooLarge(_) => libc::ENOSPC as u16,
            SupervisorError::BadPattern => libc::EINVAL as u16,
            SupervisorError::ConfigInvalid(_) => libc::EINVAL as u16,
        }
    }
}

/// Opaque wrapper around `anyhow::Error`, used at the orchestration boundary (bootstrap, main,
/// shutdown) the same way the teacher wraps ad-hoc failures at its HTTP boundary.
#[derive(Debug)]
pub struct Error(anyhow::Error);

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error(err.into())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
