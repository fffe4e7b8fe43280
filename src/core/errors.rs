// src/core/errors.rs

//! Defines the error types used by the connection-management core.

use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the status-returning operations of the core
/// (service start/stop, heartbeat activation, task posting).
#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Service '{0}' is already started")]
    AlreadyStarted(String),

    #[error("Invalid worker count {0}, at least one worker is required")]
    InvalidWorkerCount(usize),

    #[error("Service '{0}' has stopped and no longer accepts tasks")]
    ServiceStopped(String),

    #[error("A worker of service '{0}' panicked")]
    WorkerPanicked(String),

    #[error("Heartbeat tracking is already enabled")]
    HeartbeatAlreadyEnabled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for NetError {
    fn clone(&self) -> Self {
        match self {
            NetError::Io(e) => NetError::Io(Arc::clone(e)),
            NetError::AlreadyStarted(s) => NetError::AlreadyStarted(s.clone()),
            NetError::InvalidWorkerCount(n) => NetError::InvalidWorkerCount(*n),
            NetError::ServiceStopped(s) => NetError::ServiceStopped(s.clone()),
            NetError::WorkerPanicked(s) => NetError::WorkerPanicked(s.clone()),
            NetError::HeartbeatAlreadyEnabled => NetError::HeartbeatAlreadyEnabled,
            NetError::InvalidConfig(s) => NetError::InvalidConfig(s.clone()),
        }
    }
}

impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NetError::Io(e1), NetError::Io(e2)) => e1.kind() == e2.kind(),
            (NetError::AlreadyStarted(s1), NetError::AlreadyStarted(s2)) => s1 == s2,
            (NetError::InvalidWorkerCount(n1), NetError::InvalidWorkerCount(n2)) => n1 == n2,
            (NetError::ServiceStopped(s1), NetError::ServiceStopped(s2)) => s1 == s2,
            (NetError::WorkerPanicked(s1), NetError::WorkerPanicked(s2)) => s1 == s2,
            (NetError::InvalidConfig(s1), NetError::InvalidConfig(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Io(Arc::new(e))
    }
}

/// Outcomes of a registry operation that did not take effect.
///
/// None of these are fatal. The posted wrappers log them and move on; the
/// synchronous table API returns them so callers and tests can tell them apart.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// An insertion was attempted after shutdown began.
    #[error("connection rejected, the service is shutting down")]
    AdmissionRejected,

    /// The table could not allocate room for the descriptor.
    #[error("connection table could not grow to fit descriptor {0}")]
    CapacityExhausted(i32),

    /// The descriptor is negative or beyond the configured table bound.
    #[error("descriptor {0} is outside the allowed table range")]
    GrowthBoundExceeded(i32),

    /// The identity does not name the live occupant of its slot: the slot is
    /// out of range, empty, or already recycled by a newer connection.
    #[error("no live connection for descriptor {0} with the requested timestamp")]
    StaleReference(i32),
}
