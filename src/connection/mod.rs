// src/connection/mod.rs

//! Owns the live connections of a worker: identities, the fd-indexed
//! registry table, and the lifecycle coordinator around it.

mod group;
mod id;
mod manager;
mod table;

pub use group::ManagerGroup;
pub use id::{ConnectionId, Timestamp};
pub use manager::{ConnectionManager, ManagerHandle};
pub use table::{ConnectionTable, Insertion};

use crate::core::multiplexer::EventKind;
use std::fmt;

/// A connection managed by a [`ConnectionTable`].
///
/// Implementors are built by an acceptor, handed over with
/// [`ManagerHandle::add_connection`], and from then on owned by exactly one
/// table slot. Dropping the object must release its socket; the table
/// withdraws multiplexer interest just before that happens.
///
/// A connection that wants to close itself keeps a [`ManagerHandle`] and
/// calls [`ManagerHandle::close_connection`] with its own identity. The
/// request is queued, so the object is destroyed only after the current
/// [`on_event`](Connection::on_event) call has returned.
pub trait Connection: Send + 'static {
    /// The identity assigned at construction. Must never change.
    fn id(&self) -> ConnectionId;

    /// Handles readiness of the connection's descriptor. Runs on the worker
    /// that owns the table.
    fn on_event(&mut self, event: EventKind);
}

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Requested by application code.
    Normal,
    /// The peer closed its side.
    PeerClosed,
    /// A socket or protocol error.
    Error,
    /// The heartbeat tracker found the connection idle.
    Timeout,
    /// Bulk teardown while the service stops.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Error => "error",
            CloseReason::Timeout => "timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether closing for this reason should also drop the identity from the
    /// heartbeat set. A timed-out identity was already dropped by the tracker,
    /// and at shutdown the tracker itself is going away.
    pub fn forgets_heartbeat(&self) -> bool {
        !matches!(self, CloseReason::Timeout | CloseReason::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
