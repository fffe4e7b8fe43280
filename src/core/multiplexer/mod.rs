// src/core/multiplexer/mod.rs

//! The readiness-multiplexer seam used by the connection registry.
//!
//! The registry never talks to the kernel directly. It registers interest for
//! a descriptor together with a handler, and the multiplexer invokes that
//! handler from its own thread whenever the descriptor becomes ready.

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::EpollMultiplexer;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// The kinds of readiness a connection registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Read,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Read => f.write_str("read"),
            EventKind::Error => f.write_str("error"),
        }
    }
}

/// Callback invoked by a multiplexer when a registered descriptor is ready.
pub type ReadinessHandler = Arc<dyn Fn(EventKind) + Send + Sync>;

/// A readiness multiplexer.
///
/// A persistent registration survives being fired; a non-persistent one
/// fires at most once and is then discarded. Either way a descriptor is
/// reported at most once per arming: after one of its handlers runs it stays
/// quiet until [`rearm`](Multiplexer::rearm) is called, so an owner that only
/// queues the work never sees the same readiness twice.
pub trait Multiplexer: Send + Sync {
    fn register_interest(
        &self,
        descriptor: RawFd,
        kind: EventKind,
        handler: ReadinessHandler,
        persistent: bool,
    ) -> io::Result<()>;

    /// Drops every registration for `descriptor`.
    fn deregister(&self, descriptor: RawFd) -> io::Result<()>;

    /// Re-enables delivery for `descriptor` once its last event was handled.
    /// Unknown descriptors are ignored.
    fn rearm(&self, descriptor: RawFd) -> io::Result<()>;
}

/// An RAII guard that deregisters its descriptor when dropped.
///
/// Table slots hold one of these next to their connection so that destroying
/// a slot always withdraws multiplexer interest before the connection (and
/// its socket) goes away.
pub struct Registration {
    descriptor: RawFd,
    multiplexer: Arc<dyn Multiplexer>,
}

impl Registration {
    pub fn new(descriptor: RawFd, multiplexer: Arc<dyn Multiplexer>) -> Self {
        Self {
            descriptor,
            multiplexer,
        }
    }

    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.multiplexer.deregister(self.descriptor) {
            tracing::debug!(
                "Deregistering descriptor {} failed: {}",
                self.descriptor,
                e
            );
        }
    }
}
