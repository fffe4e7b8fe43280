// src/connection/id.rs

//! Connection identity: a descriptor plus the generation stamp that tells two
//! connections apart after the operating system recycles the descriptor.

use std::fmt;
use std::os::fd::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock creation stamp with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub micros: u32,
}

impl Timestamp {
    pub const fn new(secs: i64, micros: u32) -> Self {
        Self { secs, micros }
    }

    /// Reads the current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                micros: d.subsec_micros(),
            },
            // Clock set before 1970; keep the stamp ordered rather than failing.
            Err(e) => {
                let d = e.duration();
                Self {
                    secs: -(d.as_secs() as i64),
                    micros: d.subsec_micros(),
                }
            }
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

/// Names one connection instance across descriptor reuse.
///
/// Two identities refer to the same logical connection only when both the
/// descriptor and the creation stamp match. An identity is the only handle to
/// a connection that may cross a thread or task boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    descriptor: RawFd,
    created: Timestamp,
}

impl ConnectionId {
    pub const fn new(descriptor: RawFd, created: Timestamp) -> Self {
        Self {
            descriptor,
            created,
        }
    }

    /// Stamps `descriptor` with the current time.
    pub fn stamp(descriptor: RawFd) -> Self {
        Self::new(descriptor, Timestamp::now())
    }

    pub fn descriptor(&self) -> RawFd {
        self.descriptor
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// The table slot this identity maps to, if the descriptor is non-negative.
    pub(crate) fn slot(&self) -> Option<usize> {
        usize::try_from(self.descriptor).ok()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}@{}", self.descriptor, self.created)
    }
}
