// src/core/heartbeat/set.rs

//! The heartbeat tracking set: identities ordered by last activity.

use crate::connection::ConnectionId;
use lru::LruCache;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tracks the last time each connection showed activity.
///
/// Entries are kept in least-recently-seen order, so expiring idle
/// identities only ever looks at the front of the set. Callers must feed
/// non-decreasing `now` values for that order to hold.
pub struct HeartbeatSet {
    entries: LruCache<ConnectionId, Instant>,
    timeout: Option<Duration>,
    max_tracked: Option<usize>,
}

impl HeartbeatSet {
    /// `None` for either limit means unbounded.
    pub fn new(timeout: Option<Duration>, max_tracked: Option<usize>) -> Self {
        Self {
            entries: LruCache::unbounded(),
            timeout,
            max_tracked,
        }
    }

    /// Starts tracking `id`. An already tracked identity is refreshed instead.
    /// Returns false when the set is full.
    pub fn add(&mut self, id: ConnectionId, now: Instant) -> bool {
        if let Some(seen) = self.entries.get_mut(&id) {
            debug!("Heartbeat element {} added twice, refreshing it.", id);
            *seen = now;
            return true;
        }
        if let Some(max) = self.max_tracked
            && self.entries.len() >= max
        {
            warn!(
                "Heartbeat set is full ({} elements), not tracking {}.",
                max, id
            );
            return false;
        }
        self.entries.put(id, now);
        true
    }

    /// Records activity for `id`.
    ///
    /// A miss is only logged at debug: a connection refused by a full set
    /// lands here on every read, and the refusal was already warned about.
    pub fn update(&mut self, id: ConnectionId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(seen) => {
                *seen = now;
                true
            }
            None => {
                debug!("Heartbeat element {} not found on update.", id);
                false
            }
        }
    }

    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        if self.entries.pop(id).is_some() {
            true
        } else {
            warn!("Heartbeat element {} not found on removal.", id);
            false
        }
    }

    /// Removes and returns every identity idle for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<ConnectionId> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        while let Some((_, seen)) = self.entries.peek_lru() {
            if now.saturating_duration_since(*seen) <= timeout {
                break;
            }
            if let Some((id, _)) = self.entries.pop_lru() {
                expired.push(id);
            }
        }
        expired
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_tracked(&self) -> Option<usize> {
        self.max_tracked
    }
}
