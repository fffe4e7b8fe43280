// src/connection/table.rs

//! The connection registry: a single-writer table indexed by descriptor.
//!
//! The table lives on the primary worker of a [`ConnectionManager`] and is
//! only ever touched by tasks running there, so it carries no lock. Every
//! operation re-validates the identity it is given right before acting,
//! because the slot may have been recycled between posting and execution.
//!
//! [`ConnectionManager`]: super::ConnectionManager

use super::manager::ManagerHandle;
use super::{CloseReason, Connection, ConnectionId};
use crate::config::TableConfig;
use crate::core::errors::TableError;
use crate::core::metrics;
use crate::core::multiplexer::{EventKind, Multiplexer, ReadinessHandler, Registration};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    /// The slot still held a stale connection, which was destroyed.
    Replaced(ConnectionId),
}

// Field order matters: the registration is dropped, and the descriptor
// deregistered, before the connection releases its socket.
struct Slot<C> {
    id: ConnectionId,
    registration: Registration,
    connection: C,
}

/// Descriptor-indexed storage for live connections.
///
/// Invariants: the table never shrinks; an occupied slot's identity has the
/// slot index as its descriptor; each slot owns at most one connection.
pub struct ConnectionTable<C> {
    slots: Vec<Option<Slot<C>>>,
    len: usize,
    config: TableConfig,
    handle: ManagerHandle<C>,
    multiplexer: Arc<dyn Multiplexer>,
}

impl<C: Connection> ConnectionTable<C> {
    /// Creates a table. `handle` is used to route readiness events and
    /// heartbeat registrations back through the owning manager's queue.
    pub fn new(
        config: TableConfig,
        handle: ManagerHandle<C>,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Self {
        let initial = config.initial_capacity.min(config.max_capacity);
        let slots = (0..initial).map(|_| None).collect();
        metrics::TABLE_CAPACITY.add(initial as i64);
        Self {
            slots,
            len: 0,
            config,
            handle,
            multiplexer,
        }
    }

    /// Stores `connection` in the slot named by its descriptor and registers
    /// it for readiness.
    ///
    /// An occupied slot means an earlier connection was never removed. That
    /// stale occupant is destroyed and the new connection takes its place: the
    /// new connection must not depend on someone else's cleanup having run.
    pub fn insert(&mut self, connection: C) -> Result<Insertion, TableError> {
        let id = connection.id();
        if self.handle.is_stop_requested() {
            metrics::ADMISSIONS_REJECTED_TOTAL.inc();
            return Err(TableError::AdmissionRejected);
        }
        let index = self.reserve_slot(id)?;

        let replaced = match self.slots[index].take() {
            Some(stale) => {
                let stale_id = stale.id;
                warn!(
                    "Descriptor conflict: slot {} still held {} when {} arrived. Evicting the stale connection.",
                    index, stale_id, id
                );
                metrics::IDENTITY_CONFLICTS_TOTAL.inc();
                self.release(stale, "evicted");
                if let Some(heartbeat) = self.handle.heartbeat() {
                    heartbeat.async_remove(stale_id);
                }
                Some(stale_id)
            }
            None => None,
        };

        let registration = self.register(id);
        self.slots[index] = Some(Slot {
            id,
            registration,
            connection,
        });
        self.len += 1;
        metrics::CONNECTIONS_ACTIVE.inc();
        metrics::CONNECTIONS_ADDED_TOTAL.inc();

        if let Some(heartbeat) = self.handle.heartbeat() {
            heartbeat.async_add(id);
        }

        Ok(match replaced {
            Some(stale_id) => Insertion::Replaced(stale_id),
            None => Insertion::Inserted,
        })
    }

    /// Destroys the connection named by `id`.
    ///
    /// A miss (out of range, empty slot, or a newer occupant) is reported as
    /// `StaleReference` and changes nothing.
    pub fn remove(&mut self, id: &ConnectionId, reason: CloseReason) -> Result<(), TableError> {
        let index = self.live_index(id).ok_or_else(|| {
            metrics::STALE_REFERENCES_TOTAL.inc();
            TableError::StaleReference(id.descriptor())
        })?;
        if let Some(slot) = self.slots[index].take() {
            debug!("Closing connection {} (reason={}).", slot.id, reason);
            self.release(slot, reason.as_str());
        }
        Ok(())
    }

    /// Returns the live connection named by `id`, if any.
    ///
    /// The reference must not outlive the current task: the connection can be
    /// destroyed by the next one.
    pub fn lookup(&self, id: &ConnectionId) -> Option<&C> {
        match self.live_index(id) {
            Some(index) => self.slots[index].as_ref().map(|slot| &slot.connection),
            None => {
                debug!("Lookup for {} found no live connection.", id);
                None
            }
        }
    }

    pub fn lookup_mut(&mut self, id: &ConnectionId) -> Option<&mut C> {
        match self.live_index(id) {
            Some(index) => self.slots[index].as_mut().map(|slot| &mut slot.connection),
            None => {
                debug!("Lookup for {} found no live connection.", id);
                None
            }
        }
    }

    /// Delivers a readiness event to the connection named by `id`, then
    /// re-arms its descriptor. Returns false when the event was stale; a
    /// stale descriptor is left disarmed.
    pub fn dispatch(&mut self, id: &ConnectionId, event: EventKind) -> bool {
        match self.live_index(id) {
            Some(index) => {
                if let Some(slot) = self.slots[index].as_mut() {
                    slot.connection.on_event(event);
                }
                if let Err(e) = self.multiplexer.rearm(id.descriptor()) {
                    debug!("Re-arming {} failed: {}", id, e);
                }
                true
            }
            None => {
                metrics::STALE_REFERENCES_TOTAL.inc();
                debug!("Dropping {} event for stale connection {}.", event, id);
                false
            }
        }
    }

    /// Destroys every connection. Used once, during shutdown.
    ///
    /// The heartbeat set is deliberately not told about each connection; it
    /// is being torn down in the same shutdown sequence.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for index in 0..self.slots.len() {
            if let Some(slot) = self.slots[index].take() {
                self.release(slot, CloseReason::Shutdown.as_str());
                closed += 1;
            }
        }
        info!("Closed {} connection(s) on shutdown.", closed);
        closed
    }

    /// Current number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Identities of all live connections, in descriptor order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.slots.iter().flatten().map(|slot| slot.id).collect()
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub(crate) fn insert_logged(&mut self, connection: C) {
        let id = connection.id();
        match self.insert(connection) {
            Ok(Insertion::Inserted) => debug!("Connection {} added.", id),
            Ok(Insertion::Replaced(_)) => debug!("Connection {} added over a stale entry.", id),
            Err(e) => warn!("Connection {} not added: {}", id, e),
        }
    }

    pub(crate) fn remove_logged(&mut self, id: ConnectionId, reason: CloseReason) {
        if let Err(e) = self.remove(&id, reason) {
            debug!("Removal of {} (reason={}) missed: {}", id, reason, e);
        }
    }

    fn live_index(&self, id: &ConnectionId) -> Option<usize> {
        let index = id.slot()?;
        let slot = self.slots.get(index)?.as_ref()?;
        (slot.id.created() == id.created()).then_some(index)
    }

    /// Makes sure the slot for `id` exists, growing the table if needed.
    fn reserve_slot(&mut self, id: ConnectionId) -> Result<usize, TableError> {
        let descriptor = id.descriptor();
        let index = id
            .slot()
            .filter(|&index| index < self.config.max_capacity)
            .ok_or(TableError::GrowthBoundExceeded(descriptor))?;
        if index < self.slots.len() {
            return Ok(index);
        }

        let current = self.slots.len();
        let wanted = (index + 1)
            .max(current.saturating_mul(2))
            .min(self.config.max_capacity);
        let additional = wanted - current;
        if self.slots.try_reserve_exact(additional).is_err() {
            return Err(TableError::CapacityExhausted(descriptor));
        }
        self.slots.resize_with(wanted, || None);
        metrics::TABLE_CAPACITY.add(additional as i64);
        debug!(
            "Connection table grew from {} to {} slots for descriptor {}.",
            current, wanted, descriptor
        );
        Ok(index)
    }

    fn register(&self, id: ConnectionId) -> Registration {
        let descriptor = id.descriptor();
        let handle = self.handle.clone();
        let handler: ReadinessHandler = Arc::new(move |event| handle.dispatch(id, event));

        if let Err(e) =
            self.multiplexer
                .register_interest(descriptor, EventKind::Read, handler.clone(), true)
        {
            warn!("Registering read interest for {} failed: {}", id, e);
        }
        if let Err(e) =
            self.multiplexer
                .register_interest(descriptor, EventKind::Error, handler, false)
        {
            warn!("Registering error interest for {} failed: {}", id, e);
        }
        Registration::new(descriptor, self.multiplexer.clone())
    }

    fn release(&mut self, slot: Slot<C>, reason: &str) {
        self.len -= 1;
        metrics::CONNECTIONS_ACTIVE.dec();
        metrics::CONNECTIONS_CLOSED_TOTAL
            .with_label_values(&[reason])
            .inc();
        drop(slot);
    }
}

impl<C> Drop for ConnectionTable<C> {
    fn drop(&mut self) {
        metrics::CONNECTIONS_ACTIVE.sub(self.len as i64);
        metrics::TABLE_CAPACITY.sub(self.slots.len() as i64);
    }
}
