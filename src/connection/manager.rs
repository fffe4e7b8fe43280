// src/connection/manager.rs

//! The connection-lifecycle coordinator.
//!
//! A [`ConnectionManager`] owns a task service whose primary worker holds the
//! [`ConnectionTable`], plus an optional heartbeat tracker. Everything that
//! changes the table is posted to that worker; the public entry points only
//! enqueue and never block.

use super::table::ConnectionTable;
use super::{CloseReason, Connection, ConnectionId};
use crate::config::{HeartbeatConfig, TableConfig};
use crate::core::errors::NetError;
use crate::core::heartbeat::{HeartbeatHandle, HeartbeatTracker};
use crate::core::multiplexer::{EventKind, Multiplexer};
use crate::core::task_service::{TaskHandle, TaskService};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A cloneable, thread-safe handle to a [`ConnectionManager`].
///
/// Every method is fire-and-forget and safe to call from any thread,
/// including from inside a connection's own event handler.
pub struct ManagerHandle<C> {
    tasks: TaskHandle<ConnectionTable<C>>,
    heartbeat: Arc<RwLock<Option<HeartbeatHandle>>>,
}

impl<C> Clone for ManagerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            heartbeat: self.heartbeat.clone(),
        }
    }
}

impl<C: Connection> ManagerHandle<C> {
    /// Queues `connection` for insertion. The outcome is only logged.
    pub fn add_connection(&self, connection: C) {
        let id = connection.id();
        if let Err(e) = self.tasks.post(move |table| table.insert_logged(connection)) {
            warn!("Dropping connection {}: {}", id, e);
        }
    }

    /// Queues removal of the connection named by `id`.
    pub fn remove_connection(&self, id: ConnectionId) {
        self.close_connection(id, CloseReason::Normal);
    }

    /// Queues removal with an explicit reason. Depending on the reason the
    /// identity is also dropped from the heartbeat set.
    pub fn close_connection(&self, id: ConnectionId, reason: CloseReason) {
        if reason.forgets_heartbeat() {
            self.heartbeat_forget(id);
        }
        if let Err(e) = self
            .tasks
            .post(move |table| table.remove_logged(id, reason))
        {
            debug!("Close of {} (reason={}) not queued: {}", id, reason, e);
        }
    }

    pub fn heartbeat_track(&self, id: ConnectionId) {
        if let Some(heartbeat) = self.heartbeat() {
            heartbeat.async_add(id);
        }
    }

    /// Records activity for `id`.
    pub fn heartbeat_touch(&self, id: ConnectionId) {
        if let Some(heartbeat) = self.heartbeat() {
            heartbeat.async_update(id);
        }
    }

    pub fn heartbeat_forget(&self, id: ConnectionId) {
        if let Some(heartbeat) = self.heartbeat() {
            heartbeat.async_remove(id);
        }
    }

    /// Runs `f` on the worker with the live connection named by `id`, or
    /// `None` if there is none by then.
    pub fn inspect<F>(&self, id: ConnectionId, f: F)
    where
        F: FnOnce(Option<&mut C>) + Send + 'static,
    {
        if let Err(e) = self.tasks.post(move |table| f(table.lookup_mut(&id))) {
            debug!("Inspection of {} not queued: {}", id, e);
        }
    }

    /// Runs `f` on the worker with exclusive access to the table.
    pub fn with_table<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionTable<C>) + Send + 'static,
    {
        if let Err(e) = self.tasks.post(f) {
            debug!("Table task not queued: {}", e);
        }
    }

    /// Runs a state-less job on the manager's workers.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.tasks.execute(job) {
            debug!("Job not queued: {}", e);
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.tasks.is_stop_requested()
    }

    pub(crate) fn dispatch(&self, id: ConnectionId, event: EventKind) {
        if let Err(e) = self.tasks.post(move |table| {
            table.dispatch(&id, event);
        }) {
            debug!("Dropping {} event for {}: {}", event, id, e);
        }
    }

    pub(crate) fn heartbeat(&self) -> Option<HeartbeatHandle> {
        self.heartbeat.read().clone()
    }
}

/// Owns a connection table, its worker, and an optional heartbeat tracker.
pub struct ConnectionManager<C: Connection> {
    service: TaskService<ConnectionTable<C>>,
    handle: ManagerHandle<C>,
    heartbeat: Option<HeartbeatTracker>,
    multiplexer: Arc<dyn Multiplexer>,
    table_config: TableConfig,
    stopped: bool,
}

impl<C: Connection> ConnectionManager<C> {
    pub fn new(
        name: impl Into<String>,
        table_config: TableConfig,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Self {
        let service = TaskService::new(name);
        let handle = ManagerHandle {
            tasks: service.handle(),
            heartbeat: Arc::new(RwLock::new(None)),
        };
        Self {
            service,
            handle,
            heartbeat: None,
            multiplexer,
            table_config,
            stopped: false,
        }
    }

    pub fn handle(&self) -> ManagerHandle<C> {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Starts the workers. The table always has a single writer, whatever
    /// `worker_count` is; extra workers only run jobs posted with `execute`.
    pub fn start(&mut self, worker_count: usize) -> Result<(), NetError> {
        if self.stopped {
            return Err(NetError::ServiceStopped(self.name().to_string()));
        }
        let table = ConnectionTable::new(
            self.table_config.clone(),
            self.handle.clone(),
            self.multiplexer.clone(),
        );
        self.service.start(worker_count, table)?;
        info!(
            "Connection manager '{}' started. Table capacity: {}.",
            self.name(),
            self.table_config.initial_capacity
        );
        Ok(())
    }

    /// Starts idle tracking. Timed-out connections are closed through the
    /// same queue as every other removal, never from the tracker's thread.
    pub fn enable_heartbeat(&mut self, config: &HeartbeatConfig) -> Result<(), NetError> {
        if self.heartbeat.is_some() {
            return Err(NetError::HeartbeatAlreadyEnabled);
        }
        if self.stopped {
            return Err(NetError::ServiceStopped(self.name().to_string()));
        }

        let mut tracker = HeartbeatTracker::new();
        tracker.configure(config.timeout, config.max_tracked);
        if let Some(interval) = config.sweep_interval {
            tracker.set_sweep_interval(interval);
        }
        let handle = self.handle.clone();
        tracker.set_timeout_callback(move |id| handle.close_connection(id, CloseReason::Timeout));
        tracker.start()?;

        *self.handle.heartbeat.write() = Some(tracker.handle());
        self.heartbeat = Some(tracker);
        info!("Heartbeat enabled for connection manager '{}'.", self.name());
        Ok(())
    }

    /// Shuts the manager down and waits for its workers.
    ///
    /// Order: refuse new admissions, queue the bulk close behind everything
    /// already posted, stop the heartbeat tracker, then drain and join the
    /// workers.
    pub fn stop(&mut self) -> Result<(), NetError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        info!("Stopping connection manager '{}'.", self.name());
        self.service.request_stop();

        if self.service.is_running() {
            self.handle.with_table(|table| {
                table.close_all();
            });
        }

        let mut result = Ok(());
        if let Some(mut tracker) = self.heartbeat.take() {
            *self.handle.heartbeat.write() = None;
            if let Err(e) = tracker.stop() {
                warn!("Heartbeat tracker stopped with an error: {}", e);
                result = Err(e);
            }
        }

        if let Err(e) = self.service.stop() {
            warn!("Task service stopped with an error: {}", e);
            result = Err(e);
        }
        info!("Connection manager '{}' stopped.", self.name());
        result
    }
}

impl<C: Connection> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
