// src/connection/group.rs

//! A group of connection managers sharing one acceptor.

use super::{Connection, ConnectionManager, ManagerHandle};
use crate::config::{HeartbeatConfig, TableConfig};
use crate::core::errors::NetError;
use crate::core::multiplexer::Multiplexer;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

/// Spreads connections over several independent managers.
///
/// Each manager keeps its own single-writer table; the group only starts and
/// stops them together and picks one, round-robin, for every new connection.
pub struct ManagerGroup<C: Connection> {
    managers: Vec<ConnectionManager<C>>,
    next: AtomicUsize,
}

impl<C: Connection> ManagerGroup<C> {
    pub fn new(
        name: &str,
        count: usize,
        table_config: TableConfig,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Result<Self, NetError> {
        if count == 0 {
            return Err(NetError::InvalidConfig(
                "a manager group needs at least one manager".to_string(),
            ));
        }
        let managers = (0..count)
            .map(|i| {
                ConnectionManager::new(
                    format!("{name}-{i}"),
                    table_config.clone(),
                    multiplexer.clone(),
                )
            })
            .collect();
        Ok(Self {
            managers,
            next: AtomicUsize::new(0),
        })
    }

    /// Starts every manager. If one fails, the ones already started are
    /// stopped again.
    pub fn start(&mut self, worker_count: usize) -> Result<(), NetError> {
        for i in 0..self.managers.len() {
            if let Err(e) = self.managers[i].start(worker_count) {
                for started in &mut self.managers[..i] {
                    let _ = started.stop();
                }
                return Err(e);
            }
        }
        info!("Started {} connection manager(s).", self.managers.len());
        Ok(())
    }

    pub fn enable_heartbeat(&mut self, config: &HeartbeatConfig) -> Result<(), NetError> {
        for manager in &mut self.managers {
            manager.enable_heartbeat(config)?;
        }
        Ok(())
    }

    /// Stops every manager, returning the first error encountered.
    pub fn stop(&mut self) -> Result<(), NetError> {
        let mut result = Ok(());
        for manager in &mut self.managers {
            if let Err(e) = manager.stop() {
                warn!("Manager '{}' stopped with an error: {}", manager.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// The handle of the manager that should own the next connection.
    pub fn next_handle(&self) -> ManagerHandle<C> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.managers.len();
        self.managers[index].handle()
    }

    pub fn handle(&self, index: usize) -> Option<ManagerHandle<C>> {
        self.managers.get(index).map(|m| m.handle())
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
