// src/core/heartbeat/mod.rs

//! The heartbeat tracker: a background service that closes idle connections.
//!
//! The tracker owns a [`HeartbeatSet`] on its own thread. Other threads talk
//! to it only through a [`HeartbeatHandle`], and it reports timed-out
//! identities through a callback. It never touches the connection table.

mod set;

pub use set::HeartbeatSet;

use crate::connection::ConnectionId;
use crate::core::errors::NetError;
use crate::core::metrics;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{Dispatch, debug, error, info};

/// Called on the tracker thread for every identity that timed out.
pub type TimeoutCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Add(ConnectionId),
    Update(ConnectionId),
    Remove(ConnectionId),
}

/// A cloneable handle for feeding activity into a [`HeartbeatTracker`].
///
/// All calls are fire-and-forget. Once the tracker has stopped they are
/// dropped with a debug log.
#[derive(Clone)]
pub struct HeartbeatHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl HeartbeatHandle {
    pub fn async_add(&self, id: ConnectionId) {
        self.send(Command::Add(id));
    }

    pub fn async_update(&self, id: ConnectionId) {
        self.send(Command::Update(id));
    }

    pub fn async_remove(&self, id: ConnectionId) {
        self.send(Command::Remove(id));
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Heartbeat tracker is stopped, dropping request.");
        }
    }
}

/// Tracks connection activity and reports identities idle beyond a timeout.
pub struct HeartbeatTracker {
    timeout: Option<Duration>,
    max_tracked: Option<usize>,
    sweep_interval: Option<Duration>,
    callback: Option<TimeoutCallback>,
    tx: mpsc::UnboundedSender<Command>,
    rx: Option<mpsc::UnboundedReceiver<Command>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            timeout: None,
            max_tracked: None,
            sweep_interval: None,
            callback: None,
            tx,
            rx: Some(rx),
            shutdown_tx: None,
            thread: None,
        }
    }

    /// Sets the idle timeout and the tracking limit. `None` means unbounded.
    pub fn configure(&mut self, timeout: Option<Duration>, max_tracked: Option<usize>) {
        self.timeout = timeout;
        self.max_tracked = max_tracked;
    }

    /// Sets how often idle identities are swept. Defaults to the timeout,
    /// capped at one second.
    pub fn set_sweep_interval(&mut self, interval: Duration) {
        self.sweep_interval = Some(interval);
    }

    pub fn set_timeout_callback<F>(&mut self, callback: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    pub fn handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    fn sweep_interval(&self) -> Duration {
        self.sweep_interval.unwrap_or_else(|| {
            self.timeout
                .map(|t| t.min(DEFAULT_SWEEP_INTERVAL))
                .unwrap_or(DEFAULT_SWEEP_INTERVAL)
        })
    }

    /// Spawns the tracker thread. It logs through the subscriber that is
    /// current on the calling thread.
    pub fn start(&mut self) -> Result<(), NetError> {
        if self.is_running() {
            return Err(NetError::AlreadyStarted("heartbeat".to_string()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(NetError::InvalidConfig(
                "heartbeat timeout must be greater than zero".to_string(),
            ));
        }
        let sweep = self.sweep_interval();
        if sweep.is_zero() {
            return Err(NetError::InvalidConfig(
                "heartbeat sweep interval must be greater than zero".to_string(),
            ));
        }
        let rx = self
            .rx
            .take()
            .ok_or_else(|| NetError::ServiceStopped("heartbeat".to_string()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let set = HeartbeatSet::new(self.timeout, self.max_tracked);
        let callback = self.callback.clone();
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);

        let thread = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    runtime.block_on(run(set, rx, shutdown_rx, sweep, callback))
                })
            })?;

        self.shutdown_tx = Some(shutdown_tx);
        self.thread = Some(thread);
        info!(
            "Heartbeat tracker started. Timeout: {:?}. Max tracked: {:?}. Sweep interval: {:?}.",
            self.timeout, self.max_tracked, sweep
        );
        Ok(())
    }

    /// Stops the tracker thread and waits for it. Pending requests are dropped.
    pub fn stop(&mut self) -> Result<(), NetError> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if thread.join().is_err() {
            error!("Heartbeat tracker thread panicked.");
            return Err(NetError::WorkerPanicked("heartbeat".to_string()));
        }
        Ok(())
    }
}

impl Drop for HeartbeatTracker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn run(
    mut set: HeartbeatSet,
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
    sweep: Duration,
    callback: Option<TimeoutCallback>,
) {
    let mut interval = tokio::time::interval(sweep);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                info!("Heartbeat tracker shutting down with {} tracked element(s).", set.len());
                return;
            }
            Some(command) = rx.recv() => {
                let now = Instant::now();
                match command {
                    Command::Add(id) => { set.add(id, now); }
                    Command::Update(id) => { set.update(id, now); }
                    Command::Remove(id) => { set.remove(&id); }
                }
            }
            _ = interval.tick() => {
                for id in set.expire(Instant::now()) {
                    metrics::HEARTBEAT_TIMEOUTS_TOTAL.inc();
                    info!("Connection {} timed out.", id);
                    if let Some(callback) = &callback {
                        callback(id);
                    }
                }
            }
        }
    }
}
