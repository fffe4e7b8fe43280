// src/server/context.rs

use super::echo::EchoConnection;
use crate::connection::ManagerGroup;
use crate::core::multiplexer::EpollMultiplexer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds every long-lived service of the running server.
///
/// Field order is drop order: the listener goes first so no new connection
/// arrives, then the managers, then the multiplexer they registered with.
/// `connection_loop::run` stops them explicitly in the same order.
pub struct AppContext {
    pub listener: TcpListener,
    pub group: ManagerGroup<EchoConnection>,
    pub multiplexer: Arc<EpollMultiplexer>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
