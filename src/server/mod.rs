// src/server/mod.rs

//! A small echo server that wires the connection managers to real sockets.

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod echo;
mod initialization;
mod metrics_server;
mod spawner;

pub use echo::EchoConnection;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Start the poller and the managers, then bind the listener.
    let mut server_context = initialization::setup(&config).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context, &config);

    // 3. Accept until a signal arrives, then stop everything in order.
    connection_loop::run(server_context).await
}
