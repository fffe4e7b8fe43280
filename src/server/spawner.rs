// src/server/spawner.rs

//! Spawns the server's long-running background tasks.

use super::context::AppContext;
use super::metrics_server;
use crate::config::Config;
use tracing::info;

/// Spawns all background tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut AppContext, config: &Config) {
    if config.metrics.enabled {
        let port = config.metrics.port;
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
}
