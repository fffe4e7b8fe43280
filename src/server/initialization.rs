// src/server/initialization.rs

//! Builds and starts every server component before the accept loop runs.

use super::context::AppContext;
use crate::config::Config;
use crate::connection::ManagerGroup;
use crate::core::multiplexer::EpollMultiplexer;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all server components before starting the main loop.
pub async fn setup(config: &Config) -> Result<AppContext> {
    log_startup_info(config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let multiplexer = Arc::new(EpollMultiplexer::new().context("Failed to create epoll instance")?);
    multiplexer
        .start()
        .context("Failed to start the epoll polling thread")?;

    let mut group = ManagerGroup::new(
        "work",
        config.services,
        config.table.clone(),
        multiplexer.clone(),
    )?;
    if config.heartbeat.enabled {
        group.enable_heartbeat(&config.heartbeat)?;
    }
    group.start(config.workers)?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("Listening on {}:{}", config.host, config.port);

    Ok(AppContext {
        listener,
        group,
        multiplexer,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

fn log_startup_info(config: &Config) {
    info!(
        "Starting connkeeper v{} with {} manager(s), {} worker(s) each.",
        env!("CARGO_PKG_VERSION"),
        config.services,
        config.workers
    );
    info!(
        "Table: {} initial slots, bounded at {}.",
        config.table.initial_capacity, config.table.max_capacity
    );
    if config.heartbeat.enabled {
        info!(
            "Heartbeat: timeout {:?}, max tracked {:?}.",
            config.heartbeat.timeout, config.heartbeat.max_tracked
        );
    } else {
        info!("Heartbeat tracking is disabled.");
    }
}
