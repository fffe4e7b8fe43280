// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::context::AppContext;
use super::echo::EchoConnection;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// The main server loop that accepts connections and handles graceful shutdown.
pub async fn run(ctx: AppContext) -> Result<()> {
    let AppContext {
        listener,
        mut group,
        multiplexer,
        shutdown_tx,
        mut background_tasks,
    } = ctx;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        info!("Accepted new connection from: {}", addr);
                        let owner = group.next_handle();
                        // The socket leaves tokio's reactor; the epoll thread owns readiness from here.
                        let accepted = socket
                            .into_std()
                            .and_then(|stream| EchoConnection::new(stream, owner.clone()));
                        match accepted {
                            Ok(connection) => owner.add_connection(connection),
                            Err(e) => warn!("Could not set up connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            },
        }
    }

    info!("Shutting down. No new connections are accepted.");
    drop(listener);

    // Stopping joins worker threads, so keep it off the async executor.
    let stopped = tokio::task::spawn_blocking(move || {
        let result = group.stop();
        multiplexer.shutdown();
        result
    })
    .await;
    match stopped {
        Ok(Ok(())) => info!("All connection managers stopped."),
        Ok(Err(e)) => error!("Connection managers stopped with an error: {}", e),
        Err(e) => error!("Shutdown task panicked: {e:?}"),
    }

    if shutdown_tx.send(()).is_err() {
        info!("No background task is listening for the shutdown signal.");
    }

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Server shutdown complete.");
    Ok(())
}
