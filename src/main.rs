// src/main.rs

//! The entry point for the connkeeper echo server.

use anyhow::Result;
use connkeeper::config::Config;
use std::env;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("connkeeper version {VERSION}");
        return Ok(());
    }

    // An explicit --config must exist; the default path may be absent.
    let explicit_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match explicit_path {
        Some(path) => load_or_exit(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_or_exit(DEFAULT_CONFIG_PATH),
        None => Config::default(),
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        if let Some(port_str) = args.get(port_index + 1) {
            match port_str.parse::<u16>() {
                Ok(port) if port != 0 => config.port = port,
                _ => {
                    eprintln!("Invalid port number: {port_str}");
                    std::process::exit(1);
                }
            }
        } else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        }
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if explicit_path.is_none() && !Path::new(DEFAULT_CONFIG_PATH).exists() {
        info!("No {} found, running with the default configuration.", DEFAULT_CONFIG_PATH);
    }

    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: Config) -> Result<()> {
    if let Err(e) = connkeeper::server::run(config).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: Config) -> Result<()> {
    error!("The echo server needs epoll and only runs on Linux.");
    anyhow::bail!("unsupported platform")
}

fn load_or_exit(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{path}\": {e:#}");
            std::process::exit(1);
        }
    }
}
