// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
#[cfg(target_os = "linux")]
pub mod server;
