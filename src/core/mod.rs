// src/core/mod.rs

//! The machinery underneath the connection registry: the task queue that owns
//! each table, readiness notification, idle tracking and metrics.

pub mod errors;
pub mod heartbeat;
pub mod metrics;
pub mod multiplexer;
pub mod task_service;

pub use errors::{NetError, TableError};
pub use task_service::{TaskHandle, TaskService};
