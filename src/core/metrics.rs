// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the connection core.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    // --- Gauges ---
    /// The number of connections currently held by all registries.
    pub static ref CONNECTIONS_ACTIVE: IntGauge =
        register_int_gauge!("connkeeper_connections_active", "Number of live connections in the registries.").unwrap();
    /// The combined slot count of all registry tables.
    pub static ref TABLE_CAPACITY: IntGauge =
        register_int_gauge!("connkeeper_table_capacity", "Total number of slots across registry tables.").unwrap();

    // --- Counters ---
    /// The total number of connections inserted into a registry.
    pub static ref CONNECTIONS_ADDED_TOTAL: IntCounter =
        register_int_counter!("connkeeper_connections_added_total", "Total number of connections admitted.").unwrap();
    /// The total number of destroyed connections, labeled by close reason.
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec =
        register_int_counter_vec!("connkeeper_connections_closed_total", "Total number of connections closed, labeled by reason.", &["reason"]).unwrap();
    /// Insertions refused because shutdown had begun.
    pub static ref ADMISSIONS_REJECTED_TOTAL: IntCounter =
        register_int_counter!("connkeeper_admissions_rejected_total", "Total number of connections refused during shutdown.").unwrap();
    /// Insertions that found their slot still occupied by a stale connection.
    pub static ref IDENTITY_CONFLICTS_TOTAL: IntCounter =
        register_int_counter!("connkeeper_identity_conflicts_total", "Total number of stale occupants evicted on insertion.").unwrap();
    /// Lookups, removals and events that named no live connection.
    pub static ref STALE_REFERENCES_TOTAL: IntCounter =
        register_int_counter!("connkeeper_stale_references_total", "Total number of operations against stale identities.").unwrap();
    /// Identities reported idle by the heartbeat tracker.
    pub static ref HEARTBEAT_TIMEOUTS_TOTAL: IntCounter =
        register_int_counter!("connkeeper_heartbeat_timeouts_total", "Total number of heartbeat timeouts.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}
