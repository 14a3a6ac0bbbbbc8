// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, GaugeVec, Histogram, TextEncoder, register_counter, register_gauge,
    register_gauge_vec, register_histogram,
};

lazy_static! {
    // --- Connections ---
    /// The number of clients currently connected to the server.
    pub static ref CONNECTED_SESSIONS: Gauge =
        register_gauge!("olivine_connected_sessions", "Number of currently connected sessions.").unwrap();
    /// The total number of connections accepted since startup.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("olivine_connections_received_total", "Total number of connections received.").unwrap();
    /// Connections refused by the rate limiter or pending-attempt cap.
    pub static ref CONNECTIONS_REJECTED_TOTAL: Counter =
        register_counter!("olivine_connections_rejected_total", "Total number of connections rejected by admission control.").unwrap();
    /// Sessions evicted by the heartbeat reaper.
    pub static ref HEARTBEAT_EVICTIONS_TOTAL: Counter =
        register_counter!("olivine_heartbeat_evictions_total", "Total number of sessions closed for missing heartbeats.").unwrap();

    // --- Write pipeline ---
    /// Operations applied to a CRDT map.
    pub static ref OPS_APPLIED_TOTAL: Counter =
        register_counter!("olivine_ops_applied_total", "Total number of operations applied to maps.").unwrap();
    /// Operations rejected (permissions, resolvers, type mismatches).
    pub static ref OPS_REJECTED_TOTAL: Counter =
        register_counter!("olivine_ops_rejected_total", "Total number of operations rejected.").unwrap();
    /// Operations forwarded to a remote partition owner.
    pub static ref OPS_FORWARDED_TOTAL: Counter =
        register_counter!("olivine_ops_forwarded_total", "Total number of operations forwarded to their partition owner.").unwrap();
    /// Batches that were forced to run synchronously by backpressure.
    pub static ref BATCH_SYNC_FORCED_TOTAL: Counter =
        register_counter!("olivine_batch_sync_forced_total", "Total number of batches drained synchronously under backpressure.").unwrap();
    /// Batches that waited for pipeline capacity.
    pub static ref BATCH_WAITS_TOTAL: Counter =
        register_counter!("olivine_batch_waits_total", "Total number of batches that waited for pipeline capacity.").unwrap();
    /// Batches that timed out waiting for capacity.
    pub static ref BATCH_TIMEOUTS_TOTAL: Counter =
        register_counter!("olivine_batch_timeouts_total", "Total number of batches that timed out waiting for capacity.").unwrap();
    /// Live keys per map.
    pub static ref MAP_SIZE: GaugeVec =
        register_gauge_vec!("olivine_map_size", "Number of live keys per map.", &["map"]).unwrap();

    // --- Broadcast ---
    /// Events routed to at least one subscriber.
    pub static ref EVENTS_ROUTED_TOTAL: Counter =
        register_counter!("olivine_events_routed_total", "Total number of events routed to subscribers.").unwrap();
    /// Events dropped because no session subscribed to the affected map.
    pub static ref EVENTS_FILTERED_BY_SUBSCRIPTION: Counter =
        register_counter!("olivine_events_filtered_by_subscription_total", "Total number of events dropped by the subscription filter.").unwrap();
    /// How many subscribers each routed event reached.
    pub static ref SUBSCRIBERS_PER_EVENT: Histogram =
        register_histogram!("olivine_subscribers_per_event", "Number of subscribers reached per routed event.").unwrap();

    // --- Queries & GC ---
    /// Live query subscriptions.
    pub static ref QUERY_SUBSCRIPTIONS: Gauge =
        register_gauge!("olivine_query_subscriptions", "Number of live query subscriptions.").unwrap();
    /// Cluster queries that finalized with partial results after a timeout.
    pub static ref QUERY_TIMEOUTS_TOTAL: Counter =
        register_counter!("olivine_query_timeouts_total", "Total number of cluster queries finalized on timeout.").unwrap();
    /// Tombstones pruned by GC.
    pub static ref GC_PRUNED_TOTAL: Counter =
        register_counter!("olivine_gc_pruned_total", "Total number of tombstones pruned by GC consensus.").unwrap();
    /// Records expired by their TTL during a GC round.
    pub static ref GC_EXPIRED_TOTAL: Counter =
        register_counter!("olivine_gc_expired_total", "Total number of records expired by TTL.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
