//! Core metric names and recorders.
//!
//! Recorders are no-ops until the binary installs an exporter.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const MESSAGES_ROUTED: &str = "parley_messages_routed_total";
    pub const DELIVERIES_TOTAL: &str = "parley_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "parley_deliveries_dropped_total";
    pub const DUPLICATES_SUPPRESSED: &str = "parley_duplicates_suppressed_total";
    pub const RELAY_PUBLISHED: &str = "parley_relay_published_total";
    pub const RELAY_PUBLISH_FAILURES: &str = "parley_relay_publish_failures_total";
    pub const RELAY_DROPPED: &str = "parley_relay_dropped_total";
    pub const RELAY_RECONNECTS: &str = "parley_relay_reconnects_total";
    pub const RELAY_DECODE_FAILURES: &str = "parley_relay_decode_failures_total";
    pub const STORE_FAILURES: &str = "parley_store_failures_total";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const SESSIONS_JOINED: &str = "parley_sessions_joined";
}

/// Describe every core metric.
pub fn describe() {
    metrics::describe_counter!(names::MESSAGES_ROUTED, "Chat messages accepted by the router");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Events queued on a session outbound channel");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Events dropped because a session channel was full or closed"
    );
    metrics::describe_counter!(
        names::DUPLICATES_SUPPRESSED,
        "Deliveries skipped because the session had already seen the id"
    );
    metrics::describe_counter!(names::RELAY_PUBLISHED, "Envelopes published on the bus");
    metrics::describe_counter!(names::RELAY_PUBLISH_FAILURES, "Envelopes the bus rejected");
    metrics::describe_counter!(names::RELAY_DROPPED, "Envelopes dropped on a full publish queue");
    metrics::describe_counter!(names::RELAY_RECONNECTS, "Relay subscription attempts after a failure");
    metrics::describe_counter!(names::RELAY_DECODE_FAILURES, "Bus payloads that failed to decode");
    metrics::describe_counter!(names::STORE_FAILURES, "Failed durable store operations");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one local session");
    metrics::describe_gauge!(names::SESSIONS_JOINED, "Sessions joined on this instance");
}

pub fn record_routed(kind: &'static str) {
    counter!(names::MESSAGES_ROUTED, "kind" => kind).increment(1);
}

pub fn record_deliveries(event: &'static str, count: usize) {
    counter!(names::DELIVERIES_TOTAL, "event" => event).increment(count as u64);
}

/// Record a dropped delivery. `reason` is `full` or `closed`.
pub fn record_drop(reason: &'static str) {
    counter!(names::DELIVERIES_DROPPED, "reason" => reason).increment(1);
}

pub fn record_duplicate() {
    counter!(names::DUPLICATES_SUPPRESSED).increment(1);
}

pub fn record_relay_published() {
    counter!(names::RELAY_PUBLISHED).increment(1);
}

pub fn record_relay_publish_failure() {
    counter!(names::RELAY_PUBLISH_FAILURES).increment(1);
}

pub fn record_relay_dropped() {
    counter!(names::RELAY_DROPPED).increment(1);
}

pub fn record_relay_reconnect() {
    counter!(names::RELAY_RECONNECTS).increment(1);
}

pub fn record_relay_decode_failure() {
    counter!(names::RELAY_DECODE_FAILURES).increment(1);
}

/// Record a failed store call, labelled by operation.
pub fn record_store_failure(op: &'static str) {
    counter!(names::STORE_FAILURES, "op" => op).increment(1);
}

pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

pub fn set_joined_sessions(count: usize) {
    gauge!(names::SESSIONS_JOINED).set(count as f64);
}
