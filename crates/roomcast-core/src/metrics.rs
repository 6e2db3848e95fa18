//! Metric names and recording helpers.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding binary installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const MESSAGES_INBOUND: &str = "roomcast_messages_inbound_total";
    pub const MESSAGES_DELIVERED: &str = "roomcast_messages_delivered_total";
    pub const ROUTE_MISSES: &str = "roomcast_route_misses_total";
    pub const EVICTIONS: &str = "roomcast_evictions_total";
    pub const REPLACEMENTS: &str = "roomcast_session_replacements_total";
    pub const DECODE_ERRORS: &str = "roomcast_decode_errors_total";
    pub const WRITES: &str = "roomcast_writes_total";
    pub const SESSIONS_ACTIVE: &str = "roomcast_sessions_active";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
}

pub(crate) fn record_inbound() {
    counter!(names::MESSAGES_INBOUND).increment(1);
}

pub(crate) fn record_delivered(count: usize) {
    counter!(names::MESSAGES_DELIVERED).increment(count as u64);
}

pub(crate) fn record_route_miss() {
    counter!(names::ROUTE_MISSES).increment(1);
}

pub(crate) fn record_eviction(reason: &'static str) {
    counter!(names::EVICTIONS, "reason" => reason).increment(1);
}

pub(crate) fn record_replacement() {
    counter!(names::REPLACEMENTS).increment(1);
}

pub(crate) fn record_decode_error() {
    counter!(names::DECODE_ERRORS).increment(1);
}

pub(crate) fn record_write(kind: &'static str) {
    counter!(names::WRITES, "kind" => kind).increment(1);
}

pub(crate) fn set_registry_size(rooms: usize, sessions: usize) {
    gauge!(names::ROOMS_ACTIVE).set(rooms as f64);
    gauge!(names::SESSIONS_ACTIVE).set(sessions as f64);
}
