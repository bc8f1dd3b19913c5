//! Metrics collection and exposition.
//!
//! # Metrics
//! - `control_plane_cache_lookups_total` (counter): by tier, result
//! - `control_plane_cache_entries` (gauge): L1 size per cache
//! - `control_plane_writes_total` (counter): by entity, outcome
//! - `control_plane_write_duration_seconds` (histogram): by entity
//! - `control_plane_invalidations_total` (counter): by topic, direction
//! - `control_plane_flag_evaluations_total` (counter): by reason
//! - `control_plane_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `control_plane_rate_limit_decisions_total` (counter): by rule, outcome
//! - `control_plane_template_applications_total` (counter): by template, outcome
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; with no recorder
//!   installed every call is a no-op, so library users and tests pay nothing
//! - Labels are bounded sets except rule and template names, which are
//!   operator-defined and few

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

const CACHE_LOOKUPS: &str = "control_plane_cache_lookups_total";
const CACHE_ENTRIES: &str = "control_plane_cache_entries";
const WRITES_TOTAL: &str = "control_plane_writes_total";
const WRITE_DURATION: &str = "control_plane_write_duration_seconds";
const INVALIDATIONS: &str = "control_plane_invalidations_total";
const FLAG_EVALUATIONS: &str = "control_plane_flag_evaluations_total";
const CIRCUIT_STATE: &str = "control_plane_circuit_state";
const RATE_LIMIT_DECISIONS: &str = "control_plane_rate_limit_decisions_total";
const TEMPLATE_APPLICATIONS: &str = "control_plane_template_applications_total";

/// Install the Prometheus recorder and its `/metrics` listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

#[inline]
pub fn record_cache_lookup(tier: &'static str, result: &'static str) {
    counter!(CACHE_LOOKUPS, "tier" => tier, "result" => result).increment(1);
}

#[inline]
pub fn record_cache_size(cache: &'static str, len: usize) {
    gauge!(CACHE_ENTRIES, "cache" => cache).set(len as f64);
}

#[inline]
pub fn record_write(entity: &'static str, outcome: &'static str, started: Instant) {
    counter!(WRITES_TOTAL, "entity" => entity, "outcome" => outcome).increment(1);
    histogram!(WRITE_DURATION, "entity" => entity).record(started.elapsed().as_secs_f64());
}

/// `direction` is `published`, `received` or `failed`.
#[inline]
pub fn record_invalidation(topic: &str, direction: &'static str) {
    counter!(INVALIDATIONS, "topic" => topic.to_string(), "direction" => direction).increment(1);
}

#[inline]
pub fn record_flag_evaluation(reason: &'static str) {
    counter!(FLAG_EVALUATIONS, "reason" => reason).increment(1);
}

#[inline]
pub fn record_circuit_state(name: &str, state: u8) {
    gauge!(CIRCUIT_STATE, "breaker" => name.to_string()).set(f64::from(state));
}

#[inline]
pub fn record_rate_limit(rule: &str, outcome: &'static str) {
    counter!(RATE_LIMIT_DECISIONS, "rule" => rule.to_string(), "outcome" => outcome).increment(1);
}

#[inline]
pub fn record_template_applied(template: &str, outcome: &'static str) {
    counter!(TEMPLATE_APPLICATIONS, "template" => template.to_string(), "outcome" => outcome)
        .increment(1);
}
