//! Prometheus metrics for the helper
//!
//! Labels carry step outcomes and states only, never query identifiers or
//! prefixes.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub const OUTCOME_REQUEUED: &str = "requeued";
pub const OUTCOME_COMPLETED: &str = "completed";
pub const OUTCOME_CANCELLED: &str = "cancelled";

pub fn record_step(outcome: &str, duration: Duration) {
    counter!("hierhist_steps_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("hierhist_step_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_step_start() {
    gauge!("hierhist_steps_in_flight").increment(1.0);
}

pub fn record_step_end() {
    gauge!("hierhist_steps_in_flight").decrement(1.0);
}

pub fn record_transition(state: &str) {
    counter!("hierhist_step_transitions_total", "state" => state.to_string()).increment(1);
}

pub fn record_dead_letter() {
    counter!("hierhist_dead_letters_total").increment(1);
}

pub fn set_current_level(level: u32) {
    gauge!("hierhist_current_level").set(level as f64);
}

pub fn init_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
