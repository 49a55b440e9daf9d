//! Prometheus metrics for the checker
//!
//! Recording helpers are no-ops until a recorder is installed, so library
//! code and tests call them freely.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

/// Install the Prometheus recorder and serve it on `0.0.0.0:port`
///
/// Must be called from inside a tokio runtime.
pub fn init_exporter(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record one finished check pass
pub fn record_check(checker: &'static str, duration_secs: f64, tasks: usize) {
    histogram!("segcoord_check_duration_seconds", "checker" => checker).record(duration_secs);
    gauge!("segcoord_check_last_tasks", "checker" => checker).set(tasks as f64);
}

/// Record a check pass cut short by cancellation
pub fn record_check_cancelled(checker: &'static str) {
    counter!("segcoord_check_cancelled_total", "checker" => checker).increment(1);
}

/// Record an emitted task
pub fn record_task(action: &'static str, reason: &str) {
    counter!("segcoord_tasks_total", "action" => action, "reason" => reason.to_string())
        .increment(1);
}

/// Record a task the executor could not apply
pub fn record_task_failed(action: &'static str) {
    counter!("segcoord_tasks_failed_total", "action" => action).increment(1);
}

/// Record a dropped balancer plan
pub fn record_plan_dropped() {
    counter!("segcoord_balancer_plans_dropped_total").increment(1);
}

/// Record a next-target refresh failure
pub fn record_target_refresh_failure(collection_id: i64) {
    counter!(
        "segcoord_target_refresh_failures_total",
        "collection" => collection_id.to_string()
    )
    .increment(1);
}

/// Record a current-target promotion
pub fn record_target_promotion(collection_id: i64, version: i64) {
    counter!("segcoord_target_promotions_total").increment(1);
    gauge!(
        "segcoord_target_version",
        "collection" => collection_id.to_string()
    )
    .set(version as f64);
}
