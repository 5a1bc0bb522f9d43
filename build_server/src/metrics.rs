//! Prometheus metrics for build engine observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a job state transition.
pub fn job_status_changed(status: &str) {
    counter!("appforge_jobs_total", "status" => status.to_string()).increment(1);
}

/// Record end-to-end job duration.
pub fn job_duration(duration_ms: u64) {
    histogram!("appforge_job_duration_ms").record(duration_ms as f64);
}

/// Record one platform driver run.
pub fn platform_build_duration(platform: &str, duration_ms: u64) {
    histogram!("appforge_platform_build_duration_ms", "platform" => platform.to_string())
        .record(duration_ms as f64);
}

/// Record a platform driver failure.
pub fn platform_failure(platform: &str, category: &str) {
    counter!(
        "appforge_platform_failures_total",
        "platform" => platform.to_string(),
        "category" => category.to_string()
    )
    .increment(1);
}

/// Set current number of queued jobs.
pub fn queue_depth(count: usize) {
    gauge!("appforge_queue_depth").set(count as f64);
}

/// Set current number of executing jobs.
pub fn running_jobs(count: usize) {
    gauge!("appforge_running_jobs").set(count as f64);
}
