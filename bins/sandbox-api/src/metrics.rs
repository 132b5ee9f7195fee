// Prometheus metrics for the sandbox API

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use sandbox_common::{CompletionEvent, QueueStats};
use std::sync::Once;

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Jobs accepted into the queue (counter with language label)
    pub static ref JOBS_SUBMITTED: CounterVec = CounterVec::new(
        Opts::new("sandbox_jobs_submitted_total", "Total number of jobs submitted"),
        &["language"]
    )
    .expect("metric can be created");

    // Requests refused before enqueue
    pub static ref JOBS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("sandbox_jobs_rejected_total", "Total jobs rejected by validation"),
        &["reason"]
    )
    .expect("metric can be created");

    // Jobs settled (counter with language, state and status labels)
    pub static ref JOBS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("sandbox_jobs_completed_total", "Total number of jobs that reached a terminal state"),
        &["language", "state", "status"]
    )
    .expect("metric can be created");

    // Wall-clock runtime of the final attempt (in milliseconds)
    pub static ref JOB_RUNTIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new("sandbox_job_runtime_ms", "Job runtime in milliseconds")
            .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0]),
        &["language"]
    )
    .expect("metric can be created");

    // Jobs per queue state
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("sandbox_queue_depth", "Current number of jobs per queue state"),
        &["state"]
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(JOBS_SUBMITTED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(JOBS_REJECTED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(JOBS_COMPLETED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(JOB_RUNTIME.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("collector can be registered");
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_job_submitted(language: &str) {
    JOBS_SUBMITTED.with_label_values(&[language]).inc();
}

pub fn record_job_rejected(reason: &str) {
    JOBS_REJECTED.with_label_values(&[reason]).inc();
}

pub fn record_job_completed(event: &CompletionEvent) {
    let language = event.language.as_str();
    JOBS_COMPLETED
        .with_label_values(&[language, event.state.as_str(), &event.status.to_string()])
        .inc();
    JOB_RUNTIME
        .with_label_values(&[language])
        .observe(event.runtime_ms as f64);
}

pub fn update_queue_depth(stats: &QueueStats) {
    for (state, value) in [
        ("waiting", stats.waiting),
        ("active", stats.active),
        ("completed", stats.completed),
        ("failed", stats.failed),
    ] {
        QUEUE_DEPTH.with_label_values(&[state]).set(value as i64);
    }
}
