// Prometheus counters for the evaluation worker

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Variant executions (counter with variant and status labels)
    pub static ref VARIANTS_EVALUATED: CounterVec = CounterVec::new(
        Opts::new("verdict_variants_evaluated_total", "Total variant executions recorded"),
        &["variant", "status"]
    )
    .expect("metric can be created");

    // Variant execution time histogram (in milliseconds)
    pub static ref VARIANT_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "verdict_variant_duration_ms",
            "Variant execution time in milliseconds"
        )
        .buckets(vec![100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0, 900000.0]),
        &["variant"]
    )
    .expect("metric can be created");

    // Environment preparations by outcome (built, failed)
    pub static ref ENV_PREPARATIONS: CounterVec = CounterVec::new(
        Opts::new("verdict_environment_preparations_total", "Environment preparations by outcome"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref WORKERS_RETIRED: IntCounter = IntCounter::new(
        "verdict_workers_retired_total",
        "Workers retired after an isolation failure"
    )
    .expect("metric can be created");

    pub static ref TASKS_SKIPPED: IntCounter = IntCounter::new(
        "verdict_tasks_skipped_total",
        "Tasks skipped before execution"
    )
    .expect("metric can be created");

    pub static ref WORKER_FAULTS: IntCounter = IntCounter::new(
        "verdict_worker_faults_total",
        "Unexpected failures while evaluating a variant, retries included"
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(VARIANTS_EVALUATED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(VARIANT_DURATION.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(ENV_PREPARATIONS.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(WORKERS_RETIRED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(TASKS_SKIPPED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(WORKER_FAULTS.clone()))
            .expect("collector can be registered");
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Record a finished variant
pub fn record_variant(variant: &str, status: &str, duration_ms: u64) {
    VARIANTS_EVALUATED.with_label_values(&[variant, status]).inc();
    VARIANT_DURATION
        .with_label_values(&[variant])
        .observe(duration_ms as f64);
}

pub fn record_preparation(succeeded: bool) {
    let outcome = if succeeded { "built" } else { "failed" };
    ENV_PREPARATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_worker_retired() {
    WORKERS_RETIRED.inc();
}

pub fn record_task_skipped() {
    TASKS_SKIPPED.inc();
}

pub fn record_worker_fault() {
    WORKER_FAULTS.inc();
}
