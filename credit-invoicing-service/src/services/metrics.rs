//! Prometheus metrics for credit-invoicing-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, CounterVec, Encoder, HistogramVec, IntCounter, IntCounterVec,
    TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "credit_invoicing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Invoicing runs by final status
pub static RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Product worker results by product and outcome
pub static WORKER_RESULTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Credit consumed by product, in USD
pub static CREDIT_CONSUMED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// PLPS charges that kept their original cost
pub static PLPS_MISSES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("credit_invoicing_runs_total", "Total invoicing runs by status"),
            &["status"]
        )
        .expect("Failed to register RUNS_TOTAL")
    });

    WORKER_RESULTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "credit_invoicing_worker_results_total",
                "Product worker results by product and status"
            ),
            &["product", "status"]
        )
        .expect("Failed to register WORKER_RESULTS_TOTAL")
    });

    CREDIT_CONSUMED_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "credit_invoicing_credit_consumed_total",
                "Credit consumed by product"
            ),
            &["product"]
        )
        .expect("Failed to register CREDIT_CONSUMED_TOTAL")
    });

    PLPS_MISSES_TOTAL.get_or_init(|| {
        register_int_counter!(opts!(
            "credit_invoicing_plps_misses_total",
            "PLPS charges without a covering contract interval"
        ))
        .expect("Failed to register PLPS_MISSES_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "credit_invoicing_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished invoicing run.
pub fn record_run(status: &str) {
    if let Some(counter) = RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record one product worker result.
pub fn record_worker_result(product: &str, status: &str) {
    if let Some(counter) = WORKER_RESULTS_TOTAL.get() {
        counter.with_label_values(&[product, status]).inc();
    }
}

/// Record credit consumed by a product worker.
pub fn record_credit_consumed(product: &str, amount: Decimal) {
    if let Some(counter) = CREDIT_CONSUMED_TOTAL.get() {
        if let Some(value) = amount.to_f64().filter(|v| *v > 0.0) {
            counter.with_label_values(&[product]).inc_by(value);
        }
    }
}

/// Record a PLPS charge that kept its original cost.
pub fn record_plps_miss() {
    if let Some(counter) = PLPS_MISSES_TOTAL.get() {
        counter.inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type]).inc();
    }
}
