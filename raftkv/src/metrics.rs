//! Metrics collection module for the key-value service
//!
//! This module provides functionality for collecting and exposing service metrics
//! using Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Commands applied by the state machine, by operation
    pub static ref APPLIED_COMMANDS: CounterVec = CounterVec::new(
        Opts::new("applied_commands", "commands applied by the state machine"),
        &["operation"]
    )
    .unwrap();
}

pub const UNRECOGNIZED_OPERATION: &str = "UNRECOGNIZED";

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_COMMANDS.clone()));
}

pub fn record_applied(operation: &str) {
    APPLIED_COMMANDS.with_label_values(&[operation]).inc();
}

/// Records metrics for an async operation
///
/// Counts the call under `method_name` and observes how long `handler` took.
pub async fn record_metrics<F, Fut, T>(method_name: &'static str, handler: F) -> T
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = T> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_metrics_counts_calls() {
        let before = REQ_COUNTER_VEC.with_label_values(&["test_method"]).get();
        let value = record_metrics("test_method", || async { 42 }).await;
        assert_eq!(value, 42);
        let after = REQ_COUNTER_VEC.with_label_values(&["test_method"]).get();
        assert_eq!(after - before, 1.0);
    }

    #[test]
    fn test_registry_exposes_applied_commands() {
        init_registry();
        record_applied("SET");
        let families = REGISTRY_INSTANCE.gather();
        assert!(families.iter().any(|f| f.get_name() == "applied_commands"));
    }
}
