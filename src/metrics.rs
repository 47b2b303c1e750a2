//! Prometheus metrics for the reconcile loop.

use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::error::OperatorError;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "prstack_reconcile_duration_seconds",
                "Duration of a reconcile tick in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["stack"],
        )
        .expect("valid histogram opts");
        let failures = IntCounterVec::new(
            opts!("prstack_reconcile_errors_total", "Reconciliation errors"),
            &["stack", "error"],
        )
        .expect("valid counter opts");
        let reconciliations =
            IntCounter::new("prstack_reconciliations_total", "Reconcile ticks").expect("valid counter");
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register the metrics so they appear on the `/metrics` endpoint.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, stack: &str, error: &OperatorError) {
        self.failures.with_label_values(&[stack, error.label()]).inc();
    }

    /// Count one tick and return a guard that records its duration on drop.
    pub fn count_and_measure(&self, stack: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            stack: stack.to_string(),
        }
    }
}

/// Records the observed duration in the histogram when dropped.
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    stack: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[self.stack.as_str()]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();
        metrics.reconcile_failure("42", &OperatorError::Database("down".to_string()));
        {
            let _timer = metrics.count_and_measure("42");
        }
        assert_eq!(metrics.reconciliations.get(), 1);
        let families = registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "prstack_reconciliations_total"));
    }
}
