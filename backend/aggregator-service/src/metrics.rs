use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use tracing::warn;

/// Value of the `service` const label on every aggregator metric
pub const SERVICE_LABEL: &str = "aggregator-service";

// Collectors are registered into the default registry exactly once per process.
static METRICS: Lazy<AggregatorMetrics> =
    Lazy::new(|| AggregatorMetrics::register(SERVICE_LABEL));

#[derive(Clone)]
pub struct AggregatorMetrics {
    pub processed: IntCounterVec,
    pub rejected: IntCounter,
    pub queue_depth: IntGauge,
}

impl AggregatorMetrics {
    /// Handle to the process-wide collectors exported by [`render`]
    pub fn global() -> Self {
        METRICS.clone()
    }

    fn register(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let processed = IntCounterVec::new(
            Opts::new(
                "aggregator_events_processed_total",
                "Events handled by the consumer worker, by outcome",
            )
            .const_label("service", service.to_string()),
            &["outcome"],
        )
        .expect("valid metric opts for aggregator_events_processed_total");

        let rejected = IntCounter::with_opts(
            Opts::new(
                "aggregator_events_rejected_total",
                "Events refused at submission because the buffer was full or closed",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for aggregator_events_rejected_total");

        let queue_depth = IntGauge::with_opts(
            Opts::new(
                "aggregator_queue_depth",
                "Events currently waiting in the bounded buffer",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for aggregator_queue_depth");

        for metric in [
            Box::new(processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(rejected.clone()),
            Box::new(queue_depth.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register aggregator metric: {}", e);
            }
        }

        Self {
            processed,
            rejected,
            queue_depth,
        }
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.processed.with_label_values(&[outcome]).inc();
    }
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_share_exported_collectors() {
        let first = AggregatorMetrics::global();
        let second = AggregatorMetrics::global();

        let before = second.rejected.get();
        first.rejected.inc_by(3);
        assert_eq!(second.rejected.get(), before + 3);

        second.record_outcome("duplicate");
        let text = render().unwrap();
        assert!(text.contains("aggregator_events_rejected_total"));
        assert!(text.contains(r#"outcome="duplicate""#));
    }
}
