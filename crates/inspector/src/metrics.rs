use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use schema::InspectionResult;
use std::time::Duration;

/// OpenTelemetry instruments for the inspector. Without an installed meter
/// provider every call is a no-op.
#[derive(Clone)]
pub struct InspectorMetrics {
    inspections: Counter<u64>,
    pairs_expired: Counter<u64>,
    bridge_failures: Counter<u64>,
    inference_duration: Histogram<f64>,
}

impl InspectorMetrics {
    pub fn new(meter_name: &'static str) -> Self {
        let meter = global::meter(meter_name);
        let latency_buckets = [
            0.01, 0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0, 5.0, 10.0, 20.0,
        ];

        Self {
            inspections: meter
                .u64_counter("inspections_total")
                .with_description("Completed inspections by result")
                .build(),
            pairs_expired: meter
                .u64_counter("pairs_expired_total")
                .with_description("First images dropped after the pairing timeout")
                .build(),
            bridge_failures: meter
                .u64_counter("bridge_failures_total")
                .with_description("Inference exchanges that failed or timed out")
                .build(),
            inference_duration: meter
                .f64_histogram("inference_duration_seconds")
                .with_description("Round trip to the inference peer")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
        }
    }

    pub fn record_inspection(&self, result: InspectionResult) {
        self.inspections
            .add(1, &[KeyValue::new("result", result.as_str())]);
    }

    pub fn record_expired_pair(&self) {
        self.pairs_expired.add(1, &[]);
    }

    pub fn record_bridge_failure(&self) {
        self.bridge_failures.add(1, &[]);
    }

    pub fn record_inference_duration(&self, elapsed: Duration) {
        self.inference_duration.record(elapsed.as_secs_f64(), &[]);
    }
}

impl Default for InspectorMetrics {
    fn default() -> Self {
        Self::new("inspector")
    }
}
