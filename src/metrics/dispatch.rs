//! Dispatch engine metrics, analogous in shape to OpenTelemetry GenAI server metrics but
//! scoped to this proxy's own dispatch pipeline rather than full GenAI semantic conventions.

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};

/// Prometheus instruments recording dispatch-pipeline behavior.
#[derive(Clone)]
pub struct DispatchMetrics {
    /// Total request duration, labeled by outcome
    request_duration: HistogramVec,
    /// Time to first byte written to the caller (streaming responses only)
    time_to_first_byte: HistogramVec,
    /// Store cache hit/miss counts, labeled by cache name and outcome
    cache_lookups: CounterVec,
    /// Current in-flight count per source, mirrors the concurrency counter in the store
    concurrency_occupancy: IntGaugeVec,
    registry: Registry,
}

impl DispatchMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let request_duration = HistogramVec::new(
            HistogramOpts::new("dispatch_request_duration_seconds", "Total dispatch request duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["outcome", "source_kind", "streaming"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let time_to_first_byte = HistogramVec::new(
            HistogramOpts::new("dispatch_time_to_first_byte_seconds", "Time to first byte for streaming responses")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["source_kind"],
        )?;
        registry.register(Box::new(time_to_first_byte.clone()))?;

        let cache_lookups = CounterVec::new(
            Opts::new("dispatch_store_cache_lookups_total", "Store Client read-through cache lookups"),
            &["cache", "outcome"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        let concurrency_occupancy = IntGaugeVec::new(
            Opts::new("dispatch_concurrency_occupancy", "Observed in-flight count per source, updated on acquire and release"),
            &["source_id"],
        )?;
        registry.register(Box::new(concurrency_occupancy.clone()))?;

        Ok(Self {
            request_duration,
            time_to_first_byte,
            cache_lookups,
            concurrency_occupancy,
            registry: registry.clone(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request_duration(&self, seconds: f64, outcome: &str, source_kind: &str, streaming: bool) {
        self.request_duration
            .with_label_values(&[outcome, source_kind, if streaming { "true" } else { "false" }])
            .observe(seconds);
    }

    pub fn record_time_to_first_byte(&self, seconds: f64, source_kind: &str) {
        self.time_to_first_byte.with_label_values(&[source_kind]).observe(seconds);
    }

    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        self.cache_lookups.with_label_values(&[cache, if hit { "hit" } else { "miss" }]).inc();
    }

    pub fn set_concurrency_occupancy(&self, source_id: &str, value: i64) {
        self.concurrency_occupancy.with_label_values(&[source_id]).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registers_all_instruments_without_conflict() {
        let registry = Registry::new();
        let metrics = DispatchMetrics::new(&registry).expect("metrics should register");
        metrics.record_request_duration(0.25, "success", "default", true);
        metrics.record_cache_lookup("settings", true);
        metrics.set_concurrency_occupancy("default", 3);
        assert!(!registry.gather().is_empty());
    }
}
