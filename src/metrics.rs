use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission control and event propagation
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    admission_decisions: CounterVec,
    insurance_fallbacks: CounterVec,
    store_operation_duration: HistogramVec,

    // Event bus metrics
    events_published: CounterVec,
    deliveries: CounterVec,

    // Query cache metrics
    cache_lookups: CounterVec,
    cache_invalidations: CounterVec,

    // HTTP metrics
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let admission_decisions = CounterVec::new(
            Opts::new(
                "eventgate_admission_decisions_total",
                "Admission decisions by policy and outcome",
            ),
            &["policy", "outcome"],
        )?;

        let insurance_fallbacks = CounterVec::new(
            Opts::new(
                "eventgate_insurance_fallbacks_total",
                "Decisions taken by the per-process insurance limiter",
            ),
            &["policy"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "eventgate_store_operation_duration_seconds",
                "Duration of counter store round trips in seconds",
            ),
            &["store"],
        )?;

        let events_published = CounterVec::new(
            Opts::new(
                "eventgate_events_published_total",
                "Domain events handed to the broker",
            ),
            &["routing_key", "result"],
        )?;

        let deliveries = CounterVec::new(
            Opts::new(
                "eventgate_deliveries_total",
                "Consumed deliveries by routing key and outcome",
            ),
            &["routing_key", "outcome"],
        )?;

        let cache_lookups = CounterVec::new(
            Opts::new("eventgate_cache_lookups_total", "Query cache lookups"),
            &["class", "result"],
        )?;

        let cache_invalidations = CounterVec::new(
            Opts::new(
                "eventgate_cache_invalidations_total",
                "Cache keys deleted by invalidation",
            ),
            &["namespace"],
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "eventgate_request_duration_seconds",
            "Duration of HTTP requests in seconds",
        ))?;

        registry.register(Box::new(admission_decisions.clone()))?;
        registry.register(Box::new(insurance_fallbacks.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(cache_invalidations.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            admission_decisions,
            insurance_fallbacks,
            store_operation_duration,
            events_published,
            deliveries,
            cache_lookups,
            cache_invalidations,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admission(&self, policy: &str, outcome: &str) {
        self.admission_decisions
            .with_label_values(&[policy, outcome])
            .inc();
    }

    pub fn record_insurance_fallback(&self, policy: &str) {
        self.insurance_fallbacks.with_label_values(&[policy]).inc();
    }

    pub fn record_store_operation_duration(&self, store: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[store])
            .observe(duration_seconds);
    }

    pub fn record_publish(&self, routing_key: &str, result: &str) {
        self.events_published
            .with_label_values(&[routing_key, result])
            .inc();
    }

    pub fn record_delivery(&self, routing_key: &str, outcome: &str) {
        self.deliveries
            .with_label_values(&[routing_key, outcome])
            .inc();
    }

    pub fn record_cache_hit(&self, class: &str) {
        self.cache_lookups.with_label_values(&[class, "hit"]).inc();
    }

    pub fn record_cache_miss(&self, class: &str) {
        self.cache_lookups.with_label_values(&[class, "miss"]).inc();
    }

    pub fn record_cache_invalidation(&self, namespace: &str, deleted: u64) {
        self.cache_invalidations
            .with_label_values(&[namespace])
            .inc_by(deleted as f64);
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_admission("global", "allowed");
        metrics.record_insurance_fallback("global");
        metrics.record_store_operation_duration("redis", 0.002);
        metrics.record_publish("post.created", "ok");
        metrics.record_delivery("post.deleted", "handled");
        metrics.record_cache_hit("post");
        metrics.record_cache_invalidation("posts:", 3);

        let _timer = metrics.start_request_timer();
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_admission("create_post", "denied");
        metrics.record_delivery("post.created", "dropped");

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "eventgate_admission_decisions_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "eventgate_deliveries_total"));
    }
}
