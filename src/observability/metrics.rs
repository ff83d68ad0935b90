use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub nearby_queries_total: IntCounterVec,
    pub nearby_query_latency_seconds: HistogramVec,
    pub active_trackers: IntGauge,
    pub eta_updates_total: IntCounter,
    pub tracker_reconnects_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let nearby_queries_total = IntCounterVec::new(
            Opts::new("nearby_queries_total", "Nearby ambulance queries by outcome"),
            &["outcome"],
        )
        .expect("valid nearby_queries_total metric");

        let nearby_query_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "nearby_query_latency_seconds",
                "Latency of nearby ambulance queries in seconds",
            ),
            &["outcome"],
        )
        .expect("valid nearby_query_latency_seconds metric");

        let active_trackers = IntGauge::new(
            "active_trackers",
            "Requests currently followed by a live tracking feed",
        )
        .expect("valid active_trackers metric");

        let eta_updates_total =
            IntCounter::new("eta_updates_total", "ETA estimates recomputed and published")
                .expect("valid eta_updates_total metric");

        let tracker_reconnects_total = IntCounter::new(
            "tracker_reconnects_total",
            "Live subscription reconnect attempts",
        )
        .expect("valid tracker_reconnects_total metric");

        registry
            .register(Box::new(nearby_queries_total.clone()))
            .expect("register nearby_queries_total");
        registry
            .register(Box::new(nearby_query_latency_seconds.clone()))
            .expect("register nearby_query_latency_seconds");
        registry
            .register(Box::new(active_trackers.clone()))
            .expect("register active_trackers");
        registry
            .register(Box::new(eta_updates_total.clone()))
            .expect("register eta_updates_total");
        registry
            .register(Box::new(tracker_reconnects_total.clone()))
            .expect("register tracker_reconnects_total");

        Self {
            registry,
            nearby_queries_total,
            nearby_query_latency_seconds,
            active_trackers,
            eta_updates_total,
            tracker_reconnects_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
