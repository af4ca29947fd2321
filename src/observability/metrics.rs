use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub poll_cycles_total: IntCounterVec,
    pub poll_latency_seconds: HistogramVec,
    pub status_changes_total: IntCounter,
    pub notifications_total: IntCounterVec,
    pub active_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let poll_cycles_total = IntCounterVec::new(
            Opts::new("poll_cycles_total", "Tracking poll cycles by outcome"),
            &["outcome"],
        )
        .expect("valid poll_cycles_total metric");

        let poll_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "poll_latency_seconds",
                "Duration of one sequential poll cycle in seconds",
            ),
            &["outcome"],
        )
        .expect("valid poll_latency_seconds metric");

        let status_changes_total =
            IntCounter::new("status_changes_total", "Observed order status transitions")
                .expect("valid status_changes_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "User-facing notifications by channel"),
            &["channel"],
        )
        .expect("valid notifications_total metric");

        let active_sessions = IntGauge::new("active_sessions", "Open order tracking sessions")
            .expect("valid active_sessions metric");

        registry
            .register(Box::new(poll_cycles_total.clone()))
            .expect("register poll_cycles_total");
        registry
            .register(Box::new(poll_latency_seconds.clone()))
            .expect("register poll_latency_seconds");
        registry
            .register(Box::new(status_changes_total.clone()))
            .expect("register status_changes_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");

        Self {
            registry,
            poll_cycles_total,
            poll_latency_seconds,
            status_changes_total,
            notifications_total,
            active_sessions,
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
