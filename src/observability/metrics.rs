use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub jobs_created_total: IntCounterVec,
    pub accept_race_total: IntCounterVec,
    pub fanout_events_total: IntCounterVec,
    pub fanout_dropped_total: IntCounter,
    pub jobs_awaiting_offer: IntGauge,
    pub live_sessions: IntGauge,
    pub dispatch_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_created_total = IntCounterVec::new(
            Opts::new("jobs_created_total", "Jobs created by service category"),
            &["category"],
        )
        .expect("valid jobs_created_total metric");

        let accept_race_total = IntCounterVec::new(
            Opts::new("accept_race_total", "Accept attempts by outcome"),
            &["outcome"],
        )
        .expect("valid accept_race_total metric");

        let fanout_events_total = IntCounterVec::new(
            Opts::new("fanout_events_total", "Events fanned out by kind"),
            &["kind"],
        )
        .expect("valid fanout_events_total metric");

        let fanout_dropped_total = IntCounter::new(
            "fanout_dropped_total",
            "Deliveries absorbed because the session was gone",
        )
        .expect("valid fanout_dropped_total metric");

        let jobs_awaiting_offer = IntGauge::new(
            "jobs_awaiting_offer",
            "Jobs queued for offer publication",
        )
        .expect("valid jobs_awaiting_offer metric");

        let live_sessions = IntGauge::new("live_sessions", "Currently connected sessions")
            .expect("valid live_sessions metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of offer publication in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        registry
            .register(Box::new(jobs_created_total.clone()))
            .expect("register jobs_created_total");
        registry
            .register(Box::new(accept_race_total.clone()))
            .expect("register accept_race_total");
        registry
            .register(Box::new(fanout_events_total.clone()))
            .expect("register fanout_events_total");
        registry
            .register(Box::new(fanout_dropped_total.clone()))
            .expect("register fanout_dropped_total");
        registry
            .register(Box::new(jobs_awaiting_offer.clone()))
            .expect("register jobs_awaiting_offer");
        registry
            .register(Box::new(live_sessions.clone()))
            .expect("register live_sessions");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");

        Self {
            registry,
            jobs_created_total,
            accept_race_total,
            fanout_events_total,
            fanout_dropped_total,
            jobs_awaiting_offer,
            live_sessions,
            dispatch_latency_seconds,
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
