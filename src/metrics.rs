// Numan Thabit 2025
// metrics.rs - Prometheus counters for the RPC layer
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub calls_sent: IntCounterVec,
    pub responses_matched: IntCounter,
    pub requests_served: IntCounterVec,
    pub hole_punches_sent: IntCounter,
    pub hole_punches_relayed: IntCounter,
    pub probes_sent: IntCounter,
    pub call_timeouts: IntCounter,
    pub malformed_drops: IntCounter,
    pub network_mismatches: IntCounter,
    pub identity_rejections: IntCounter,
    pub unknown_commands: IntCounter,
    pub handler_failures: IntCounter,
    pub late_responses: IntCounter,
    pub pending_calls: IntGauge,
    pub call_latency_seconds: Histogram,
    pub handler_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("udprpc".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let opts = HistogramOpts::new($name, $help).buckets($buckets.to_vec());
                let hist = Histogram::with_opts(opts)?;
                registry.register(Box::new(hist.clone()))?;
                hist
            }};
        }

        let calls_sent =
            register_counter_vec!("calls_sent_total", "Outbound calls by command", &["command"]);
        let responses_matched = register_counter!(
            "responses_matched_total",
            "Responses correlated with a pending call"
        );
        let requests_served = register_counter_vec!(
            "requests_served_total",
            "Inbound requests answered by a handler",
            &["command"]
        );
        let hole_punches_sent = register_counter!(
            "hole_punches_sent_total",
            "Hole punch requests sent to the rendezvous peer"
        );
        let hole_punches_relayed = register_counter!(
            "hole_punches_relayed_total",
            "Hole punch requests forwarded on behalf of a peer"
        );
        let probes_sent = register_counter!("probes_sent_total", "Hole punch probes emitted");
        let call_timeouts =
            register_counter!("call_timeouts_total", "Calls failed after the retry cycle");
        let malformed_drops =
            register_counter!("malformed_drops_total", "Datagrams that failed to decode");
        let network_mismatches = register_counter!(
            "network_mismatches_total",
            "Envelopes dropped for carrying the other network flag"
        );
        let identity_rejections = register_counter!(
            "identity_rejections_total",
            "First-contact senders that failed identity validation"
        );
        let unknown_commands =
            register_counter!("unknown_commands_total", "Requests naming no local handler");
        let handler_failures =
            register_counter!("handler_failures_total", "Handlers that returned an error");
        let late_responses = register_counter!(
            "late_responses_total",
            "Responses arriving for a call that already settled"
        );
        let pending_calls = register_gauge!("pending_calls", "Outstanding outbound calls");
        let call_latency_seconds = register_histogram!(
            "call_latency_seconds",
            "Time from send to response for successful calls",
            &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        );
        let handler_latency_seconds = register_histogram!(
            "handler_latency_seconds",
            "Local handler execution time",
            &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
        );

        Ok(Self {
            registry,
            calls_sent,
            responses_matched,
            requests_served,
            hole_punches_sent,
            hole_punches_relayed,
            probes_sent,
            call_timeouts,
            malformed_drops,
            network_mismatches,
            identity_rejections,
            unknown_commands,
            handler_failures,
            late_responses,
            pending_calls,
            call_latency_seconds,
            handler_latency_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
