// Module: Metrics
// Thin recorder capability the engine reports into. The engine always holds
// a valid handle; when metrics are disabled the handle is a no-op, so call
// sites never branch on "is there a recorder".

use std::sync::Arc;
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::debug;

/// Metric names the engine emits. Every name is registered up front by the
/// Prometheus backend; unknown names are dropped (nil-safe, never a panic).
pub mod names {
    pub const POLLS: &str = "edge_connector_polls_total";
    pub const CLAIMS: &str = "edge_connector_claims_total";
    pub const DELIVERIES_RECEIVED: &str = "edge_connector_deliveries_received_total";
    pub const DELIVERIES_DROPPED: &str = "edge_connector_deliveries_dropped_total";
    pub const EXECUTIONS_RUNNING: &str = "edge_connector_executions_running";
    pub const EXECUTION_DURATION: &str = "edge_connector_execution_duration_seconds";
    pub const HTTP_REQUEST_DURATION: &str = "edge_connector_http_request_duration_seconds";
    pub const GIT_PULL_DURATION: &str = "edge_connector_git_pull_duration_seconds";
    pub const RATE_LIMIT_REMAINING: &str = "edge_connector_rate_limit_remaining";
}

/// Capability the engine records into. Implementations are thread-safe and
/// every method is infallible from the caller's point of view.
pub trait Recorder: Send + Sync {
    fn counter(&self, name: &str, labels: &[(&str, &str)]);
    fn gauge_add(&self, name: &str, delta: i64, labels: &[(&str, &str)]);
    fn gauge_set(&self, name: &str, value: i64, labels: &[(&str, &str)]);
    fn histogram(&self, name: &str, labels: &[(&str, &str)], duration: Duration);
}

pub type RecorderHandle = Arc<dyn Recorder>;

/// Recorder that drops every measurement.
#[derive(Debug, Default)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn gauge_add(&self, _name: &str, _delta: i64, _labels: &[(&str, &str)]) {}
    fn gauge_set(&self, _name: &str, _value: i64, _labels: &[(&str, &str)]) {}
    fn histogram(&self, _name: &str, _labels: &[(&str, &str)], _duration: Duration) {}
}

pub fn noop() -> RecorderHandle {
    Arc::new(NoopRecorder)
}

/// Prometheus-backed recorder with the engine's metric families registered
/// up front.
pub struct PrometheusRecorder {
    registry: Registry,
    polls: IntCounterVec,
    claims: IntCounterVec,
    received: IntCounterVec,
    dropped: IntCounterVec,
    running: IntGaugeVec,
    rate_limit_remaining: IntGaugeVec,
    execution_duration: HistogramVec,
    http_request_duration: HistogramVec,
    git_pull_duration: HistogramVec,
}

impl PrometheusRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let polls = IntCounterVec::new(
            Opts::new(names::POLLS, "Poll iterations by outcome"),
            &["outcome"],
        )?;
        let claims = IntCounterVec::new(
            Opts::new(names::CLAIMS, "Delivery claim attempts by outcome"),
            &["outcome"],
        )?;
        let received = IntCounterVec::new(
            Opts::new(names::DELIVERIES_RECEIVED, "Deliveries fetched"),
            &[],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new(names::DELIVERIES_DROPPED, "Deliveries dropped by reason"),
            &["reason"],
        )?;
        let running = IntGaugeVec::new(
            Opts::new(names::EXECUTIONS_RUNNING, "Executions currently running"),
            &[],
        )?;
        let rate_limit_remaining = IntGaugeVec::new(
            Opts::new(
                names::RATE_LIMIT_REMAINING,
                "Most recent X-RateLimit-Remaining reported by the upstream",
            ),
            &[],
        )?;
        let execution_duration = HistogramVec::new(
            HistogramOpts::new(names::EXECUTION_DURATION, "Action execution duration"),
            &["action", "kind", "status"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(names::HTTP_REQUEST_DURATION, "HTTP action request duration"),
            &["method", "status"],
        )?;
        let git_pull_duration = HistogramVec::new(
            HistogramOpts::new(names::GIT_PULL_DURATION, "Git pull duration"),
            &["repo"],
        )?;

        registry.register(Box::new(polls.clone()))?;
        registry.register(Box::new(claims.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(running.clone()))?;
        registry.register(Box::new(rate_limit_remaining.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(git_pull_duration.clone()))?;

        Ok(Self {
            registry,
            polls,
            claims,
            received,
            dropped,
            running,
            rate_limit_remaining,
            execution_duration,
            http_request_duration,
            git_pull_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of everything gathered so far.
    pub fn render_text(&self) -> String {
        use prometheus::Encoder;
        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            debug!(error = %err, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn counter_vec(&self, name: &str) -> Option<&IntCounterVec> {
        match name {
            names::POLLS => Some(&self.polls),
            names::CLAIMS => Some(&self.claims),
            names::DELIVERIES_RECEIVED => Some(&self.received),
            names::DELIVERIES_DROPPED => Some(&self.dropped),
            _ => None,
        }
    }

    fn gauge_vec(&self, name: &str) -> Option<&IntGaugeVec> {
        match name {
            names::EXECUTIONS_RUNNING => Some(&self.running),
            names::RATE_LIMIT_REMAINING => Some(&self.rate_limit_remaining),
            _ => None,
        }
    }

    fn histogram_vec(&self, name: &str) -> Option<&HistogramVec> {
        match name {
            names::EXECUTION_DURATION => Some(&self.execution_duration),
            names::HTTP_REQUEST_DURATION => Some(&self.http_request_duration),
            names::GIT_PULL_DURATION => Some(&self.git_pull_duration),
            _ => None,
        }
    }
}

/// Declared label names per family; values are passed to prometheus in this
/// order regardless of how the caller listed them.
fn declared_labels(name: &str) -> &'static [&'static str] {
    match name {
        names::POLLS | names::CLAIMS => &["outcome"],
        names::DELIVERIES_DROPPED => &["reason"],
        names::EXECUTION_DURATION => &["action", "kind", "status"],
        names::HTTP_REQUEST_DURATION => &["method", "status"],
        names::GIT_PULL_DURATION => &["repo"],
        _ => &[],
    }
}

/// Label values in the family's declared order; missing labels become "".
fn ordered_values<'a>(labels: &'a [(&str, &str)], declared: &[&str]) -> Vec<&'a str> {
    declared
        .iter()
        .map(|want| {
            labels
                .iter()
                .find(|(k, _)| k == want)
                .map(|(_, v)| *v)
                .unwrap_or("")
        })
        .collect()
}

impl Recorder for PrometheusRecorder {
    fn counter(&self, name: &str, labels: &[(&str, &str)]) {
        let Some(vec) = self.counter_vec(name) else {
            debug!(metric = name, "unknown counter; dropped");
            return;
        };
        vec.with_label_values(&ordered_values(labels, declared_labels(name)))
            .inc();
    }

    fn gauge_add(&self, name: &str, delta: i64, labels: &[(&str, &str)]) {
        let Some(vec) = self.gauge_vec(name) else {
            debug!(metric = name, "unknown gauge; dropped");
            return;
        };
        vec.with_label_values(&ordered_values(labels, declared_labels(name)))
            .add(delta);
    }

    fn gauge_set(&self, name: &str, value: i64, labels: &[(&str, &str)]) {
        let Some(vec) = self.gauge_vec(name) else {
            debug!(metric = name, "unknown gauge; dropped");
            return;
        };
        vec.with_label_values(&ordered_values(labels, declared_labels(name)))
            .set(value);
    }

    fn histogram(&self, name: &str, labels: &[(&str, &str)], duration: Duration) {
        let Some(vec) = self.histogram_vec(name) else {
            debug!(metric = name, "unknown histogram; dropped");
            return;
        };
        vec.with_label_values(&ordered_values(labels, declared_labels(name)))
            .observe(duration.as_secs_f64());
    }
}
