use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use vk_apptainer_provider::{
    LifecycleState, OperationKind, OperationOutcome, ProviderMetrics, ReconcileReport,
};

use crate::Result;

const NAMESPACE: &str = "vk_apptainer";

/// Prometheus-backed implementation of the engine's metric hooks
pub struct PrometheusMetrics {
    registry: Registry,
    operations: IntCounterVec,
    operation_seconds: HistogramVec,
    reconcile_seconds: Histogram,
    reconcile_transitions: IntCounter,
    unreachable_pods: IntGauge,
    notifications: IntCounterVec,
    pods: IntGaugeVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Pod operations executed against the backend")
                .namespace(NAMESPACE),
            &["kind", "outcome"],
        )?;
        let operation_seconds = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Duration of pod operations")
                .namespace(NAMESPACE)
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["kind"],
        )?;
        let reconcile_seconds = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Duration of status resync passes")
                .namespace(NAMESPACE),
        )?;
        let reconcile_transitions = IntCounter::with_opts(
            Opts::new(
                "reconcile_transitions_total",
                "State changes discovered by the status resync",
            )
            .namespace(NAMESPACE),
        )?;
        let unreachable_pods = IntGauge::with_opts(
            Opts::new(
                "unreachable_pods",
                "Running pods whose backend did not answer in the last resync",
            )
            .namespace(NAMESPACE),
        )?;
        let notifications = IntCounterVec::new(
            Opts::new("notifications_total", "Status notifications sent to the API server")
                .namespace(NAMESPACE),
            &["result"],
        )?;
        let pods = IntGaugeVec::new(
            Opts::new("pods", "Tracked pods by lifecycle state").namespace(NAMESPACE),
            &["state"],
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(operation_seconds.clone()))?;
        registry.register(Box::new(reconcile_seconds.clone()))?;
        registry.register(Box::new(reconcile_transitions.clone()))?;
        registry.register(Box::new(unreachable_pods.clone()))?;
        registry.register(Box::new(notifications.clone()))?;
        registry.register(Box::new(pods.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            operations,
            operation_seconds,
            reconcile_seconds,
            reconcile_transitions,
            unreachable_pods,
            notifications,
            pods,
        })
    }

    /// Current values in the text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl ProviderMetrics for PrometheusMetrics {
    fn operation_finished(&self, kind: OperationKind, outcome: OperationOutcome, elapsed: Duration) {
        self.operations
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
        self.operation_seconds
            .with_label_values(&[kind.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    fn reconcile_finished(&self, report: &ReconcileReport, elapsed: Duration) {
        self.reconcile_seconds.observe(elapsed.as_secs_f64());
        self.reconcile_transitions.inc_by(report.transitions as u64);
        self.unreachable_pods.set(report.unreachable as i64);
    }

    fn notification_finished(&self, delivered: bool) {
        let result = if delivered { "delivered" } else { "dropped" };
        self.notifications.with_label_values(&[result]).inc();
    }

    fn records_observed(&self, counts: &[(LifecycleState, usize)]) {
        for state in LifecycleState::ALL {
            let n = counts
                .iter()
                .find(|(s, _)| *s == state)
                .map_or(0, |(_, n)| *n);
            self.pods.with_label_values(&[state.as_str()]).set(n as i64);
        }
    }
}
