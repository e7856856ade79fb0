use crate::error::Error;

use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::Unit;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Instant;

/// All metrics exposed by the operator's `/metrics` endpoint: reconcile
/// outcomes/latency plus watch-driven trigger counters used by controllers
/// that layer a secondary watch on top of the primary reconcile loop (see
/// `echo::controller`'s `Deployment` watch).
#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub watch: WatchMetrics,
    pub ready: Gauge,
}

impl Metrics {
    /// Registers every metric family against `registry` and returns a handle
    /// to record them. Called once per controller at `State::new` time.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile = ReconcileMetrics::default().register(registry);
        let watch = WatchMetrics::default().register(registry);
        let ready = Gauge::default();
        registry.register("ready", "controller readiness", ready.clone());
        Self {
            reconcile,
            watch,
            ready,
        }
    }

    pub fn ready_set(&self, value: i64) {
        self.ready.set(value);
    }

    pub fn triggered_inc(&self, action: WatchAction, kind: &str) {
        self.watch.triggered.get_or_create(&WatchLabels {
            action,
            kind: kind.to_string(),
        }).inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch.failed.get_or_create(&()).inc();
    }
}

/// Action observed on a secondary watch stream (e.g. the `Deployment` watch
/// an `Echo` controller layers on top of its primary reconcile loop).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WatchAction {
    Apply,
    Delete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WatchLabels {
    pub action: WatchAction,
    pub kind: String,
}

#[derive(Clone)]
pub struct WatchMetrics {
    pub triggered: Family<WatchLabels, Counter>,
    pub failed: Family<(), Counter>,
}

impl Default for WatchMetrics {
    fn default() -> Self {
        Self {
            triggered: Family::default(),
            failed: Family::default(),
        }
    }
}

impl WatchMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.register(
            "watch_triggered",
            "secondary watch events observed",
            self.triggered.clone(),
        );
        r.register(
            "watch_operations_failed",
            "secondary watch stream errors",
            self.failed.clone(),
        );
        self
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}
impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            let trace_id = id.to_string();
            Ok(Self { id: trace_id })
        }
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<(), Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<(), Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure<K: ResourceExt>(&self, obj: &Arc<K>, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.get_or_create(&()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
