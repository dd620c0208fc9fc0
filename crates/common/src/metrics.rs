use std::sync::{Arc, OnceLock};

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Process-wide scheduler/membership metrics backed by a prometheus registry.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scheduler_assignments: IntCounter,
    scheduler_local_assignments: IntCounter,
    cluster_membership_backends: IntGauge,
    cluster_membership_executors: IntGauge,
    schedule_time_seconds: Histogram,
}

impl MetricsRegistry {
    /// Create a registry with all metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Count one scan-range assignment; `local` marks reads served by an
    /// executor collocated with a replica.
    pub fn inc_assignment(&self, local: bool) {
        self.inner.scheduler_assignments.inc();
        if local {
            self.inner.scheduler_local_assignments.inc();
        }
    }

    /// Record the number of backends in the current membership table.
    pub fn set_membership_backends(&self, backends: i64) {
        self.inner.cluster_membership_backends.set(backends);
    }

    /// Record the number of executors in the published snapshot.
    pub fn set_membership_executors(&self, executors: i64) {
        self.inner.cluster_membership_executors.set(executors);
    }

    /// Record the wall time of one scheduling pass.
    pub fn observe_schedule_time(&self, secs: f64) {
        self.inner.schedule_time_seconds.observe(secs.max(0.0));
    }

    /// Render all registered metric families in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let scheduler_assignments = int_counter(
            &registry,
            "quarry_scheduler_assignments_total",
            "Scan-range assignments performed by the scheduler",
        );
        let scheduler_local_assignments = int_counter(
            &registry,
            "quarry_scheduler_local_assignments_total",
            "Scan-range assignments with a replica local to the chosen executor",
        );
        let cluster_membership_backends = int_gauge(
            &registry,
            "quarry_cluster_membership_backends",
            "Backends currently registered in the membership topic",
        );
        let cluster_membership_executors = int_gauge(
            &registry,
            "quarry_cluster_membership_executors",
            "Executor backends in the published cluster snapshot",
        );
        let schedule_time_seconds = histogram(
            &registry,
            "quarry_scheduler_schedule_time_seconds",
            "Wall time spent computing one query schedule",
        );

        Self {
            registry,
            scheduler_assignments,
            scheduler_local_assignments,
            cluster_membership_backends,
            cluster_membership_executors,
            schedule_time_seconds,
        }
    }
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("int counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("int gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help)).expect("histogram");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide metrics registry, initialized on first use.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
