/// Metrics collection and exposure

use crate::errors::{DaemonError, DaemonResult};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time values read from the core registries at scrape time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreSnapshot {
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_active: usize,
    pub displays_ready: usize,
    pub open_sessions: usize,
    pub live_channels: usize,
    pub supervisor_crashes: u64,
    pub supervisor_recoveries: u64,
}

type SnapshotSource = Box<dyn Fn() -> CoreSnapshot + Send + Sync>;

enum CoreMetric {
    Counter(IntCounter, fn(&CoreSnapshot) -> u64),
    Gauge(IntGauge, fn(&CoreSnapshot) -> usize),
}

impl CoreMetric {
    fn desc(&self) -> Vec<&Desc> {
        match self {
            CoreMetric::Counter(counter, _) => counter.desc(),
            CoreMetric::Gauge(gauge, _) => gauge.desc(),
        }
    }

    fn opts(&self) -> Option<Opts> {
        self.desc()
            .first()
            .map(|desc| Opts::new(desc.fq_name.clone(), desc.help.clone()))
    }

    /// A fresh sample carrying this metric's value in `snapshot`.
    fn sample(&self, snapshot: &CoreSnapshot) -> Vec<MetricFamily> {
        let Some(opts) = self.opts() else {
            return Vec::new();
        };
        match self {
            CoreMetric::Counter(_, read) => IntCounter::with_opts(opts)
                .map(|counter| {
                    counter.inc_by(read(snapshot));
                    counter.collect()
                })
                .unwrap_or_default(),
            CoreMetric::Gauge(_, read) => IntGauge::with_opts(opts)
                .map(|gauge| {
                    gauge.set(read(snapshot) as i64);
                    gauge.collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Exports totals owned by the core registries.
///
/// Values are read once per scrape and never accumulated here, so concurrent
/// scrapes all report the same totals.
struct CoreCollector {
    source: SnapshotSource,
    metrics: Vec<CoreMetric>,
}

impl CoreCollector {
    fn new(source: SnapshotSource) -> DaemonResult<Self> {
        let counter = |name: &str, help: &str, read: fn(&CoreSnapshot) -> u64| {
            IntCounter::new(name, help)
                .map(|c| CoreMetric::Counter(c, read))
                .map_err(|e| DaemonError::MetricsError(e.to_string()))
        };
        let gauge = |name: &str, help: &str, read: fn(&CoreSnapshot) -> usize| {
            IntGauge::new(name, help)
                .map(|g| CoreMetric::Gauge(g, read))
                .map_err(|e| DaemonError::MetricsError(e.to_string()))
        };

        Ok(CoreCollector {
            source,
            metrics: vec![
                counter("vdesk_tasks_started_total", "Tasks started", |s| s.tasks_started)?,
                counter("vdesk_tasks_completed_total", "Tasks completed", |s| s.tasks_completed)?,
                counter("vdesk_tasks_failed_total", "Tasks ended in error", |s| s.tasks_failed)?,
                counter("vdesk_supervisor_crashes_total", "Display processes found dead", |s| {
                    s.supervisor_crashes
                })?,
                counter("vdesk_supervisor_restarts_total", "Successful recovery passes", |s| {
                    s.supervisor_recoveries
                })?,
                gauge("vdesk_tasks_active", "Tasks currently running", |s| s.tasks_active)?,
                gauge("vdesk_displays_ready", "Displays in the Ready state", |s| s.displays_ready)?,
                gauge("vdesk_sessions_open", "Sessions not yet closed", |s| s.open_sessions)?,
                gauge("vdesk_live_channels_open", "Tasks with an open live update channel", |s| {
                    s.live_channels
                })?,
            ],
        })
    }
}

impl Collector for CoreCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.metrics.iter().flat_map(CoreMetric::desc).collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = (self.source)();
        self.metrics
            .iter()
            .flat_map(|metric| metric.sample(&snapshot))
            .collect()
    }
}

/// Metrics collector
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Request metrics
    pub request_total: IntCounter,
    pub request_duration: Histogram,
    pub request_errors: IntCounter,

    pub sessions_created: IntCounter,

    // WebSocket metrics
    pub ws_connections_total: IntCounter,
    pub ws_connections_active: IntGauge,

    pub server_start: Instant,
}

fn register<C>(registry: &Registry, collector: C) -> DaemonResult<C>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str) -> DaemonResult<IntCounter> {
    let counter = IntCounter::new(name, help).map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    register(registry, counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> DaemonResult<IntGauge> {
    let gauge = IntGauge::new(name, help).map_err(|e| DaemonError::MetricsError(e.to_string()))?;
    register(registry, gauge)
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> DaemonResult<Self> {
        let registry = Arc::new(Registry::new());

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "vdesk_http_request_duration_seconds",
            "HTTP request duration",
        ))
        .map_err(|e| DaemonError::MetricsError(e.to_string()))?;

        Ok(MetricsCollector {
            request_total: counter(&registry, "vdesk_http_requests_total", "Total HTTP requests")?,
            request_duration: register(&registry, request_duration)?,
            request_errors: counter(&registry, "vdesk_http_request_errors_total", "HTTP requests answered with an error")?,
            sessions_created: counter(&registry, "vdesk_sessions_created_total", "Sessions created")?,
            ws_connections_total: counter(&registry, "vdesk_ws_connections_total", "WebSocket connections accepted")?,
            ws_connections_active: gauge(&registry, "vdesk_ws_connections_active", "Open WebSocket connections")?,
            registry,
            server_start: Instant::now(),
        })
    }

    /// Record a request
    pub fn record_request(&self, duration_secs: f64, is_error: bool) {
        self.request_total.inc();
        self.request_duration.observe(duration_secs);
        if is_error {
            self.request_errors.inc();
        }
    }

    pub fn record_session_created(&self) {
        self.sessions_created.inc();
    }

    /// Record new connection
    pub fn record_connection(&self) {
        self.ws_connections_total.inc();
        self.ws_connections_active.inc();
    }

    /// Record connection closed
    pub fn record_connection_closed(&self) {
        self.ws_connections_active.dec();
    }

    /// Export the core registries' totals, read afresh on every scrape.
    pub fn register_core<F>(&self, source: F) -> DaemonResult<()>
    where
        F: Fn() -> CoreSnapshot + Send + Sync + 'static,
    {
        let collector = CoreCollector::new(Box::new(source))?;
        self.registry
            .register(Box::new(collector))
            .map_err(|e| DaemonError::MetricsError(e.to_string()))
    }

    /// Get all metrics in Prometheus format
    pub fn gather_metrics(&self) -> DaemonResult<String> {
        let metrics = self.registry.gather();
        prometheus::TextEncoder::new()
            .encode_to_string(&metrics)
            .map_err(|e| DaemonError::MetricsError(e.to_string()))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.server_start.elapsed().as_secs()
    }

    /// Get the registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}
