//! Metrics facade
//!
//! Components emit counters, gauges and observations through an injected
//! [`MetricsSink`]. The default sink is [`NoopMetrics`], so a missing backend
//! never turns into an error.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

/// Label pairs attached to a metric
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for named counters, gauges and distributions
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn increment(&self, name: &str, labels: Labels<'_>, by: u64);
    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64);
    fn observe(&self, name: &str, labels: Labels<'_>, value: f64);
}

/// Shared handle to a metrics sink
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// The no-op default
pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _labels: Labels<'_>, _by: u64) {}
    fn set_gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
    fn observe(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

/// Emits every metric as a debug-level tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, labels: Labels<'_>, by: u64) {
        debug!(target: "switchyard::metrics", metric = %name, labels = %series_key("", labels), by, "counter");
    }

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        debug!(target: "switchyard::metrics", metric = %name, labels = %series_key("", labels), value, "gauge");
    }

    fn observe(&self, name: &str, labels: Labels<'_>, value: f64) {
        debug!(target: "switchyard::metrics", metric = %name, labels = %series_key("", labels), value, "observation");
    }
}

/// Render `name{k=v,...}` with labels sorted by key
pub fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

#[derive(Debug, Default)]
struct Series {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    observations: BTreeMap<String, Vec<f64>>,
}

/// Keeps everything in memory, keyed by [`series_key`]
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: RwLock<Series>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Series> {
        self.series.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Series> {
        self.series.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = series_key(name, labels);
        self.read().counters.get(&key).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = series_key(name, labels);
        self.read().gauges.get(&key).copied()
    }

    pub fn observations(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        let key = series_key(name, labels);
        self.read().observations.get(&key).cloned().unwrap_or_default()
    }

    /// Sum of a counter across every label set
    pub fn counter_total(&self, name: &str) -> u64 {
        let series = self.read();
        series
            .counters
            .iter()
            .filter(|(key, _)| key.as_str() == name || key.starts_with(&format!("{}{{", name)))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Flattened `(series, value)` lines for display
    pub fn render(&self) -> Vec<(String, String)> {
        let series = self.read();
        let mut lines = Vec::new();
        for (k, v) in &series.counters {
            lines.push((k.clone(), v.to_string()));
        }
        for (k, v) in &series.gauges {
            lines.push((k.clone(), format!("{:.3}", v)));
        }
        for (k, samples) in &series.observations {
            let mean = samples.iter().sum::<f64>() / samples.len().max(1) as f64;
            lines.push((k.clone(), format!("n={} mean={:.3}", samples.len(), mean)));
        }
        lines
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, labels: Labels<'_>, by: u64) {
        *self
            .write()
            .counters
            .entry(series_key(name, labels))
            .or_default() += by;
    }

    fn set_gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.write().gauges.insert(series_key(name, labels), value);
    }

    fn observe(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.write()
            .observations
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}
