use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Histograms keep only their most recent observations.
const HISTOGRAM_CAPACITY: usize = 1024;

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: String,
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
    pub value: f64,
    /// Present for histograms only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
}

struct Gauge {
    // f64 bits
    value: AtomicU64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0f64.to_bits()),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    total: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(64)),
            total: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_CAPACITY {
            obs.pop_front();
        }
        obs.push_back(value);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        HistogramSummary {
            count: self.total.load(Ordering::Relaxed),
            sum: sorted.iter().sum(),
            p50: sorted[n / 2],
            p95: sorted[(n * 95 / 100).min(n - 1)],
            max: sorted[n - 1],
        }
    }
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-memory metrics recorder.
///
/// Nothing is persisted; `snapshot()` is the only way values leave the process.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.value.fetch_add(n, Ordering::Relaxed);
            return;
        }
        drop(counters);
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .value
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        self.gauges.write().entry(key).or_insert_with(Gauge::new).set(value);
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map(|c| c.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.read().get(&MetricKey::new(name, labels)).map(Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSummary> {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Histogram::summary)
    }

    /// Current value of every series, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let timestamp = Utc::now().to_rfc3339();
        let mut samples = Vec::new();

        for (key, c) in self.counters.read().iter() {
            samples.push(MetricSample {
                timestamp: timestamp.clone(),
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Counter,
                value: c.value.load(Ordering::Relaxed) as f64,
                summary: None,
            });
        }
        for (key, g) in self.gauges.read().iter() {
            samples.push(MetricSample {
                timestamp: timestamp.clone(),
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Gauge,
                value: g.get(),
                summary: None,
            });
        }
        for (key, h) in self.histograms.read().iter() {
            let summary = h.summary();
            samples.push(MetricSample {
                timestamp: timestamp.clone(),
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Histogram,
                value: summary.p50,
                summary: Some(summary),
            });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}
