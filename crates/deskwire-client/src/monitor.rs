//! Update outcome tracking and automatic degradation.
//!
//! Every dashboard update reports one [`UpdateMetric`]. When the failure rate
//! over the most recent window exceeds the threshold, the incremental update
//! flag is switched off and the dashboard falls back to full reloads until a
//! human re-enables it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use deskwire_core::UpdateMetric;
use deskwire_settings::{MonitorSettings, INCREMENTAL_UPDATES};
use deskwire_telemetry::MetricsRecorder;

use crate::flags::FeatureFlagStore;

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorConfig {
    pub error_threshold: f64,
    /// Metrics retained.
    pub capacity: usize,
    /// Most recent metrics the error rate is computed over.
    pub window: usize,
    pub min_samples: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            error_threshold: settings.error_threshold,
            capacity: settings.capacity.max(1),
            window: settings.window.max(1),
            min_samples: settings.min_samples,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackDetails {
    pub incremental: bool,
}

/// The monitor switched incremental updates off.
#[derive(Clone, Debug, PartialEq)]
pub struct Degradation {
    pub flag: String,
    pub error_rate: f64,
    pub samples: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSummary {
    pub samples: usize,
    pub error_rate: f64,
    pub incremental_share: f64,
    pub avg_duration_ms: f64,
    pub degradations: u64,
    pub incremental_enabled: bool,
}

pub struct UpdateMonitor {
    config: MonitorConfig,
    flags: Arc<FeatureFlagStore>,
    metrics: Mutex<VecDeque<UpdateMetric>>,
    degradations: AtomicU64,
    recorder: Option<Arc<MetricsRecorder>>,
}

impl UpdateMonitor {
    pub fn new(config: MonitorConfig, flags: Arc<FeatureFlagStore>) -> Self {
        Self {
            metrics: Mutex::new(VecDeque::with_capacity(config.capacity)),
            config,
            flags,
            degradations: AtomicU64::new(0),
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record one outcome and degrade if warranted.
    pub fn track(
        &self,
        event_type: &str,
        success: bool,
        duration_ms: u64,
        details: TrackDetails,
    ) -> Option<Degradation> {
        self.record(UpdateMetric::new(
            event_type,
            success,
            duration_ms,
            details.incremental,
        ));
        self.evaluate_and_maybe_degrade()
    }

    /// Append to the ring without evaluating.
    pub fn record(&self, metric: UpdateMetric) {
        if let Some(recorder) = &self.recorder {
            let mode = if metric.applied_incrementally {
                "incremental"
            } else {
                "full_reload"
            };
            recorder.histogram_observe(
                "update.duration_ms",
                &[("mode", mode)],
                metric.duration_ms as f64,
            );
            if !metric.success {
                recorder.counter_inc("update.failures", &[("event_type", metric.event_type.as_str())], 1);
            }
        }
        debug!(
            event_type = %metric.event_type,
            success = metric.success,
            duration_ms = metric.duration_ms,
            incremental = metric.applied_incrementally,
            "update tracked"
        );

        let mut metrics = self.metrics.lock();
        while metrics.len() >= self.config.capacity {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    /// Disable incremental updates when the window failure rate is above the
    /// threshold, enough samples exist, and the flag is currently on.
    pub fn evaluate_and_maybe_degrade(&self) -> Option<Degradation> {
        let (error_rate, samples) = {
            let metrics = self.metrics.lock();
            (window_error_rate(&metrics, self.config.window), metrics.len())
        };
        if let Some(recorder) = &self.recorder {
            recorder.gauge_set("update.error_rate", &[], error_rate);
        }

        if samples < self.config.min_samples || error_rate <= self.config.error_threshold {
            return None;
        }
        if !self.flags.is_enabled(INCREMENTAL_UPDATES) || !self.flags.disable(INCREMENTAL_UPDATES)
        {
            return None;
        }

        let total = self.degradations.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            error_rate,
            threshold = self.config.error_threshold,
            samples,
            degradations = total,
            "update error rate above threshold, disabling incremental updates"
        );
        if let Some(recorder) = &self.recorder {
            recorder.counter_inc("update.degradations", &[], 1);
        }
        Some(Degradation {
            flag: INCREMENTAL_UPDATES.to_string(),
            error_rate,
            samples,
        })
    }

    /// Failure rate over the most recent window. `0.0` with no samples.
    pub fn error_rate(&self) -> f64 {
        window_error_rate(&self.metrics.lock(), self.config.window)
    }

    /// Oldest first.
    pub fn metrics(&self) -> Vec<UpdateMetric> {
        self.metrics.lock().iter().cloned().collect()
    }

    pub fn degradations(&self) -> u64 {
        self.degradations.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> MonitorSummary {
        let metrics = self.metrics.lock();
        let samples = metrics.len();
        let (incremental, total_ms) = metrics.iter().fold((0usize, 0u64), |(inc, ms), m| {
            (
                inc + usize::from(m.applied_incrementally),
                ms.saturating_add(m.duration_ms),
            )
        });
        let ratio = |n: f64| if samples == 0 { 0.0 } else { n / samples as f64 };
        MonitorSummary {
            samples,
            error_rate: window_error_rate(&metrics, self.config.window),
            incremental_share: ratio(incremental as f64),
            avg_duration_ms: ratio(total_ms as f64),
            degradations: self.degradations(),
            incremental_enabled: self.flags.is_enabled(INCREMENTAL_UPDATES),
        }
    }
}

fn window_error_rate(metrics: &VecDeque<UpdateMetric>, window: usize) -> f64 {
    let recent = metrics.iter().rev().take(window);
    let (failures, total) = recent.fold((0usize, 0usize), |(f, t), m| {
        (f + usize::from(!m.success), t + 1)
    });
    if total == 0 {
        0.0
    } else {
        failures as f64 / total as f64
    }
}
