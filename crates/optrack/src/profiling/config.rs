use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env;

const DEFAULT_WARM_UP: usize = 3;
const DEFAULT_MEASURE_FOR: usize = 3;
const DEFAULT_BACKWARD_WINDOW_MS: u64 = 10_000;

/// Where backward passes are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackwardMode {
    /// On the calling thread, right after the forward measurement.
    #[default]
    Inline,
    /// On a dedicated backward queue, paired with the forward call by correlation id.
    Queued,
}

/// Measurement settings consumed when a profiler is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Named per-kernel metrics to request from the timing service.
    pub metrics: Vec<String>,
    /// Operations faster than this are measured without metrics; 0 always collects them.
    pub metrics_threshold_ms: f64,
    /// Untimed runs after the dry run.
    pub warm_up: usize,
    /// Timed runs averaged into the reported run time.
    pub measure_for: usize,
    pub backward_mode: BackwardMode,
    /// How long a forward call waits for its queued backward completion.
    pub backward_window_ms: u64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            metrics: Vec::new(),
            metrics_threshold_ms: 0.0,
            warm_up: DEFAULT_WARM_UP,
            measure_for: DEFAULT_MEASURE_FOR,
            backward_mode: BackwardMode::Inline,
            backward_window_ms: DEFAULT_BACKWARD_WINDOW_MS,
        }
    }
}

impl ProfilerConfig {
    /// Defaults overridden by `OPTRACK_*` environment variables.
    ///
    /// Recognised: `OPTRACK_METRICS` (comma list), `OPTRACK_METRICS_THRESHOLD_MS`,
    /// `OPTRACK_WARM_UP`, `OPTRACK_MEASURE_FOR`, `OPTRACK_BACKWARD_QUEUED`,
    /// `OPTRACK_BACKWARD_WINDOW_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = ProfilerConfig::default();
        if let Some(metrics) = env::list_var("OPTRACK_METRICS") {
            config.metrics = metrics;
        }
        if let Some(threshold) = env::parsed_var::<f64>("OPTRACK_METRICS_THRESHOLD_MS")? {
            config.metrics_threshold_ms = threshold;
        }
        if let Some(warm_up) = env::parsed_var("OPTRACK_WARM_UP")? {
            config.warm_up = warm_up;
        }
        if let Some(measure_for) = env::parsed_var("OPTRACK_MEASURE_FOR")? {
            config.measure_for = measure_for;
        }
        if let Some(queued) = env::bool_var("OPTRACK_BACKWARD_QUEUED") {
            config.backward_mode = if queued {
                BackwardMode::Queued
            } else {
                BackwardMode::Inline
            };
        }
        if let Some(window) = env::parsed_var("OPTRACK_BACKWARD_WINDOW_MS")? {
            config.backward_window_ms = window;
        }
        config.validate().context("invalid profiler configuration")?;
        Ok(config)
    }

    /// Single timed run and no warm-up; for tests and quick sweeps.
    pub fn single_run() -> Self {
        ProfilerConfig {
            warm_up: 0,
            measure_for: 1,
            ..ProfilerConfig::default()
        }
    }

    pub fn with_metrics<I, S>(mut self, metrics: I, threshold_ms: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self.metrics_threshold_ms = threshold_ms;
        self
    }

    pub fn with_backward_mode(mut self, mode: BackwardMode) -> Self {
        self.backward_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.metrics_threshold_ms.is_finite() && self.metrics_threshold_ms >= 0.0,
            "metrics threshold must be a non-negative number of milliseconds, got {}",
            self.metrics_threshold_ms
        );
        anyhow::ensure!(self.measure_for > 0, "measure_for must be at least 1");
        Ok(())
    }

    pub fn backward_window(&self) -> Duration {
        Duration::from_millis(self.backward_window_ms)
    }

    /// Metrics are requested only when some are configured and the run time clears the threshold.
    pub fn collects_metrics_for(&self, run_time_ms: f64) -> bool {
        !self.metrics.is_empty()
            && (self.metrics_threshold_ms == 0.0 || run_time_ms >= self.metrics_threshold_ms)
    }
}
