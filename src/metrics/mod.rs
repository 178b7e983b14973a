//! Latency metrics
//!
//! Turns per-frame [`Sample`]s into live figures (fps, last latencies) and, while a
//! benchmark window is open, accumulates latencies for a median/p95 summary.

use crate::config::BackendMode;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared handle used by the scheduler, controller and status API
pub type SharedMetrics = Arc<Mutex<MetricsAggregator>>;

const FPS_RESET_MS: u64 = 1000;

/// Monotonic millisecond clock anchored to wall time at construction
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: tokio::time::Instant,
    origin_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            origin: tokio::time::Instant::now(),
            origin_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamps of one processed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub capture_ts: u64,
    pub inference_ts: u64,
    pub overlay_ts: u64,
}

impl Sample {
    pub fn inference_latency_ms(&self) -> f64 {
        self.inference_ts.saturating_sub(self.capture_ts) as f64
    }

    pub fn e2e_latency_ms(&self) -> f64 {
        self.overlay_ts.saturating_sub(self.capture_ts) as f64
    }
}

/// Live figures, recomputed on every sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LiveStats {
    pub fps: f64,
    pub e2e_latency_ms: f64,
    pub inference_latency_ms: f64,
    pub frames_total: u64,
}

/// Benchmark export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub mode: BackendMode,
    pub duration_s: f64,
    pub frames_processed: usize,
    pub median_e2e_ms: f64,
    pub p95_e2e_ms: f64,
    pub median_inference_ms: f64,
    pub p95_inference_ms: f64,
}

impl BenchmarkReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Linear-interpolated percentile; 0 for an empty sequence
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let index = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let frac = index - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

#[derive(Debug)]
struct BenchmarkRun {
    mode: BackendMode,
    started_at: u64,
    e2e: Vec<f64>,
    inference: Vec<f64>,
}

impl BenchmarkRun {
    fn finish(self, now_ms: u64, window_ms: u64) -> BenchmarkReport {
        let elapsed = now_ms.saturating_sub(self.started_at).min(window_ms);
        BenchmarkReport {
            mode: self.mode,
            duration_s: elapsed as f64 / 1000.0,
            frames_processed: self.e2e.len(),
            median_e2e_ms: percentile(&self.e2e, 50.0),
            p95_e2e_ms: percentile(&self.e2e, 95.0),
            median_inference_ms: percentile(&self.inference, 50.0),
            p95_inference_ms: percentile(&self.inference, 95.0),
        }
    }
}

/// Live stats plus an optional benchmark window
#[derive(Debug)]
pub struct MetricsAggregator {
    window_ms: u64,
    live: LiveStats,
    fps_count: u64,
    fps_reset_at: Option<u64>,
    run: Option<BenchmarkRun>,
    last_report: Option<BenchmarkReport>,
}

impl MetricsAggregator {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            live: LiveStats::default(),
            fps_count: 0,
            fps_reset_at: None,
            run: None,
            last_report: None,
        }
    }

    pub fn shared(window_ms: u64) -> SharedMetrics {
        Arc::new(Mutex::new(Self::new(window_ms)))
    }

    /// Account one sample. Returns the report if this sample closed the benchmark window.
    pub fn record(&mut self, sample: Sample, now_ms: u64) -> Option<BenchmarkReport> {
        self.live.frames_total += 1;
        self.fps_count += 1;
        match self.fps_reset_at {
            Some(reset_at) => {
                let elapsed = now_ms.saturating_sub(reset_at);
                if elapsed > FPS_RESET_MS {
                    self.live.fps = self.fps_count as f64 / (elapsed as f64 / 1000.0);
                    self.fps_count = 0;
                    self.fps_reset_at = Some(now_ms);
                }
            }
            None => {
                self.fps_count = 0;
                self.fps_reset_at = Some(now_ms);
            }
        }

        let e2e = sample.e2e_latency_ms();
        let inference = sample.inference_latency_ms();
        self.live.e2e_latency_ms = e2e;
        self.live.inference_latency_ms = inference;

        let elapsed = now_ms.saturating_sub(self.run.as_ref()?.started_at);
        if elapsed > self.window_ms {
            return self.stop(now_ms);
        }
        if let Some(run) = self.run.as_mut() {
            run.e2e.push(e2e);
            run.inference.push(inference);
        }
        if elapsed == self.window_ms {
            return self.stop(now_ms);
        }
        None
    }

    /// Open a benchmark window, discarding previously accumulated latencies
    pub fn start(&mut self, now_ms: u64, mode: BackendMode) {
        info!("Benchmark started ({} backend, {} ms window)", mode, self.window_ms);
        self.run = Some(BenchmarkRun {
            mode,
            started_at: now_ms,
            e2e: Vec::new(),
            inference: Vec::new(),
        });
        self.last_report = None;
    }

    /// Close the window if it has expired
    pub fn tick(&mut self, now_ms: u64) -> Option<BenchmarkReport> {
        let started_at = self.run.as_ref()?.started_at;
        if now_ms.saturating_sub(started_at) >= self.window_ms {
            debug!("Benchmark window elapsed");
            return self.stop(now_ms);
        }
        None
    }

    /// Close the window and summarise it. `None` if no benchmark was running.
    pub fn stop(&mut self, now_ms: u64) -> Option<BenchmarkReport> {
        let run = self.run.take()?;
        let report = run.finish(now_ms, self.window_ms);
        info!(
            "Benchmark finished: {} frames, e2e median {:.1} ms / p95 {:.1} ms, inference median {:.1} ms / p95 {:.1} ms",
            report.frames_processed,
            report.median_e2e_ms,
            report.p95_e2e_ms,
            report.median_inference_ms,
            report.p95_inference_ms
        );
        self.last_report = Some(report.clone());
        Some(report)
    }

    pub fn is_benchmarking(&self) -> bool {
        self.run.is_some()
    }

    /// Frames accumulated by the running benchmark, or by the last finished one
    pub fn frames_processed(&self) -> usize {
        match (&self.run, &self.last_report) {
            (Some(run), _) => run.e2e.len(),
            (None, Some(report)) => report.frames_processed,
            (None, None) => 0,
        }
    }

    pub fn live(&self) -> LiveStats {
        self.live
    }

    pub fn last_report(&self) -> Option<&BenchmarkReport> {
        self.last_report.as_ref()
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}
