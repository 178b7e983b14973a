//! Application context
//!
//! [`Controller`] owns everything one running instance needs: the connection negotiator,
//! the frame scheduler for the current video source, both inference backends, the
//! runtime settings and the metrics aggregator. It also bridges video received over
//! the link into the scheduler. The CLI and the status API both drive the
//! system through it, and [`Controller::dispose`] tears all of it down.

use crate::capture::{FrameFeed, VideoSource};
use crate::config::{BackendMode, Config};
use crate::inference::{Backends, DetectionSet, Diagnostics, InferenceError, LocalBackend, RemoteBackend};
use crate::metrics::{BenchmarkReport, Clock, LiveStats, MetricsAggregator, SharedMetrics};
use crate::runtime_settings::RuntimeSettings;
use crate::scheduler::{FrameScheduler, SchedulerCounters, SchedulerOptions};
use crate::timer::Ticker;
use crate::webrtc::{ConnectionNegotiator, DecoderFactory, LinkState, MediaProvider, RemoteVideoBridge, Role};
use log::info;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Snapshot served by the status API
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub mode: BackendMode,
    pub link_state: LinkState,
    pub live: LiveStats,
    pub scheduler: SchedulerCounters,
    pub benchmarking: bool,
    pub backend_failures: u64,
}

pub struct Controller {
    config: Config,
    clock: Clock,
    started: Instant,
    settings: Arc<RuntimeSettings>,
    metrics: SharedMetrics,
    diagnostics: Arc<Diagnostics>,
    backends: Backends,
    negotiator: ConnectionNegotiator,
    scheduler: Mutex<Option<FrameScheduler>>,
    bridge: Mutex<Option<RemoteVideoBridge>>,
    deadline: Mutex<Option<Ticker>>,
    disposed: AtomicBool,
}

impl Controller {
    pub fn new(
        config: Config,
        negotiator: ConnectionNegotiator,
        backends: Backends,
        diagnostics: Arc<Diagnostics>,
        clock: Clock,
    ) -> Self {
        Self {
            settings: Arc::new(RuntimeSettings::new(&config)),
            metrics: MetricsAggregator::shared(config.benchmark.window_ms),
            config,
            clock,
            started: Instant::now(),
            diagnostics,
            backends,
            negotiator,
            scheduler: Mutex::new(None),
            bridge: Mutex::new(None),
            deadline: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Build both backends and a negotiator for `role` from configuration
    pub fn from_config(
        config: Config,
        role: Role,
        media: Option<Arc<dyn MediaProvider>>,
    ) -> Result<Self, InferenceError> {
        let clock = Clock::new();
        let diagnostics = Diagnostics::new();
        let local = LocalBackend::from_config(&config.inference, diagnostics.clone());
        let remote = RemoteBackend::from_config(&config.inference, clock, diagnostics.clone())?;
        let mut negotiator = ConnectionNegotiator::new(role, config.webrtc.clone());
        if let Some(provider) = media {
            negotiator = negotiator.with_media_provider(provider);
        }
        Ok(Self::new(
            config,
            negotiator,
            Backends::new(local, remote),
            diagnostics,
            clock,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn negotiator(&self) -> &ConnectionNegotiator {
        &self.negotiator
    }

    pub fn settings(&self) -> &Arc<RuntimeSettings> {
        &self.settings
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Start detecting on `source`, replacing any previous source. Returns the
    /// detections feed for the renderer.
    pub fn attach_source(&self, source: Box<dyn VideoSource>) -> Option<watch::Receiver<DetectionSet>> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.scheduler.lock();
        // The previous loops are gone before the new ones start
        if let Some(mut previous) = slot.take() {
            previous.dispose();
        }
        let mut scheduler = FrameScheduler::new(
            source,
            self.backends.clone(),
            self.settings.clone(),
            self.metrics.clone(),
            self.clock,
            SchedulerOptions::from_config(&self.config),
        );
        scheduler.start();
        let detections = scheduler.detections();
        *slot = Some(scheduler);
        Some(detections)
    }

    /// Detect on the video received over the link. Each remote track is decoded into a
    /// frame feed that the scheduler samples; a new link's track replaces the old one.
    pub fn attach_remote_video(
        &self,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Option<watch::Receiver<DetectionSet>> {
        let (feed, handle) = FrameFeed::new();
        let detections = self.attach_source(Box::new(feed))?;
        let bridge = RemoteVideoBridge::spawn(self.negotiator.remote_stream(), decoders, handle);
        if let Some(mut previous) = self.bridge.lock().replace(bridge) {
            previous.stop();
        }
        Some(detections)
    }

    pub fn detach_source(&self) {
        if let Some(mut bridge) = self.bridge.lock().take() {
            bridge.stop();
        }
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.dispose();
        }
    }

    pub fn has_remote_video(&self) -> bool {
        self.bridge.lock().as_ref().is_some_and(RemoteVideoBridge::is_running)
    }

    pub fn has_source(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    pub fn detections(&self) -> Option<watch::Receiver<DetectionSet>> {
        self.scheduler.lock().as_ref().map(FrameScheduler::detections)
    }

    pub fn scheduler_counters(&self) -> SchedulerCounters {
        self.scheduler
            .lock()
            .as_ref()
            .map(FrameScheduler::counters)
            .unwrap_or_default()
    }

    pub fn mode(&self) -> BackendMode {
        self.settings.mode()
    }

    /// Takes effect on the next dispatch cycle
    pub fn set_mode(&self, mode: BackendMode) -> BackendMode {
        self.settings.set_mode(mode)
    }

    pub fn live_stats(&self) -> LiveStats {
        self.metrics.lock().live()
    }

    pub fn status(&self) -> Status {
        let (live, benchmarking) = {
            let metrics = self.metrics.lock();
            (metrics.live(), metrics.is_benchmarking())
        };
        Status {
            mode: self.mode(),
            link_state: self.negotiator.state(),
            live,
            scheduler: self.scheduler_counters(),
            benchmarking,
            backend_failures: self.diagnostics.failure_count(),
        }
    }

    /// Open a benchmark window for the active backend. The window closes on the first
    /// sample past the deadline or when the deadline timer fires, whichever comes first.
    pub fn start_benchmark(&self) {
        let window = {
            let mut metrics = self.metrics.lock();
            metrics.start(self.clock.now_ms(), self.mode());
            metrics.window_ms()
        };

        let metrics = self.metrics.clone();
        let clock = self.clock;
        let ticker = Ticker::once("benchmark-deadline", Duration::from_millis(window), move || async move {
            metrics.lock().tick(clock.now_ms());
        });
        if let Some(mut previous) = self.deadline.lock().replace(ticker) {
            previous.cancel();
        }
    }

    /// Close the window early. `None` if no benchmark was running.
    pub fn stop_benchmark(&self) -> Option<BenchmarkReport> {
        if let Some(mut ticker) = self.deadline.lock().take() {
            ticker.cancel();
        }
        self.metrics.lock().stop(self.clock.now_ms())
    }

    pub fn is_benchmarking(&self) -> bool {
        self.metrics.lock().is_benchmarking()
    }

    pub fn benchmark_report(&self) -> Option<BenchmarkReport> {
        self.metrics.lock().last_report().cloned()
    }

    /// Release the link, both loops and the benchmark timer. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach_source();
        let deadline = self.deadline.lock().take();
        if let Some(mut ticker) = deadline {
            ticker.cancel();
        }
        self.negotiator.release().await;
        info!("Controller disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRTCConfig;
    use crate::encode::{Encoder, EncoderConfig};
    use crate::inference::{
        DetectRequest, DetectResponse, DetectionDecoder, DetectionService, ModelLoader,
        ModelSession,
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    struct EchoService;

    #[async_trait]
    impl DetectionService for EchoService {
        async fn detect(&self, request: DetectRequest) -> Result<DetectResponse, InferenceError> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(DetectResponse {
                frame_id: request.frame_id,
                capture_ts: request.capture_ts,
                recv_ts: request.recv_ts,
                inference_ts: request.recv_ts,
                detections: Vec::new(),
            })
        }
    }

    struct MissingModel;

    impl ModelLoader for MissingModel {
        fn load(&self) -> Result<Box<dyn ModelSession>, InferenceError> {
            Err(InferenceError::AssetUnavailable("model.onnx".into()))
        }
    }

    fn test_controller() -> Controller {
        let mut config = Config::default();
        config.inference.mode = BackendMode::Remote;
        let clock = Clock::new();
        let diagnostics = Diagnostics::new();
        let remote = RemoteBackend::new(
            Arc::new(EchoService),
            Encoder::new(EncoderConfig::default()),
            clock,
            diagnostics.clone(),
        );
        let local = LocalBackend::new(Arc::new(MissingModel), DetectionDecoder::default(), diagnostics.clone());
        let negotiator = ConnectionNegotiator::new(
            Role::Receiver,
            WebRTCConfig {
                ice_servers: vec![],
                ..Default::default()
            },
        );
        Controller::new(config, negotiator, Backends::new(local, remote), diagnostics, clock)
    }

    fn feed() -> Box<dyn VideoSource> {
        let (feed, handle) = FrameFeed::new();
        handle.push(2, 2, Bytes::from(vec![0u8; 12])).unwrap();
        Box::new(feed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_benchmark_auto_stops_at_window() {
        let controller = test_controller();
        controller.attach_source(feed());
        controller.start_benchmark();

        tokio::time::sleep(Duration::from_millis(29_999)).await;
        assert!(controller.is_benchmarking());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!controller.is_benchmarking());
        let report = controller.benchmark_report().unwrap();
        assert_eq!(report.mode, BackendMode::Remote);
        assert_eq!(report.duration_s, 30.0);
        assert!(report.frames_processed > 0);
        assert!(report.median_inference_ms >= 40.0);

        controller.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_benchmark_early() {
        let controller = test_controller();
        assert!(controller.stop_benchmark().is_none());

        controller.start_benchmark();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let report = controller.stop_benchmark().unwrap();
        assert_eq!(report.frames_processed, 0);
        assert_eq!(report.median_e2e_ms, 0.0);
        assert_eq!(report.duration_s, 1.0);

        // The cancelled deadline must not touch a later window
        controller.start_benchmark();
        tokio::time::sleep(Duration::from_millis(29_500)).await;
        assert!(controller.is_benchmarking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_keeps_scheduler_state() {
        let controller = test_controller();
        controller.attach_source(feed());
        tokio::time::sleep(Duration::from_millis(500)).await;
        let before = controller.scheduler_counters();
        assert!(before.completed > 0);

        assert_eq!(controller.set_mode(BackendMode::Local), BackendMode::Remote);
        assert_eq!(controller.status().mode, BackendMode::Local);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(controller.scheduler_counters().completed > before.completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_source_stops_previous_loops() {
        let controller = test_controller();
        let (first, first_handle) = FrameFeed::new();
        first_handle.push(2, 2, Bytes::from(vec![0u8; 12])).unwrap();
        let first_stats = first.stats();
        controller.attach_source(Box::new(first)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(first_stats.captured() > 0);

        controller.attach_source(feed()).unwrap();
        let captured = first_stats.captured();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first_stats.captured(), captured);
        assert!(controller.scheduler_counters().captured > 0);
    }

    struct RefuseAll;

    impl DecoderFactory for RefuseAll {
        fn create(&self, mime_type: &str) -> Result<Box<dyn crate::webrtc::VideoDecoder>, crate::webrtc::WebRTCError> {
            Err(crate::webrtc::WebRTCError::Media(format!("no decoder for {}", mime_type)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_video_feeds_scheduler() {
        let controller = test_controller();
        let detections = controller.attach_remote_video(Arc::new(RefuseAll));
        assert!(detections.is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(controller.has_source());
        assert!(controller.has_remote_video());
        // nothing received yet, so nothing is sampled
        assert_eq!(controller.scheduler_counters().captured, 0);

        controller.dispose().await;
        assert!(!controller.has_remote_video());
        assert!(!controller.has_source());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_releases_everything() {
        let controller = test_controller();
        controller.attach_source(feed()).unwrap();
        controller.start_benchmark();
        tokio::time::sleep(Duration::from_millis(200)).await;

        controller.dispose().await;
        assert!(controller.is_disposed());
        assert!(!controller.has_source());
        assert!(controller.detections().is_none());
        assert!(controller.attach_source(feed()).is_none());

        // Idempotent
        controller.dispose().await;
    }
}
