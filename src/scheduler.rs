//! Frame scheduler
//!
//! Two periodic loops share a single-capacity frame slot. The capture loop samples the
//! video source at the display rate when the slot is empty; the dispatch loop runs at a fixed
//! rate and, when no inference is in flight, claims the pending frame and hands it to the
//! active backend. Frames that arrive while an inference is running are dropped, so
//! latency stays bounded by one inference instead of growing with a queue.

use crate::capture::{MediaFrame, VideoSource};
use crate::config::{Config, SlotPolicy};
use crate::inference::{Backends, DetectionSet};
use crate::metrics::{Clock, Sample, SharedMetrics};
use crate::runtime_settings::RuntimeSettings;
use crate::timer::Ticker;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub capture_period: Duration,
    pub dispatch_period: Duration,
    pub slot_policy: SlotPolicy,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_period: period_for(config.capture.capture_hz),
            dispatch_period: period_for(config.scheduler.dispatch_hz),
            slot_policy: config.capture.slot_policy,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn period_for(hz: u32) -> Duration {
    Duration::from_micros(1_000_000 / hz.max(1) as u64)
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounters {
    pub captured: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub completed: u64,
    /// Results that arrived after dispose
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SchedulerCounters {
        SchedulerCounters {
            captured: self.captured.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<MediaFrame>,
    busy: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    source: Mutex<Box<dyn VideoSource>>,
    policy: SlotPolicy,
    backends: Backends,
    settings: Arc<RuntimeSettings>,
    metrics: SharedMetrics,
    clock: Clock,
    disposed: AtomicBool,
    detections: watch::Sender<DetectionSet>,
    counters: Counters,
}

/// Clears the busy flag when the in-flight inference ends, however it ends
struct BusyGuard(Arc<Shared>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.slot.lock().busy = false;
    }
}

impl Shared {
    fn capture_tick(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.policy == SlotPolicy::FillEmpty && self.slot.lock().pending.is_some() {
            if self.source.lock().is_active() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        let frame = {
            let mut source = self.source.lock();
            if !source.is_active() {
                return;
            }
            match source.capture(self.clock.now_ms()) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    warn!("Capture failed: {}", e);
                    return;
                }
            }
        };
        self.counters.captured.fetch_add(1, Ordering::Relaxed);

        // Displaced or rejected frames are released after the slot lock is dropped
        let dropped = {
            let mut slot = self.slot.lock();
            match self.policy {
                SlotPolicy::Latest => slot.pending.replace(frame),
                SlotPolicy::FillEmpty if slot.pending.is_none() => {
                    slot.pending = Some(frame);
                    None
                }
                SlotPolicy::FillEmpty => Some(frame),
            }
        };
        if let Some(frame) = dropped {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped frame {}", frame.id);
        }
    }

    fn dispatch_tick(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let frame = {
            let mut slot = self.slot.lock();
            if slot.busy {
                return;
            }
            let Some(frame) = slot.pending.take() else {
                return;
            };
            slot.busy = true;
            frame
        };
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let backend = self.backends.select(self.settings.mode());
        let guard = BusyGuard(self.clone());
        tokio::spawn(async move {
            let shared = guard.0.clone();
            let detections = backend.infer(&frame).await;
            let inference_ts = shared.clock.now_ms();
            let (frame_id, capture_ts) = (frame.id, frame.captured_at_ms);
            frame.release();

            if shared.disposed.load(Ordering::Acquire) {
                shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding result for frame {} after dispose", frame_id);
                drop(guard);
                return;
            }

            shared.detections.send_replace(DetectionSet {
                frame_id,
                backend: Some(backend.mode()),
                detections,
            });
            let overlay_ts = shared.clock.now_ms();
            let sample = Sample {
                capture_ts,
                inference_ts,
                overlay_ts,
            };
            if let Some(report) = shared.metrics.lock().record(sample, overlay_ts) {
                info!("Benchmark window elapsed: {}", report.to_json());
            }
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            drop(guard);
        });
    }
}

/// Capture + dispatch loops over a latest-frame slot
pub struct FrameScheduler {
    shared: Arc<Shared>,
    options: SchedulerOptions,
    capture: Option<Ticker>,
    dispatch: Option<Ticker>,
}

impl FrameScheduler {
    pub fn new(
        source: Box<dyn VideoSource>,
        backends: Backends,
        settings: Arc<RuntimeSettings>,
        metrics: SharedMetrics,
        clock: Clock,
        options: SchedulerOptions,
    ) -> Self {
        let (detections, _) = watch::channel(DetectionSet::default());
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::default()),
            source: Mutex::new(source),
            policy: options.slot_policy,
            backends,
            settings,
            metrics,
            clock,
            disposed: AtomicBool::new(false),
            detections,
            counters: Counters::default(),
        });
        Self {
            shared,
            options,
            capture: None,
            dispatch: None,
        }
    }

    /// Start both loops. No-op if running or disposed.
    pub fn start(&mut self) {
        if self.is_running() || self.is_disposed() {
            return;
        }
        let shared = self.shared.clone();
        self.capture = Some(Ticker::spawn("capture", self.options.capture_period, move || {
            shared.capture_tick();
            async {}
        }));
        let shared = self.shared.clone();
        self.dispatch = Some(Ticker::spawn("dispatch", self.options.dispatch_period, move || {
            shared.dispatch_tick();
            async {}
        }));
        info!(
            "Scheduler started (capture every {:?}, dispatch every {:?}, {:?} slot)",
            self.options.capture_period, self.options.dispatch_period, self.options.slot_policy
        );
    }

    /// Cancel both loops; the pending frame stays in the slot
    pub fn stop(&mut self) {
        if let Some(mut ticker) = self.capture.take() {
            ticker.cancel();
        }
        if let Some(mut ticker) = self.dispatch.take() {
            ticker.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.capture.as_ref().is_some_and(Ticker::is_active)
    }

    /// Stop the loops and release the pending frame. A result still in flight is
    /// discarded when it arrives.
    pub fn dispose(&mut self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        let pending = self.shared.slot.lock().pending.take();
        drop(pending);
        info!("Scheduler disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.slot.lock().busy
    }

    /// Latest published detections
    pub fn detections(&self) -> watch::Receiver<DetectionSet> {
        self.shared.detections.subscribe()
    }

    pub fn counters(&self) -> SchedulerCounters {
        self.shared.counters.snapshot()
    }

    /// Frames captured but not yet released by the source's bookkeeping
    pub fn outstanding_frames(&self) -> u64 {
        self.shared.source.lock().stats().outstanding()
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameFeed;
    use crate::config::BackendMode;
    use crate::encode::{Encoder, EncoderConfig};
    use crate::inference::{
        DetectRequest, DetectResponse, DetectionDecoder, DetectionService, Diagnostics,
        InferenceError, LocalBackend, ModelLoader, ModelSession, RemoteBackend, RemoteDetection,
    };
    use crate::metrics::MetricsAggregator;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct SlowService {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl DetectionService for SlowService {
        async fn detect(&self, request: DetectRequest) -> Result<DetectResponse, InferenceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(DetectResponse {
                frame_id: request.frame_id,
                capture_ts: request.capture_ts,
                recv_ts: request.recv_ts,
                inference_ts: request.recv_ts,
                detections: vec![RemoteDetection {
                    label: "person".into(),
                    score: 0.9,
                    xmin: 0.1,
                    ymin: 0.1,
                    xmax: 0.5,
                    ymax: 0.9,
                }],
            })
        }
    }

    struct MissingModel;

    impl ModelLoader for MissingModel {
        fn load(&self) -> Result<Box<dyn ModelSession>, InferenceError> {
            Err(InferenceError::AssetUnavailable("model.onnx".into()))
        }
    }

    struct Harness {
        scheduler: FrameScheduler,
        service: Arc<SlowService>,
        settings: Arc<RuntimeSettings>,
        metrics: SharedMetrics,
    }

    fn harness(policy: SlotPolicy) -> Harness {
        let (feed, handle) = FrameFeed::new();
        handle.push(4, 4, Bytes::from(vec![128u8; 4 * 4 * 3])).unwrap();

        let clock = Clock::new();
        let diagnostics = Diagnostics::new();
        let service = Arc::new(SlowService {
            delay: Duration::from_millis(100),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let remote = RemoteBackend::new(
            service.clone(),
            Encoder::new(EncoderConfig::default()),
            clock,
            diagnostics.clone(),
        );
        let local = LocalBackend::new(Arc::new(MissingModel), DetectionDecoder::default(), diagnostics);
        let settings = Arc::new(RuntimeSettings::with_mode(BackendMode::Remote));
        let metrics = MetricsAggregator::shared(30_000);

        let options = SchedulerOptions {
            capture_period: Duration::from_millis(33),
            dispatch_period: Duration::from_millis(33),
            slot_policy: policy,
        };
        let scheduler = FrameScheduler::new(
            Box::new(feed),
            Backends::new(local, remote),
            settings.clone(),
            metrics.clone(),
            clock,
            options,
        );
        Harness {
            scheduler,
            service,
            settings,
            metrics,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_inference_in_flight() {
        let mut h = harness(SlotPolicy::default());
        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let counters = h.scheduler.counters();
        assert_eq!(h.service.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(counters.completed >= 5, "{:?}", counters);
        assert!(counters.dropped >= 2 * counters.completed, "{:?}", counters);
        assert!(counters.dispatched <= counters.completed + 1);
        assert_eq!(h.metrics.lock().live().frames_total, counters.completed);

        let latest = h.scheduler.detections().borrow().clone();
        assert_eq!(latest.backend, Some(BackendMode::Remote));
        assert_eq!(latest.detections.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_empty_skips_capture_while_frame_pending() {
        let mut h = harness(SlotPolicy::FillEmpty);
        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let counters = h.scheduler.counters();
        assert_eq!(h.service.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(counters.dropped > 0);
        // every captured frame is either dispatched or still pending
        assert_eq!(
            counters.captured,
            counters.dispatched + h.scheduler.shared.slot.lock().pending.is_some() as u64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_replaces_pending_frame() {
        let mut h = harness(SlotPolicy::Latest);
        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let counters = h.scheduler.counters();
        assert_eq!(h.service.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(counters.dropped > 0);
        assert_eq!(
            counters.captured,
            counters.dispatched + counters.dropped + h.scheduler.shared.slot.lock().pending.is_some() as u64
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_discards_late_result_and_releases_frames() {
        let mut h = harness(SlotPolicy::Latest);
        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.scheduler.is_busy());

        let before = h.scheduler.detections().borrow().frame_id;
        h.scheduler.dispose();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let counters = h.scheduler.counters();
        assert_eq!(counters.discarded, 1);
        assert_eq!(h.scheduler.detections().borrow().frame_id, before);
        assert!(!h.scheduler.is_busy());
        assert_eq!(h.scheduler.outstanding_frames(), 0);

        // Disposed schedulers do not restart
        h.scheduler.start();
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_applies_to_next_dispatch() {
        let mut h = harness(SlotPolicy::Latest);
        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let before = h.scheduler.counters();
        assert!(before.completed > 0);

        h.settings.set_mode(BackendMode::Local);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let after = h.scheduler.counters();
        assert!(after.completed > before.completed);
        let latest = h.scheduler.detections().borrow().clone();
        assert_eq!(latest.backend, Some(BackendMode::Local));
        assert!(latest.detections.is_empty());
    }
}
