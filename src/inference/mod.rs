//! Inference backends
//!
//! Both variants share one contract: `infer(frame)` resolves to a list of detections and
//! never fails. Internal failures are reported through [`Diagnostics`] and yield an empty
//! list for that frame.

pub mod decoder;
pub mod labels;
pub mod local;
pub mod remote;

pub use decoder::{iou, non_max_suppression, BBox, DecoderConfig, DetectionDecoder};
pub use local::{LocalBackend, ModelLoader, ModelSession};
pub use remote::{
    DetectRequest, DetectResponse, DetectionService, HttpDetectionService, RemoteBackend,
    RemoteDetection,
};

use crate::capture::MediaFrame;
use crate::config::BackendMode;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Backend-internal failures. Never crosses [`InferenceBackend::infer`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("model asset unavailable: {0}")]
    AssetUnavailable(String),
    #[error("model session failed: {0}")]
    Session(String),
    #[error("unexpected output tensor: {0}")]
    OutputShape(String),
    #[error("frame preprocessing failed: {0}")]
    Preprocess(String),
    #[error("payload encoding failed: {0}")]
    Encode(String),
    #[error("remote detection request failed: {0}")]
    Transport(String),
    #[error("remote detection response rejected: {0}")]
    Response(String),
}

impl InferenceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InferenceError::AssetUnavailable(_) => FailureKind::AssetUnavailable,
            _ => FailureKind::Backend,
        }
    }
}

/// One detected object, coordinates normalized to the frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub backend: BackendMode,
}

impl Detection {
    /// `0 <= xmin <= xmax <= 1`, `0 <= ymin <= ymax <= 1` and score within [0, 1]
    pub fn is_normalized(&self) -> bool {
        let unit = |v: f32| (0.0..=1.0).contains(&v);
        unit(self.xmin)
            && unit(self.xmax)
            && unit(self.ymin)
            && unit(self.ymax)
            && self.xmin <= self.xmax
            && self.ymin <= self.ymax
            && unit(self.score)
    }
}

/// Detections produced for one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    pub frame_id: u64,
    pub backend: Option<BackendMode>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Backend,
    AssetUnavailable,
}

/// Out-of-band failure report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendFailure {
    pub backend: BackendMode,
    pub kind: FailureKind,
    pub cause: String,
}

/// Failure channel shared by both backends. Each distinct cause is logged and broadcast once.
pub struct Diagnostics {
    seen: Mutex<HashSet<(BackendMode, String)>>,
    total: AtomicU64,
    tx: broadcast::Sender<BackendFailure>,
}

impl Diagnostics {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(32);
        Arc::new(Self {
            seen: Mutex::new(HashSet::new()),
            total: AtomicU64::new(0),
            tx,
        })
    }

    pub fn report(&self, backend: BackendMode, error: &InferenceError) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let cause = error.to_string();
        if !self.seen.lock().insert((backend, cause.clone())) {
            return;
        }
        warn!("{} backend: {}", backend, cause);
        let _ = self.tx.send(BackendFailure {
            backend,
            kind: error.kind(),
            cause,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendFailure> {
        self.tx.subscribe()
    }

    /// Every reported failure, duplicates included
    pub fn failure_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Forget seen causes so they are reported again
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

/// The active backend: a tagged variant over the two implementations
#[derive(Clone)]
pub enum InferenceBackend {
    Local(Arc<LocalBackend>),
    Remote(Arc<RemoteBackend>),
}

impl InferenceBackend {
    pub fn mode(&self) -> BackendMode {
        match self {
            InferenceBackend::Local(_) => BackendMode::Local,
            InferenceBackend::Remote(_) => BackendMode::Remote,
        }
    }

    pub async fn infer(&self, frame: &MediaFrame) -> Vec<Detection> {
        match self {
            InferenceBackend::Local(backend) => backend.infer(frame).await,
            InferenceBackend::Remote(backend) => backend.infer(frame).await,
        }
    }
}

/// Both backends, constructed once; selection happens per dispatch cycle
#[derive(Clone)]
pub struct Backends {
    local: Arc<LocalBackend>,
    remote: Arc<RemoteBackend>,
}

impl Backends {
    pub fn new(local: LocalBackend, remote: RemoteBackend) -> Self {
        Self {
            local: Arc::new(local),
            remote: Arc::new(remote),
        }
    }

    pub fn select(&self, mode: BackendMode) -> InferenceBackend {
        match mode {
            BackendMode::Local => InferenceBackend::Local(self.local.clone()),
            BackendMode::Remote => InferenceBackend::Remote(self.remote.clone()),
        }
    }

    pub fn local(&self) -> &Arc<LocalBackend> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<RemoteBackend> {
        &self.remote
    }
}
