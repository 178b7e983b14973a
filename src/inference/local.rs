//! In-process inference
//!
//! The model session is created lazily on the first frame and cached. A failed load is
//! cached too: later frames resolve to no detections without retrying until [`LocalBackend::reset`].

use super::decoder::DetectionDecoder;
use super::{Detection, Diagnostics, InferenceError};
use crate::capture::MediaFrame;
use crate::config::{BackendMode, InferenceConfig};
use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{debug, info};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A loaded model: planar `[1, 3, S, S]` input in, flat output tensor out
pub trait ModelSession: Send {
    fn run(&mut self, input: Vec<f32>) -> Result<Vec<f32>, InferenceError>;
}

/// Creates model sessions. Called from a blocking thread.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn ModelSession>, InferenceError>;
}

/// Fails with `AssetUnavailable` if the model file is absent
pub fn check_model_asset(path: &Path) -> Result<(), InferenceError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(InferenceError::AssetUnavailable(format!(
            "{} not found",
            path.display()
        )))
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::{check_model_asset, InferenceError, ModelLoader, ModelSession};
    use ort::session::Session;
    use ort::value::Tensor;
    use std::path::PathBuf;

    fn session_err(e: impl std::fmt::Display) -> InferenceError {
        InferenceError::Session(e.to_string())
    }

    /// Loads a YOLO ONNX export with ONNX Runtime
    pub struct OnnxModelLoader {
        pub(super) path: PathBuf,
        pub(super) input_size: u32,
    }

    impl ModelLoader for OnnxModelLoader {
        fn load(&self) -> Result<Box<dyn ModelSession>, InferenceError> {
            check_model_asset(&self.path)?;
            let session = Session::builder()
                .map_err(session_err)?
                .commit_from_file(&self.path)
                .map_err(|e| {
                    InferenceError::AssetUnavailable(format!("{}: {}", self.path.display(), e))
                })?;
            Ok(Box::new(OnnxSession {
                session,
                input_size: self.input_size as usize,
            }))
        }
    }

    struct OnnxSession {
        session: Session,
        input_size: usize,
    }

    impl ModelSession for OnnxSession {
        fn run(&mut self, input: Vec<f32>) -> Result<Vec<f32>, InferenceError> {
            let shape = [1usize, 3, self.input_size, self.input_size];
            let tensor = Tensor::from_array((shape, input.into_boxed_slice())).map_err(session_err)?;
            let outputs = self
                .session
                .run(ort::inputs!["images" => tensor])
                .map_err(session_err)?;
            let output = outputs
                .get("output0")
                .ok_or_else(|| InferenceError::OutputShape("missing output0".to_string()))?;
            let (_shape, data) = output.try_extract_tensor::<f32>().map_err(session_err)?;
            Ok(data.to_vec())
        }
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxModelLoader;

/// Loader used when the crate is built without ONNX Runtime
#[cfg(not(feature = "onnx"))]
struct UnavailableLoader {
    path: std::path::PathBuf,
}

#[cfg(not(feature = "onnx"))]
impl ModelLoader for UnavailableLoader {
    fn load(&self) -> Result<Box<dyn ModelSession>, InferenceError> {
        check_model_asset(&self.path)?;
        Err(InferenceError::AssetUnavailable(
            "built without the onnx feature".to_string(),
        ))
    }
}

/// Resize to `size`x`size` and lay out as planar RGB scaled to [0, 1]
pub fn preprocess(width: u32, height: u32, data: &[u8], size: u32) -> Result<Vec<f32>, InferenceError> {
    let img = RgbImage::from_raw(width, height, data.to_vec()).ok_or_else(|| {
        InferenceError::Preprocess(format!(
            "{} bytes is not a {}x{} RGB buffer",
            data.len(),
            width,
            height
        ))
    })?;
    let resized = if (width, height) == (size, size) {
        img
    } else {
        imageops::resize(&img, size, size, FilterType::Triangle)
    };

    let plane = (size * size) as usize;
    let raw = resized.as_raw();
    let mut tensor = vec![0f32; 3 * plane];
    for idx in 0..plane {
        tensor[idx] = raw[idx * 3] as f32 / 255.0;
        tensor[plane + idx] = raw[idx * 3 + 1] as f32 / 255.0;
        tensor[2 * plane + idx] = raw[idx * 3 + 2] as f32 / 255.0;
    }
    Ok(tensor)
}

type SharedSession = Arc<Mutex<Box<dyn ModelSession>>>;

enum SessionSlot {
    Unloaded,
    Ready(SharedSession),
    Failed(InferenceError),
}

pub struct LocalBackend {
    loader: Arc<dyn ModelLoader>,
    decoder: DetectionDecoder,
    diagnostics: Arc<Diagnostics>,
    slot: tokio::sync::Mutex<SessionSlot>,
    load_attempts: AtomicU32,
}

impl LocalBackend {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        decoder: DetectionDecoder,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            loader,
            decoder,
            diagnostics,
            slot: tokio::sync::Mutex::new(SessionSlot::Unloaded),
            load_attempts: AtomicU32::new(0),
        }
    }

    /// Backend for the configured model path, ONNX Runtime when compiled in
    pub fn from_config(config: &InferenceConfig, diagnostics: Arc<Diagnostics>) -> Self {
        let decoder = DetectionDecoder::new(super::DecoderConfig::from_config(config));
        #[cfg(feature = "onnx")]
        let loader: Arc<dyn ModelLoader> = Arc::new(OnnxModelLoader {
            path: config.model_path.clone(),
            input_size: config.input_size,
        });
        #[cfg(not(feature = "onnx"))]
        let loader: Arc<dyn ModelLoader> = Arc::new(UnavailableLoader {
            path: config.model_path.clone(),
        });
        Self::new(loader, decoder, diagnostics)
    }

    /// Detections for one frame; empty on any failure
    pub async fn infer(&self, frame: &MediaFrame) -> Vec<Detection> {
        match self.try_infer(frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.diagnostics.report(BackendMode::Local, &e);
                Vec::new()
            }
        }
    }

    async fn try_infer(&self, frame: &MediaFrame) -> Result<Vec<Detection>, InferenceError> {
        let session = self.session().await?;
        let decoder = self.decoder.clone();
        let (width, height, data): (u32, u32, Bytes) = (frame.width, frame.height, frame.data.clone());
        let frame_id = frame.id;

        let outcome = tokio::task::spawn_blocking(move || {
            let input = preprocess(width, height, &data, decoder.config().input_size)?;
            let output = session.lock().run(input)?;
            decoder.decode(&output)
        })
        .await
        .map_err(|e| InferenceError::Session(format!("inference task failed: {}", e)))??;

        debug!(
            "Frame {}: {} candidate(s), {} detection(s)",
            frame_id,
            outcome.candidates,
            outcome.detections.len()
        );
        Ok(outcome.detections)
    }

    async fn session(&self) -> Result<SharedSession, InferenceError> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            SessionSlot::Ready(session) => return Ok(session.clone()),
            SessionSlot::Failed(e) => return Err(e.clone()),
            SessionSlot::Unloaded => {}
        }

        self.load_attempts.fetch_add(1, Ordering::Relaxed);
        let loader = self.loader.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| InferenceError::Session(format!("model load task failed: {}", e)))
            .and_then(|r| r);

        match loaded {
            Ok(session) => {
                info!("Local model session ready");
                let session = Arc::new(Mutex::new(session));
                *slot = SessionSlot::Ready(session.clone());
                Ok(session)
            }
            Err(e) => {
                *slot = SessionSlot::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Drop the cached session (or cached failure); the next frame loads again
    pub async fn reset(&self) {
        *self.slot.lock().await = SessionSlot::Unloaded;
    }

    pub fn load_attempts(&self) -> u32 {
        self.load_attempts.load(Ordering::Relaxed)
    }
}
