//! Video sources sampled by the capture loop

use super::frame::{FrameStats, MediaFrame};
use super::CaptureError;
use bytes::Bytes;
use image::RgbImage;
use log::{debug, info};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A live picture source the scheduler can sample
pub trait VideoSource: Send {
    /// Whether the source currently has video to sample
    fn is_active(&self) -> bool;

    /// Grab the current picture. `Ok(None)` when nothing is available yet.
    fn capture(&mut self, now_ms: u64) -> Result<Option<MediaFrame>, CaptureError>;

    /// Capture/release counters
    fn stats(&self) -> Arc<FrameStats>;
}

/// Cycles through a fixed set of decoded images
pub struct ImageSequenceSource {
    images: Vec<(u32, u32, Bytes)>,
    cursor: usize,
    next_id: u64,
    stats: Arc<FrameStats>,
}

impl ImageSequenceSource {
    pub fn from_images(images: Vec<RgbImage>) -> Result<Self, CaptureError> {
        if images.is_empty() {
            return Err(CaptureError::Empty);
        }
        let images = images
            .into_iter()
            .map(|img| {
                let (w, h) = img.dimensions();
                (w, h, Bytes::from(img.into_raw()))
            })
            .collect();
        Ok(Self {
            images,
            cursor: 0,
            next_id: 0,
            stats: FrameStats::new(),
        })
    }

    pub fn from_paths(paths: &[PathBuf]) -> Result<Self, CaptureError> {
        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let img = image::open(path)
                .map_err(|e| CaptureError::Decode(format!("{}: {}", path.display(), e)))?;
            images.push(img.to_rgb8());
        }
        info!("Loaded {} image(s) for frame sequence", images.len());
        Self::from_images(images)
    }

    /// Load every PNG/JPEG in `dir`, in file-name order
    pub fn from_dir(dir: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir).map_err(|e| CaptureError::Io(dir.to_path_buf(), e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Self::from_paths(&paths)
    }
}

impl VideoSource for ImageSequenceSource {
    fn is_active(&self) -> bool {
        true
    }

    fn capture(&mut self, now_ms: u64) -> Result<Option<MediaFrame>, CaptureError> {
        let (w, h, data) = self.images[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.images.len();
        self.next_id += 1;
        let hook = self.stats.record_capture(data.len());
        Ok(Some(MediaFrame::new(self.next_id, w, h, data, now_ms).with_release(hook)))
    }

    fn stats(&self) -> Arc<FrameStats> {
        self.stats.clone()
    }
}

#[derive(Default)]
struct FeedState {
    picture: Option<(u32, u32, Bytes)>,
}

/// Push side of a [`FrameFeed`]; held by whatever decodes the incoming video
#[derive(Clone)]
pub struct FeedHandle {
    state: Arc<Mutex<FeedState>>,
    closed: Arc<AtomicBool>,
}

impl FeedHandle {
    /// Publish the current picture (packed RGB8)
    pub fn push(&self, width: u32, height: u32, data: Bytes) -> Result<(), CaptureError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(CaptureError::Dimensions {
                width,
                height,
                len: data.len(),
            });
        }
        self.state.lock().picture = Some((width, height, data));
        Ok(())
    }

    /// Drop the current picture; the feed is inactive until the next push
    pub fn clear(&self) {
        self.state.lock().picture = None;
    }

    /// Mark the video as ended
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.state.lock().picture = None;
        debug!("Frame feed closed");
    }
}

/// Latest-picture source, sampled like a playing video element
pub struct FrameFeed {
    state: Arc<Mutex<FeedState>>,
    closed: Arc<AtomicBool>,
    next_id: u64,
    stats: Arc<FrameStats>,
}

impl FrameFeed {
    pub fn new() -> (Self, FeedHandle) {
        let state = Arc::new(Mutex::new(FeedState::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let handle = FeedHandle {
            state: state.clone(),
            closed: closed.clone(),
        };
        let feed = Self {
            state,
            closed,
            next_id: 0,
            stats: FrameStats::new(),
        };
        (feed, handle)
    }
}

impl VideoSource for FrameFeed {
    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.state.lock().picture.is_some()
    }

    fn capture(&mut self, now_ms: u64) -> Result<Option<MediaFrame>, CaptureError> {
        let picture = self.state.lock().picture.clone();
        let Some((w, h, data)) = picture else {
            return Ok(None);
        };
        self.next_id += 1;
        let hook = self.stats.record_capture(data.len());
        Ok(Some(MediaFrame::new(self.next_id, w, h, data, now_ms).with_release(hook)))
    }

    fn stats(&self) -> Arc<FrameStats> {
        self.stats.clone()
    }
}
