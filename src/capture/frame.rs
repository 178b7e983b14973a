//! Captured frame handle
//!
//! A [`MediaFrame`] is exclusively owned; consuming it (dropping it) runs its
//! release hook exactly once.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Called with the frame id when the frame is released
pub type ReleaseHook = Box<dyn FnOnce(u64) + Send + Sync>;

/// One captured picture
pub struct MediaFrame {
    /// Frame sequence number
    pub id: u64,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Packed RGB8 pixels, `width * height * 3` bytes
    pub data: Bytes,

    /// Capture timestamp (ms, crate clock)
    pub captured_at_ms: u64,

    release: Option<ReleaseHook>,
}

impl MediaFrame {
    pub fn new(id: u64, width: u32, height: u32, data: Bytes, captured_at_ms: u64) -> Self {
        Self {
            id,
            width,
            height,
            data,
            captured_at_ms,
            release: None,
        }
    }

    /// Attach a hook run when the frame is released
    pub fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    /// Expected RGB8 buffer length for the frame dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Release the frame now. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for MediaFrame {
    fn drop(&mut self) {
        if let Some(hook) = self.release.take() {
            hook(self.id);
        }
    }
}

impl fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaFrame")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .field("captured_at_ms", &self.captured_at_ms)
            .finish()
    }
}

impl fmt::Display for MediaFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({}x{}, {} bytes, id={})",
            self.width,
            self.height,
            self.data.len(),
            self.id
        )
    }
}

/// Capture/release counters shared between a source and the frames it produced
#[derive(Debug, Default)]
pub struct FrameStats {
    captured: AtomicU64,
    released: AtomicU64,
    total_bytes: AtomicU64,
}

impl FrameStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a capture and return a hook that records the matching release
    pub fn record_capture(self: &Arc<Self>, bytes: usize) -> ReleaseHook {
        self.captured.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        let stats = self.clone();
        Box::new(move |_id| {
            stats.released.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Frames captured but not yet released
    pub fn outstanding(&self) -> u64 {
        self.captured().saturating_sub(self.released())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}
