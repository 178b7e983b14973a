//! Frame capture
//!
//! Frame handles and the sources the capture loop samples from.

pub mod frame;
pub mod source;

pub use frame::{FrameStats, MediaFrame};
pub use source::{FeedHandle, FrameFeed, ImageSequenceSource, VideoSource};

use std::path::PathBuf;

/// Capture errors
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no images to sample")]
    Empty,
    #[error("failed to read {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to decode image {0}")]
    Decode(String),
    #[error("buffer of {len} bytes does not match {width}x{height} RGB")]
    Dimensions { width: u32, height: u32, len: usize },
}
