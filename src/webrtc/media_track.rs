//! Local media for the sending side
//!
//! A [`MediaProvider`] opens the local video (the camera, in the browser build). The
//! provided implementation streams a VP8/VP9 IVF file into a sample track, looping at
//! end of file.

use super::WebRTCError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Local tracks plus whatever task feeds them. Dropping it stops the feed.
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    pump: Option<JoinHandle<()>>,
    stopped: bool,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            tracks,
            pump: None,
            stopped: false,
        }
    }

    /// Attach the task writing samples into the tracks
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn is_live(&self) -> bool {
        !self.stopped && self.pump.as_ref().map_or(true, |p| !p.is_finished())
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            debug!("Local media feed stopped");
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of local video tracks
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn open(&self, stream_id: &str) -> Result<LocalMedia, WebRTCError>;
}

/// Streams an IVF file (VP8 or VP9) at a fixed frame rate
pub struct IvfFileMedia {
    path: PathBuf,
    fps: u32,
}

impl IvfFileMedia {
    pub fn new(path: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            path: path.into(),
            fps: fps.max(1),
        }
    }

    fn open_reader(&self) -> Result<(IVFReader<BufReader<File>>, IVFFileHeader), WebRTCError> {
        let file = File::open(&self.path)
            .map_err(|e| WebRTCError::MediaAccess(format!("{}: {}", self.path.display(), e)))?;
        IVFReader::new(BufReader::new(file))
            .map_err(|e| WebRTCError::MediaAccess(format!("{}: {}", self.path.display(), e)))
    }
}

fn mime_for_fourcc(four_cc: &[u8; 4]) -> Option<&'static str> {
    match four_cc {
        b"VP80" => Some(MIME_TYPE_VP8),
        b"VP90" => Some(MIME_TYPE_VP9),
        _ => None,
    }
}

#[async_trait]
impl MediaProvider for IvfFileMedia {
    async fn open(&self, stream_id: &str) -> Result<LocalMedia, WebRTCError> {
        let (mut reader, header) = self.open_reader()?;
        let mime_type = mime_for_fourcc(&header.four_cc).ok_or_else(|| {
            WebRTCError::MediaAccess(format!(
                "{}: unsupported codec {:?}",
                self.path.display(),
                String::from_utf8_lossy(&header.four_cc)
            ))
        })?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            stream_id.to_string(),
        ));
        info!(
            "Opened {} ({}x{}, {}) at {} fps",
            self.path.display(),
            header.width,
            header.height,
            mime_type,
            self.fps
        );

        let frame_duration = Duration::from_millis(1000 / self.fps as u64);
        let writer = track.clone();
        let source = IvfFileMedia::new(self.path.clone(), self.fps);
        let pump = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_duration);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let data = match reader.parse_next_frame() {
                    Ok((frame, _)) => frame.freeze(),
                    Err(_) => {
                        debug!("End of {}, looping", source.path.display());
                        match source.open_reader() {
                            Ok((next, _)) => reader = next,
                            Err(e) => {
                                warn!("Local media feed ended: {}", e);
                                return;
                            }
                        }
                        continue;
                    }
                };
                let sample = Sample {
                    data,
                    duration: frame_duration,
                    ..Default::default()
                };
                if let Err(e) = writer.write_sample(&sample).await {
                    debug!("Dropped local sample: {}", e);
                }
            }
        });

        Ok(LocalMedia::new(vec![track]).with_pump(pump))
    }
}
