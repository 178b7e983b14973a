//! Remote video into the detector
//!
//! [`RemoteVideoBridge`] follows the negotiator's remote stream. For every new remote
//! video track it reads RTP, reassembles whole frames with the codec's depacketizer,
//! decodes them on a blocking worker and publishes each picture on a [`FeedHandle`],
//! which the frame scheduler samples like any other source.
//!
//! Decoding goes through the [`VideoDecoder`] seam. With the `gstreamer-decode` feature a
//! GStreamer `appsrc ! <codec>dec ! videoconvert ! appsink` pipeline is used; without it
//! the bridge still follows the link but reports that no decoder is available.

use super::link::RemoteStream;
use super::WebRTCError;
use crate::capture::FeedHandle;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packet::Packet;

/// Packets a frame may wait for before the builder gives up on it
const MAX_LATE_PACKETS: u16 = 128;
const VIDEO_CLOCK_RATE: u32 = 90_000;
/// Encoded frames buffered between the RTP reader and the decoder
const DECODE_QUEUE: usize = 16;

/// Packed RGB8 picture
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Turns one encoded frame into a picture
pub trait VideoDecoder: Send {
    /// `Ok(None)` while the decoder has no picture to show yet (e.g. waiting for a keyframe)
    fn decode(&mut self, frame: &[u8]) -> Result<Option<DecodedPicture>, WebRTCError>;
}

/// Builds a decoder for a negotiated codec
pub trait DecoderFactory: Send + Sync {
    fn create(&self, mime_type: &str) -> Result<Box<dyn VideoDecoder>, WebRTCError>;
}

/// Decoders available in this build
pub fn default_decoders() -> Arc<dyn DecoderFactory> {
    #[cfg(feature = "gstreamer-decode")]
    {
        Arc::new(gst_decode::GstDecoderFactory)
    }
    #[cfg(not(feature = "gstreamer-decode"))]
    {
        Arc::new(NoDecoders)
    }
}

#[cfg(not(feature = "gstreamer-decode"))]
struct NoDecoders;

#[cfg(not(feature = "gstreamer-decode"))]
impl DecoderFactory for NoDecoders {
    fn create(&self, mime_type: &str) -> Result<Box<dyn VideoDecoder>, WebRTCError> {
        Err(WebRTCError::Media(format!(
            "no decoder for {} (built without the gstreamer-decode feature)",
            mime_type
        )))
    }
}

/// Reassembles RTP packets into encoded frames
pub enum FrameAssembler {
    Vp8(SampleBuilder<Vp8Packet>),
    Vp9(SampleBuilder<Vp9Packet>),
}

impl FrameAssembler {
    pub fn for_mime(mime_type: &str) -> Result<Self, WebRTCError> {
        if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
            Ok(Self::Vp8(SampleBuilder::new(
                MAX_LATE_PACKETS,
                Vp8Packet::default(),
                VIDEO_CLOCK_RATE,
            )))
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
            Ok(Self::Vp9(SampleBuilder::new(
                MAX_LATE_PACKETS,
                Vp9Packet::default(),
                VIDEO_CLOCK_RATE,
            )))
        } else {
            Err(WebRTCError::Media(format!("unsupported remote codec {}", mime_type)))
        }
    }

    /// Feed one packet; returns every frame it completed
    pub fn push(&mut self, packet: Packet) -> Vec<Bytes> {
        let mut frames = Vec::new();
        match self {
            Self::Vp8(builder) => {
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    frames.push(sample.data);
                }
            }
            Self::Vp9(builder) => {
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    frames.push(sample.data);
                }
            }
        }
        frames
    }
}

/// Decoder plus the feed it publishes to
pub struct DecodeStage {
    decoder: Box<dyn VideoDecoder>,
    feed: FeedHandle,
    decoded: u64,
    failures: u64,
}

impl DecodeStage {
    pub fn new(decoder: Box<dyn VideoDecoder>, feed: FeedHandle) -> Self {
        Self {
            decoder,
            feed,
            decoded: 0,
            failures: 0,
        }
    }

    pub fn decode(&mut self, frame: &[u8]) {
        match self.decoder.decode(frame) {
            Ok(Some(picture)) => match self.feed.push(picture.width, picture.height, picture.data) {
                Ok(()) => self.decoded += 1,
                Err(e) => warn!("Decoded picture rejected: {}", e),
            },
            Ok(None) => {}
            Err(e) => {
                self.failures += 1;
                if self.failures == 1 {
                    warn!("Remote video decode failed: {}", e);
                } else {
                    debug!("Remote video decode failed ({} so far): {}", self.failures, e);
                }
            }
        }
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// Track reader task, aborted when replaced or when the bridge goes away
struct Reader(JoinHandle<()>);

impl Drop for Reader {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Follows the remote stream and keeps a [`FeedHandle`] filled with decoded pictures
pub struct RemoteVideoBridge {
    task: Option<JoinHandle<()>>,
}

impl RemoteVideoBridge {
    pub fn spawn(
        mut streams: watch::Receiver<Option<RemoteStream>>,
        decoders: Arc<dyn DecoderFactory>,
        feed: FeedHandle,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut reader: Option<Reader> = None;
            loop {
                let stream = streams.borrow_and_update().clone();
                if reader.take().is_some() {
                    feed.clear();
                }
                if let Some(stream) = stream {
                    reader = Some(Reader(tokio::spawn(pump(stream, decoders.clone(), feed.clone()))));
                }
                if streams.changed().await.is_err() {
                    break;
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Remote video bridge stopped");
        }
    }
}

impl Drop for RemoteVideoBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one remote track until it ends
async fn pump(stream: RemoteStream, decoders: Arc<dyn DecoderFactory>, feed: FeedHandle) {
    let mime_type = stream.track.codec().capability.mime_type.clone();
    let mut assembler = match FrameAssembler::for_mime(&mime_type) {
        Ok(assembler) => assembler,
        Err(e) => {
            error!("Link {}: {}", stream.link_id, e);
            return;
        }
    };
    let decoder = match decoders.create(&mime_type) {
        Ok(decoder) => decoder,
        Err(e) => {
            error!("Link {}: {}", stream.link_id, e);
            return;
        }
    };
    info!(
        "Link {}: decoding remote {} from stream {}",
        stream.link_id, mime_type, stream.stream_id
    );

    let (tx, mut rx) = mpsc::channel::<Bytes>(DECODE_QUEUE);
    let worker_feed = feed.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let mut stage = DecodeStage::new(decoder, worker_feed);
        while let Some(frame) = rx.blocking_recv() {
            stage.decode(&frame);
        }
        debug!(
            "Decoder finished: {} pictures, {} failures",
            stage.decoded(),
            stage.failures()
        );
    });

    loop {
        match stream.track.read_rtp().await {
            Ok((packet, _)) => {
                for frame in assembler.push(packet) {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                info!("Link {}: remote track ended: {}", stream.link_id, e);
                break;
            }
        }
    }
    drop(tx);
    let _ = worker.await;
    feed.clear();
}

#[cfg(feature = "gstreamer-decode")]
mod gst_decode {
    use super::{DecodedPicture, DecoderFactory, VideoDecoder};
    use crate::webrtc::WebRTCError;
    use bytes::Bytes;
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};

    /// How long one decode call waits for a picture
    const PULL_TIMEOUT_MS: u64 = 20;

    pub struct GstDecoderFactory;

    impl DecoderFactory for GstDecoderFactory {
        fn create(&self, mime_type: &str) -> Result<Box<dyn VideoDecoder>, WebRTCError> {
            Ok(Box::new(GstVideoDecoder::new(mime_type)?))
        }
    }

    /// appsrc -> decoder -> videoconvert -> appsink (RGB)
    pub struct GstVideoDecoder {
        pipeline: gst::Pipeline,
        appsrc: gst_app::AppSrc,
        appsink: gst_app::AppSink,
    }

    impl GstVideoDecoder {
        pub fn new(mime_type: &str) -> Result<Self, WebRTCError> {
            gst::init().map_err(|e| WebRTCError::Media(format!("GStreamer init failed: {}", e)))?;

            let (caps, element) = if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP8) {
                ("video/x-vp8", "vp8dec")
            } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_VP9) {
                ("video/x-vp9", "vp9dec")
            } else {
                return Err(WebRTCError::Media(format!("no decoder for {}", mime_type)));
            };

            let pipeline = gst::Pipeline::new();
            let caps = caps
                .parse::<gst::Caps>()
                .map_err(|e| WebRTCError::Media(format!("Invalid caps: {}", e)))?;
            let appsrc = gst_app::AppSrc::builder()
                .name("encoded")
                .caps(&caps)
                .format(gst::Format::Time)
                .is_live(true)
                .do_timestamp(true)
                .build();
            let decoder = gst::ElementFactory::make(element)
                .build()
                .map_err(|e| WebRTCError::Media(format!("Failed to create {}: {}", element, e)))?;
            let convert = gst::ElementFactory::make("videoconvert")
                .build()
                .map_err(|e| WebRTCError::Media(format!("Failed to create videoconvert: {}", e)))?;
            let rgb = gst_video::VideoCapsBuilder::new()
                .format(gst_video::VideoFormat::Rgb)
                .build();
            let appsink = gst_app::AppSink::builder()
                .name("pictures")
                .caps(&rgb)
                .sync(false)
                .max_buffers(1)
                .drop(true)
                .build();

            pipeline
                .add_many([appsrc.upcast_ref(), &decoder, &convert, appsink.upcast_ref()])
                .map_err(|e| WebRTCError::Media(format!("Failed to add elements: {}", e)))?;
            gst::Element::link_many([appsrc.upcast_ref(), &decoder, &convert, appsink.upcast_ref()])
                .map_err(|e| WebRTCError::Media(format!("Failed to link decoder: {}", e)))?;
            pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| WebRTCError::Media(format!("Failed to start decoder: {}", e)))?;

            Ok(Self {
                pipeline,
                appsrc,
                appsink,
            })
        }
    }

    impl VideoDecoder for GstVideoDecoder {
        fn decode(&mut self, frame: &[u8]) -> Result<Option<DecodedPicture>, WebRTCError> {
            self.appsrc
                .push_buffer(gst::Buffer::from_slice(frame.to_vec()))
                .map_err(|e| WebRTCError::Media(format!("appsrc push failed: {:?}", e)))?;

            let Some(sample) = self
                .appsink
                .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            else {
                return Ok(None);
            };
            let caps = sample
                .caps()
                .ok_or_else(|| WebRTCError::Media("decoded sample without caps".to_string()))?;
            let info = gst_video::VideoInfo::from_caps(caps)
                .map_err(|e| WebRTCError::Media(format!("Invalid decoded caps: {}", e)))?;
            let buffer = sample
                .buffer()
                .ok_or_else(|| WebRTCError::Media("decoded sample without buffer".to_string()))?;
            let map = buffer
                .map_readable()
                .map_err(|e| WebRTCError::Media(format!("Buffer map failed: {}", e)))?;

            // Rows may be padded; repack to tight RGB8
            let (width, height) = (info.width(), info.height());
            let row = width as usize * 3;
            let stride = info.stride()[0] as usize;
            let mut data = Vec::with_capacity(row * height as usize);
            for y in 0..height as usize {
                let start = y * stride;
                let line = map
                    .get(start..start + row)
                    .ok_or_else(|| WebRTCError::Media("short decoded buffer".to_string()))?;
                data.extend_from_slice(line);
            }
            Ok(Some(DecodedPicture {
                width,
                height,
                data: Bytes::from(data),
            }))
        }
    }

    impl Drop for GstVideoDecoder {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}
