//! JPEG encoding for remote inference payloads

use crate::capture::MediaFrame;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// JPEG Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// JPEG quality (1-100)
    pub quality: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { quality: 80 }
    }
}

/// Encodes frames as JPEG data URIs
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        let quality = config.quality.clamp(1, 100);
        Self {
            config: EncoderConfig { quality },
        }
    }

    pub fn quality(&self) -> u8 {
        self.config.quality
    }

    /// Encode a frame to raw JPEG bytes
    pub fn encode_jpeg(&self, frame: &MediaFrame) -> Result<Vec<u8>, EncodeError> {
        let expected = frame.expected_len();
        if frame.data.len() != expected {
            return Err(EncodeError::BufferSize {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.data.len(),
            });
        }

        let mut out = Vec::with_capacity(expected / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.config.quality);
        encoder.encode(&frame.data, frame.width, frame.height, ColorType::Rgb8)?;
        Ok(out)
    }

    /// Encode a frame to a `data:image/jpeg;base64,...` URI
    pub fn encode_data_uri(&self, frame: &MediaFrame) -> Result<String, EncodeError> {
        let jpeg = self.encode_jpeg(frame)?;
        let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
        uri.push_str(DATA_URI_PREFIX);
        STANDARD.encode_string(&jpeg, &mut uri);
        Ok(uri)
    }
}

/// Strip the data URI prefix and decode the JPEG bytes
pub fn decode_data_uri(uri: &str) -> Option<Vec<u8>> {
    let payload = uri.strip_prefix(DATA_URI_PREFIX)?;
    STANDARD.decode(payload).ok()
}
