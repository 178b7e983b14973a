//! JPEG encoding using the image crate
//!
//! Frames shipped to the remote detection service travel as base64 JPEG data URIs.

pub mod encoder;
pub use encoder::{decode_data_uri, EncodeError, Encoder, EncoderConfig};
