//! WebRTC link with manual signaling
//!
//! This module provides:
//! - Peer connection construction (codecs, interceptors, ICE servers)
//! - Descriptor codec for copy/paste signaling
//! - The per-role link and its negotiation state machine
//! - Local media tracks fed from a file
//! - Remote video decoded into a frame feed

pub mod link;
pub mod media_track;
pub mod negotiator;
pub mod peer_connection;
pub mod receive;
pub mod signaling;

pub use link::{LinkEvent, LinkState, RemoteStream};
pub use media_track::{IvfFileMedia, LocalMedia, MediaProvider};
pub use negotiator::{AnswerOutcome, ConnectionNegotiator, Role};
pub use peer_connection::PeerConnectionManager;
pub use receive::{default_decoders, DecodedPicture, DecoderFactory, RemoteVideoBridge, VideoDecoder};
pub use signaling::{ConnectionDescriptor, DescriptorKind};

/// WebRTC-related errors
#[derive(Debug, thiserror::Error)]
pub enum WebRTCError {
    /// Descriptor rejected: malformed, wrong type or refused by the transport
    #[error("Signaling error: {0}")]
    Signaling(String),
    /// Operation not allowed in the current link state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Peer connection creation failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Media track error
    #[error("Media error: {0}")]
    Media(String),
    /// Local media could not be opened
    #[error("Media access error: {0}")]
    MediaAccess(String),
    /// SDP generation failed
    #[error("SDP error: {0}")]
    Sdp(String),
}
