//! Connection descriptors
//!
//! Descriptors travel between devices by hand (copy/paste or a scanned code), so the
//! parser accepts three spellings of the same thing:
//! - raw SDP text: `v=0\r\n...`
//! - browser JSON: `{"type": "offer", "sdp": "v=0..."}`
//! - a compact token: URL-safe base64 of the JSON form

use super::WebRTCError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorKind::Offer => write!(f, "offer"),
            DescriptorKind::Answer => write!(f, "answer"),
        }
    }
}

/// Offer or answer text. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(rename = "type")]
    kind: DescriptorKind,
    sdp: String,
}

impl ConnectionDescriptor {
    pub fn new(kind: DescriptorKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Parse pasted text, requiring the given kind
    pub fn parse(text: &str, expected: DescriptorKind) -> Result<Self, WebRTCError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WebRTCError::Signaling(format!("empty {}", expected)));
        }

        let descriptor = if text.starts_with('{') {
            Self::from_json(text)?
        } else if text.starts_with("v=") {
            Self::new(expected, normalize_line_endings(text))
        } else {
            Self::from_token(text)?
        };

        if descriptor.kind != expected {
            return Err(WebRTCError::Signaling(format!(
                "expected an {} but got an {}",
                expected, descriptor.kind
            )));
        }
        if !descriptor.sdp.starts_with("v=") {
            return Err(WebRTCError::Signaling(format!(
                "{} does not contain SDP",
                descriptor.kind
            )));
        }
        Ok(descriptor)
    }

    pub fn from_json(json: &str) -> Result<Self, WebRTCError> {
        serde_json::from_str(json)
            .map_err(|e| WebRTCError::Signaling(format!("Invalid descriptor JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, WebRTCError> {
        serde_json::to_string(self)
            .map_err(|e| WebRTCError::Signaling(format!("Failed to serialize descriptor: {}", e)))
    }

    pub fn from_token(token: &str) -> Result<Self, WebRTCError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|e| WebRTCError::Signaling(format!("Invalid descriptor token: {}", e)))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| WebRTCError::Signaling(format!("Invalid descriptor token: {}", e)))?;
        Self::from_json(&json)
    }

    /// Single-line form suitable for a URL parameter or QR code
    pub fn to_token(&self) -> Result<String, WebRTCError> {
        Ok(URL_SAFE_NO_PAD.encode(self.to_json()?))
    }

    /// Transport description; parses the SDP, so malformed text is rejected here
    pub fn to_rtc(&self) -> Result<RTCSessionDescription, WebRTCError> {
        let result = match self.kind {
            DescriptorKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            DescriptorKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        };
        result.map_err(|e| WebRTCError::Signaling(format!("Invalid SDP {}: {}", self.kind, e)))
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sdp)
    }
}

/// Pasted SDP frequently loses its CRs
fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    for line in text.lines() {
        out.push_str(line.trim_end_matches('\r'));
        out.push_str("\r\n");
    }
    out
}
