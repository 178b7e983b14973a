//! peer-vision - WebRTC video link with real-time object detection
//!
//! Two peers exchange session descriptors by copy/paste, one streams video to the other,
//! and frames are run through an object detector, either on-device (ONNX) or through a
//! remote detection service, with end-to-end latency measurement.

pub mod capture;
pub mod config;
pub mod controller;
pub mod encode;
pub mod inference;
pub mod metrics;
pub mod runtime_settings;
pub mod scheduler;
pub mod timer;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::{BackendMode, Config, WebRTCConfig};
pub use controller::Controller;
pub use inference::{Detection, DetectionSet};
pub use scheduler::FrameScheduler;
pub use webrtc::{ConnectionDescriptor, ConnectionNegotiator};
