//! Configuration management for peer-vision

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration loading / validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Inference backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// On-device model execution
    #[default]
    Local,
    /// Remote detection service
    Remote,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Local => "local",
            BackendMode::Remote => "remote",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            // "wasm"/"server" are the names the browser client uses
            "local" | "wasm" => Some(BackendMode::Local),
            "remote" | "server" => Some(BackendMode::Remote),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the capture loop does when a frame is already pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SlotPolicy {
    /// Only capture into an empty slot; the source is not sampled while a frame is pending
    #[default]
    FillEmpty,
    /// Newest frame replaces the pending one; the displaced frame is released
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Frame capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Dispatch scheduling configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Inference backend configuration
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Benchmark configuration
    #[serde(default)]
    pub benchmark: BenchmarkConfig,

    /// Status HTTP API configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// ICE server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// ICE servers used for candidate gathering
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Upper bound on the ICE gathering wait before a descriptor is returned
    #[serde(default = "default_gather_timeout_ms")]
    pub gather_timeout_ms: u64,

    /// Media stream id used for local tracks
    #[serde(default = "default_stream_id")]
    pub stream_id: String,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            gather_timeout_ms: default_gather_timeout_ms(),
            stream_id: default_stream_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Display refresh rate driving the capture loop
    #[serde(default = "default_capture_hz")]
    pub capture_hz: u32,

    /// Pending-slot policy
    #[serde(default)]
    pub slot_policy: SlotPolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_hz: default_capture_hz(),
            slot_policy: SlotPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch cadence
    #[serde(default = "default_dispatch_hz")]
    pub dispatch_hz: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_hz: default_dispatch_hz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Initially active backend
    #[serde(default)]
    pub mode: BackendMode,

    /// Location of the ONNX model file
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    /// Square model input resolution
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// Minimum best-class score for a candidate (exclusive)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// IoU at or above which lower-scoring boxes are suppressed
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Remote detection service endpoint
    #[serde(default = "default_remote_endpoint")]
    pub remote_endpoint: String,

    /// Remote request timeout
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    /// JPEG quality of the remote payload (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Local,
            model_path: default_model_path(),
            input_size: default_input_size(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            remote_endpoint: default_remote_endpoint(),
            remote_timeout_ms: default_remote_timeout_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Benchmark window length
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Serve the status API
    #[serde(default)]
    pub enabled: bool,

    /// HTTP bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webrtc: WebRTCConfig::default(),
            capture: CaptureConfig::default(),
            scheduler: SchedulerConfig::default(),
            inference: InferenceConfig::default(),
            benchmark: BenchmarkConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.webrtc.gather_timeout_ms == 0 {
            return invalid("ICE gather timeout must be non-zero");
        }
        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return invalid("ICE server entry has no urls");
            }
        }

        if self.capture.capture_hz == 0 || self.capture.capture_hz > 240 {
            return invalid("Capture rate must be within 1..=240 Hz");
        }
        if self.scheduler.dispatch_hz == 0 || self.scheduler.dispatch_hz > 240 {
            return invalid("Dispatch rate must be within 1..=240 Hz");
        }

        if self.inference.input_size == 0 {
            return invalid("Model input size must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.inference.confidence_threshold) {
            return invalid("Confidence threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.inference.iou_threshold) {
            return invalid("IoU threshold must be within [0, 1]");
        }
        if self.inference.jpeg_quality == 0 || self.inference.jpeg_quality > 100 {
            return invalid("JPEG quality must be within 1..=100");
        }
        if self.inference.mode == BackendMode::Remote && self.inference.remote_endpoint.is_empty() {
            return invalid("Remote mode requires a remote endpoint");
        }

        if self.benchmark.window_ms == 0 {
            return invalid("Benchmark window must be non-zero");
        }

        Ok(())
    }
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        },
        IceServerConfig {
            urls: vec!["stun:stun1.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        },
    ]
}

fn default_gather_timeout_ms() -> u64 { 12_000 }
fn default_stream_id() -> String { "peer-vision".to_string() }
fn default_capture_hz() -> u32 { 60 }
fn default_dispatch_hz() -> u32 { 30 }
fn default_model_path() -> PathBuf { PathBuf::from("models/yolov8n.onnx") }
fn default_input_size() -> u32 { 640 }
fn default_confidence_threshold() -> f32 { 0.7 }
fn default_iou_threshold() -> f32 { 0.5 }
fn default_remote_endpoint() -> String { "http://127.0.0.1:9002/detect".to_string() }
fn default_remote_timeout_ms() -> u64 { 5_000 }
fn default_jpeg_quality() -> u8 { 80 }
fn default_window_ms() -> u64 { 30_000 }
fn default_http_host() -> String { "127.0.0.1".to_string() }
fn default_http_port() -> u16 { 8088 }
fn default_log_level() -> String { "info".to_string() }
