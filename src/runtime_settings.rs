//! Runtime-adjustable settings, changed by client messages or the status API.

use crate::config::{BackendMode, Config};
use log::{debug, info};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};

const MODE_LOCAL: u8 = 0;
const MODE_REMOTE: u8 = 1;

fn encode_mode(mode: BackendMode) -> u8 {
    match mode {
        BackendMode::Local => MODE_LOCAL,
        BackendMode::Remote => MODE_REMOTE,
    }
}

fn decode_mode(value: u8) -> BackendMode {
    match value {
        MODE_REMOTE => BackendMode::Remote,
        _ => BackendMode::Local,
    }
}

pub struct RuntimeSettings {
    mode: AtomicU8,
}

impl RuntimeSettings {
    pub fn new(config: &Config) -> Self {
        Self::with_mode(config.inference.mode)
    }

    pub fn with_mode(mode: BackendMode) -> Self {
        Self {
            mode: AtomicU8::new(encode_mode(mode)),
        }
    }

    /// Backend used by the next dispatch cycle
    pub fn mode(&self) -> BackendMode {
        decode_mode(self.mode.load(Ordering::Acquire))
    }

    /// Switch backends; returns the previous mode
    pub fn set_mode(&self, mode: BackendMode) -> BackendMode {
        let previous = decode_mode(self.mode.swap(encode_mode(mode), Ordering::AcqRel));
        if previous != mode {
            info!("Inference backend: {} -> {}", previous, mode);
        }
        previous
    }

    /// Plain-text command form: `mode,local` / `mode,remote`
    pub fn handle_simple_message(&self, message: &str) -> bool {
        let Some(payload) = message.strip_prefix("mode,") else {
            return false;
        };
        if let Some(mode) = BackendMode::parse(payload.trim()) {
            self.set_mode(mode);
        }
        true
    }

    /// Apply a JSON settings message such as `{"mode": "remote"}`. Unknown keys are ignored.
    pub fn apply_settings_json(&self, json_str: &str) -> bool {
        let value: Value = match serde_json::from_str(json_str) {
            Ok(value) => value,
            Err(err) => {
                debug!("SETTINGS parse failed: {}", err);
                return false;
            }
        };

        match value.get("mode").and_then(|v| v.as_str()).and_then(BackendMode::parse) {
            Some(mode) => {
                self.set_mode(mode);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_from_config() {
        let mut config = Config::default();
        config.inference.mode = BackendMode::Remote;
        assert_eq!(RuntimeSettings::new(&config).mode(), BackendMode::Remote);
    }

    #[test]
    fn test_json_switches_mode() {
        let settings = RuntimeSettings::with_mode(BackendMode::Local);
        assert!(settings.apply_settings_json(r#"{"mode":"remote","other":1}"#));
        assert_eq!(settings.mode(), BackendMode::Remote);

        assert!(!settings.apply_settings_json(r#"{"mode":"gpu"}"#));
        assert!(!settings.apply_settings_json("not json"));
        assert_eq!(settings.mode(), BackendMode::Remote);
    }

    #[test]
    fn test_simple_message_switches_mode() {
        let settings = RuntimeSettings::with_mode(BackendMode::Remote);
        assert!(settings.handle_simple_message("mode,wasm"));
        assert_eq!(settings.mode(), BackendMode::Local);
        assert!(!settings.handle_simple_message("keyframe"));
    }

    #[test]
    fn test_set_mode_returns_previous() {
        let settings = RuntimeSettings::with_mode(BackendMode::Local);
        assert_eq!(settings.set_mode(BackendMode::Remote), BackendMode::Local);
        assert_eq!(settings.set_mode(BackendMode::Remote), BackendMode::Remote);
    }
}
