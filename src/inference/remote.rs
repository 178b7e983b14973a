//! Remote inference over HTTP
//!
//! Frames are shipped as JPEG data URIs; the service answers with detections in
//! normalized coordinates.

use super::{Detection, Diagnostics, InferenceError};
use crate::capture::MediaFrame;
use crate::config::{BackendMode, InferenceConfig};
use crate::encode::{Encoder, EncoderConfig};
use crate::metrics::Clock;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Request body sent to the detection service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRequest {
    pub frame_data_uri: String,
    pub frame_id: u64,
    pub capture_ts: u64,
    pub recv_ts: u64,
}

/// One detection as the service reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDetection {
    pub label: String,
    pub score: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectResponse {
    pub frame_id: u64,
    pub capture_ts: u64,
    pub recv_ts: u64,
    pub inference_ts: u64,
    #[serde(default)]
    pub detections: Vec<RemoteDetection>,
}

/// Transport to a detection service
#[async_trait]
pub trait DetectionService: Send + Sync {
    async fn detect(&self, request: DetectRequest) -> Result<DetectResponse, InferenceError>;
}

/// JSON POST to an HTTP endpoint
pub struct HttpDetectionService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetectionService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DetectionService for HttpDetectionService {
    async fn detect(&self, request: DetectRequest) -> Result<DetectResponse, InferenceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Transport(format!(
                "{} returned {}",
                self.endpoint, status
            )));
        }

        response
            .json::<DetectResponse>()
            .await
            .map_err(|e| InferenceError::Response(e.to_string()))
    }
}

pub struct RemoteBackend {
    service: Arc<dyn DetectionService>,
    encoder: Encoder,
    clock: Clock,
    diagnostics: Arc<Diagnostics>,
}

impl RemoteBackend {
    pub fn new(
        service: Arc<dyn DetectionService>,
        encoder: Encoder,
        clock: Clock,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            service,
            encoder,
            clock,
            diagnostics,
        }
    }

    pub fn from_config(
        config: &InferenceConfig,
        clock: Clock,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self, InferenceError> {
        let service = HttpDetectionService::new(
            config.remote_endpoint.clone(),
            Duration::from_millis(config.remote_timeout_ms),
        )?;
        let encoder = Encoder::new(EncoderConfig {
            quality: config.jpeg_quality,
        });
        Ok(Self::new(Arc::new(service), encoder, clock, diagnostics))
    }

    /// Detections for one frame; empty on any failure
    pub async fn infer(&self, frame: &MediaFrame) -> Vec<Detection> {
        match self.try_infer(frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.diagnostics.report(BackendMode::Remote, &e);
                Vec::new()
            }
        }
    }

    async fn try_infer(&self, frame: &MediaFrame) -> Result<Vec<Detection>, InferenceError> {
        let frame_data_uri = self
            .encoder
            .encode_data_uri(frame)
            .map_err(|e| InferenceError::Encode(e.to_string()))?;

        let request = DetectRequest {
            frame_data_uri,
            frame_id: frame.id,
            capture_ts: frame.captured_at_ms,
            recv_ts: self.clock.now_ms(),
        };
        let response = self.service.detect(request).await?;

        if response.frame_id != frame.id {
            return Err(InferenceError::Response(format!(
                "answer for frame {} while waiting on frame {}",
                response.frame_id, frame.id
            )));
        }

        let total = response.detections.len();
        let detections: Vec<Detection> = response
            .detections
            .into_iter()
            .map(|d| Detection {
                label: d.label,
                score: d.score,
                xmin: d.xmin,
                ymin: d.ymin,
                xmax: d.xmax,
                ymax: d.ymax,
                backend: BackendMode::Remote,
            })
            .filter(|d| d.is_normalized())
            .collect();

        if detections.len() != total {
            self.diagnostics.report(
                BackendMode::Remote,
                &InferenceError::Response(format!(
                    "{} detection(s) outside the unit square",
                    total - detections.len()
                )),
            );
        }
        debug!(
            "Frame {}: {} remote detection(s), service inference at {}",
            frame.id,
            detections.len(),
            response.inference_ts
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct FakeService {
        seen: Mutex<Vec<DetectRequest>>,
        reply: Box<dyn Fn(&DetectRequest) -> Result<DetectResponse, InferenceError> + Send + Sync>,
    }

    #[async_trait]
    impl DetectionService for FakeService {
        async fn detect(&self, request: DetectRequest) -> Result<DetectResponse, InferenceError> {
            let reply = (self.reply)(&request);
            self.seen.lock().push(request);
            reply
        }
    }

    fn backend(
        reply: impl Fn(&DetectRequest) -> Result<DetectResponse, InferenceError> + Send + Sync + 'static,
    ) -> (RemoteBackend, Arc<FakeService>, Arc<Diagnostics>) {
        let service = Arc::new(FakeService {
            seen: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        });
        let diagnostics = Diagnostics::new();
        let backend = RemoteBackend::new(
            service.clone(),
            Encoder::default(),
            Clock::new(),
            diagnostics.clone(),
        );
        (backend, service, diagnostics)
    }

    fn frame(id: u64) -> MediaFrame {
        MediaFrame::new(id, 4, 4, Bytes::from(vec![90u8; 48]), 1_000)
    }

    fn echo(request: &DetectRequest, detections: Vec<RemoteDetection>) -> DetectResponse {
        DetectResponse {
            frame_id: request.frame_id,
            capture_ts: request.capture_ts,
            recv_ts: request.recv_ts,
            inference_ts: request.recv_ts + 5,
            detections,
        }
    }

    fn remote_det(xmax: f32) -> RemoteDetection {
        RemoteDetection {
            label: "cat".into(),
            score: 0.8,
            xmin: 0.1,
            ymin: 0.1,
            xmax,
            ymax: 0.5,
        }
    }

    #[test]
    fn test_request_uses_camel_case_keys() {
        let request = DetectRequest {
            frame_data_uri: "data:image/jpeg;base64,AA".into(),
            frame_id: 3,
            capture_ts: 10,
            recv_ts: 12,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["frameDataUri"], "data:image/jpeg;base64,AA");
        assert_eq!(json["frameId"], 3);
        assert_eq!(json["captureTs"], 10);
        assert_eq!(json["recvTs"], 12);
    }

    #[test]
    fn test_response_without_detections_parses() {
        let body = r#"{"frameId":1,"captureTs":2,"recvTs":3,"inferenceTs":4}"#;
        let response: DetectResponse = serde_json::from_str(body).unwrap();
        assert!(response.detections.is_empty());
        assert_eq!(response.inference_ts, 4);
    }

    #[tokio::test]
    async fn test_detections_are_tagged_remote() {
        let (backend, service, _) = backend(|req| Ok(echo(req, vec![remote_det(0.4)])));
        let detections = backend.infer(&frame(9)).await;

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].backend, BackendMode::Remote);
        assert_eq!(detections[0].label, "cat");

        let seen = service.seen.lock();
        assert_eq!(seen[0].frame_id, 9);
        assert_eq!(seen[0].capture_ts, 1_000);
        assert!(seen[0].frame_data_uri.starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn test_transport_failure_yields_empty_and_is_reported() {
        let (backend, _, diagnostics) =
            backend(|_| Err(InferenceError::Transport("connection refused".into())));
        let mut rx = diagnostics.subscribe();

        assert!(backend.infer(&frame(1)).await.is_empty());
        assert!(backend.infer(&frame(2)).await.is_empty());

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.backend, BackendMode::Remote);
        assert!(failure.cause.contains("connection refused"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mismatched_frame_id_is_rejected() {
        let (backend, _, diagnostics) = backend(|req| {
            let mut response = echo(req, vec![remote_det(0.4)]);
            response.frame_id += 1;
            Ok(response)
        });
        assert!(backend.infer(&frame(5)).await.is_empty());
        assert_eq!(diagnostics.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_boxes_are_withheld() {
        let (backend, _, diagnostics) =
            backend(|req| Ok(echo(req, vec![remote_det(0.4), remote_det(1.3)])));
        let detections = backend.infer(&frame(1)).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(diagnostics.failure_count(), 1);
    }
}
