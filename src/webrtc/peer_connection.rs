//! WebRTC PeerConnection construction
//!
//! Handles the creation of RTCPeerConnection instances and the small helpers the
//! negotiator needs around them.

use super::WebRTCError;
use crate::config::{IceServerConfig, WebRTCConfig};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// PeerConnection factory for links
pub struct PeerConnectionManager {
    config: WebRTCConfig,
}

impl PeerConnectionManager {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebRTCConfig {
        &self.config
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        // Create media engine with the default codec set
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_ice_servers(&self.config.ice_servers),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    /// Register receive intent for video without any local track
    pub async fn add_recv_only_video(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRTCError> {
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| WebRTCError::Media(format!("Failed to add recv-only transceiver: {}", e)))?;
        Ok(())
    }

    /// Close a peer connection
    pub async fn close(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRTCError> {
        peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

fn build_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .filter(|server| !server.urls.is_empty())
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_from_config() {
        let servers = vec![
            IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            },
            IceServerConfig {
                urls: vec![],
                username: None,
                credential: None,
            },
            IceServerConfig {
                urls: vec!["turn:turn.example.net:3478?transport=udp".into()],
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ];
        let ice = build_ice_servers(&servers);
        assert_eq!(ice.len(), 2);
        assert_eq!(ice[0].username, "");
        assert_eq!(ice[1].username, "user");
        assert_eq!(ice[1].credential, "secret");
    }

    #[test]
    fn test_default_config_uses_public_stun() {
        let ice = build_ice_servers(&WebRTCConfig::default().ice_servers);
        assert_eq!(ice.len(), 2);
        assert!(ice.iter().all(|s| s.urls[0].starts_with("stun:")));
    }

    #[tokio::test]
    async fn test_peer_connection_creation() {
        let manager = PeerConnectionManager::new(WebRTCConfig {
            ice_servers: vec![],
            ..Default::default()
        });
        let pc = manager.create_peer_connection().await.unwrap();
        PeerConnectionManager::add_recv_only_video(&pc).await.unwrap();
        assert_eq!(pc.get_transceivers().await.len(), 1);
        PeerConnectionManager::close(&pc).await.unwrap();
    }
}
