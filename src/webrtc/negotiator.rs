//! Manual offer/answer negotiation
//!
//! One negotiator per role. The sender offers its local media; the receiver offers
//! receive intent only. Either side may answer instead. Every remote offer is applied to
//! a fresh link; the previous one is released once the transport has accepted it.

use super::link::{LinkEvent, LinkObserver, LinkState, PeerLink, RemoteStream};
use super::media_track::{LocalMedia, MediaProvider};
use super::peer_connection::PeerConnectionManager;
use super::signaling::{ConnectionDescriptor, DescriptorKind};
use super::WebRTCError;
use crate::config::WebRTCConfig;
use crate::timer::bounded_wait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Captures and sends video
    Sender,
    /// Receives video and runs detection
    Receiver,
}

/// Result of applying a remote answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// The link was already connected or had a settled answer; nothing changed
    AlreadyApplied,
}

/// How a local track ended up on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attach {
    Reused,
    Added,
    AlreadyAttached,
}

pub struct ConnectionNegotiator {
    role: Role,
    peers: PeerConnectionManager,
    gather_timeout: Duration,
    stream_id: String,
    provider: Option<Arc<dyn MediaProvider>>,
    link: Mutex<Option<PeerLink>>,
    media: Mutex<Option<LocalMedia>>,
    observer: Arc<LinkObserver>,
}

impl ConnectionNegotiator {
    pub fn new(role: Role, config: WebRTCConfig) -> Self {
        Self {
            role,
            gather_timeout: Duration::from_millis(config.gather_timeout_ms),
            stream_id: config.stream_id.clone(),
            peers: PeerConnectionManager::new(config),
            provider: None,
            link: Mutex::new(None),
            media: Mutex::new(None),
            observer: LinkObserver::new(),
        }
    }

    /// Local media source opened by [`Self::start_local_media`]
    pub fn with_media_provider(mut self, provider: Arc<dyn MediaProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.observer.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.observer.watch_state()
    }

    /// Latest remote video; `None` until a remote track arrives on the current link
    pub fn remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.observer.watch_remote()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.observer.subscribe()
    }

    pub async fn link_id(&self) -> Option<String> {
        self.link.lock().await.as_ref().map(|l| l.id().to_string())
    }

    pub async fn has_local_media(&self) -> bool {
        self.media.lock().await.is_some()
    }

    /// Open local media and attach it to the current link. Failure is reported as a
    /// `MediaAccessError` event and the link carries on without local media.
    pub async fn start_local_media(&self) -> Result<(), WebRTCError> {
        let link = self.link.lock().await;
        let link_id = link.as_ref().map(|l| l.id().to_string());
        let mut media = self.media.lock().await;
        if media.is_none() {
            let opened = match self.provider.as_ref() {
                Some(provider) => provider.open(&self.stream_id).await,
                None => Err(WebRTCError::MediaAccess(
                    "no media provider configured".to_string(),
                )),
            };
            match opened {
                Ok(opened) => {
                    info!("Local media started ({} track(s))", opened.tracks().len());
                    *media = Some(opened);
                }
                Err(e) => {
                    self.emit_media_error(link_id, &e);
                    return Err(e);
                }
            }
        }

        if let (Some(link), Some(media)) = (link.as_ref(), media.as_ref()) {
            attach_tracks(link.peer_connection(), media).await?;
        }
        Ok(())
    }

    /// Stop local media. Tracks already negotiated stay on the link but go silent.
    pub async fn stop_local_media(&self) {
        if let Some(mut media) = self.media.lock().await.take() {
            media.stop();
        }
    }

    /// Generate the local offer, including every candidate gathered within the timeout
    pub async fn create_offer(&self) -> Result<ConnectionDescriptor, WebRTCError> {
        let mut slot = self.link.lock().await;
        if slot.as_ref().is_some_and(|l| l.state().is_terminal()) {
            if let Some(stale) = slot.take() {
                debug!("Link {} ended, offering on a fresh link", stale.id());
                if let Err(e) = stale.release().await {
                    warn!("Releasing ended link: {}", e);
                }
            }
        }
        let link = self.ensure_link(&mut slot).await?;

        match link.state() {
            LinkState::New => {}
            LinkState::HaveLocalOffer => {
                if let Some(existing) = link.local_descriptor() {
                    debug!("Link {}: offer already generated", link.id());
                    return Ok(existing.clone());
                }
            }
            other => {
                return Err(WebRTCError::InvalidState(format!(
                    "cannot create an offer in state {}",
                    other
                )))
            }
        }

        let pc = link.peer_connection().clone();
        match self.role {
            Role::Receiver => {
                if !has_video_transceiver(&pc).await {
                    PeerConnectionManager::add_recv_only_video(&pc).await?;
                }
            }
            Role::Sender => {
                let media = self.media.lock().await;
                let Some(media) = media.as_ref() else {
                    return Err(WebRTCError::InvalidState(
                        "local media must be started before offering".to_string(),
                    ));
                };
                attach_tracks(&pc, media).await?;
            }
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::Sdp(format!("Failed to create offer: {}", e)))?;
        let sdp = self.apply_local_and_gather(link, offer).await?;

        let descriptor = ConnectionDescriptor::new(DescriptorKind::Offer, sdp);
        link.local = Some(descriptor.clone());
        link.transition(LinkState::HaveLocalOffer, |s| s == LinkState::New);
        Ok(descriptor)
    }

    /// Apply an incoming offer on a fresh link, reattaching active local media
    pub async fn set_remote_offer(&self, text: &str) -> Result<(), WebRTCError> {
        let (descriptor, rtc) = match ConnectionDescriptor::parse(text, DescriptorKind::Offer)
            .and_then(|d| d.to_rtc().map(|rtc| (d, rtc)))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                self.report_signaling_error(&e).await;
                return Err(e);
            }
        };

        // The previous link stays current until the transport accepts the offer
        let mut slot = self.link.lock().await;
        let pc = self.peers.create_peer_connection().await?;
        let staged = PeerLink::staged(pc, self.observer.clone());
        if let Err(e) = staged.peer_connection().set_remote_description(rtc).await {
            let err = WebRTCError::Signaling(format!("Failed to apply remote offer: {}", e));
            self.emit_signaling_error(slot.as_ref().map(|l| l.id()), &err);
            staged.discard().await;
            return Err(err);
        }

        if let Some(previous) = slot.take() {
            if let Err(e) = previous.release().await {
                warn!("Releasing previous link: {}", e);
            }
        }
        staged.activate();
        let link = slot.insert(staged);
        link.remote = Some(descriptor);
        link.transition(LinkState::HaveRemoteOffer, |s| s == LinkState::New);

        let media = self.media.lock().await;
        if let Some(media) = media.as_ref() {
            attach_tracks(link.peer_connection(), media).await?;
        }
        Ok(())
    }

    /// Answer the applied remote offer
    pub async fn create_answer(&self) -> Result<ConnectionDescriptor, WebRTCError> {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_mut() else {
            return Err(WebRTCError::InvalidState("no remote offer applied".to_string()));
        };
        if link.state() != LinkState::HaveRemoteOffer {
            return Err(WebRTCError::InvalidState(format!(
                "cannot create an answer in state {}",
                link.state()
            )));
        }

        let pc = link.peer_connection().clone();
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::Sdp(format!("Failed to create answer: {}", e)))?;
        let sdp = self.apply_local_and_gather(link, answer).await?;

        let descriptor = ConnectionDescriptor::new(DescriptorKind::Answer, sdp);
        link.local = Some(descriptor.clone());
        link.transition(LinkState::HaveLocalAnswer, |s| s == LinkState::HaveRemoteOffer);
        Ok(descriptor)
    }

    /// Apply the remote answer to the pending local offer
    pub async fn set_remote_answer(&self, text: &str) -> Result<AnswerOutcome, WebRTCError> {
        let mut slot = self.link.lock().await;
        let Some(link) = slot.as_mut() else {
            return Err(WebRTCError::InvalidState("no local offer pending".to_string()));
        };

        let state = link.state();
        let settled = link.peer_connection().signaling_state() == RTCSignalingState::Stable;
        let answered = matches!(
            link.remote_descriptor().map(|d| d.kind()),
            Some(DescriptorKind::Answer)
        );
        if state == LinkState::Connected || (answered && settled) {
            debug!("Link {}: remote answer already applied", link.id());
            return Ok(AnswerOutcome::AlreadyApplied);
        }
        if state != LinkState::HaveLocalOffer {
            return Err(WebRTCError::InvalidState(format!(
                "no local offer pending (state {})",
                state
            )));
        }

        let (descriptor, rtc) = match ConnectionDescriptor::parse(text, DescriptorKind::Answer)
            .and_then(|d| d.to_rtc().map(|rtc| (d, rtc)))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                self.emit_signaling_error(Some(link.id()), &e);
                return Err(e);
            }
        };

        if let Err(e) = link.peer_connection().set_remote_description(rtc).await {
            let err = WebRTCError::Signaling(format!("Failed to apply remote answer: {}", e));
            self.emit_signaling_error(Some(link.id()), &err);
            return Err(err);
        }
        link.remote = Some(descriptor);
        link.transition(LinkState::Connecting, |s| s == LinkState::HaveLocalOffer);
        Ok(AnswerOutcome::Applied)
    }

    /// Release the link and stop local media
    pub async fn release(&self) {
        if let Some(link) = self.link.lock().await.take() {
            if let Err(e) = link.release().await {
                warn!("Releasing link: {}", e);
            }
        }
        self.stop_local_media().await;
    }

    async fn ensure_link<'a>(&self, slot: &'a mut Option<PeerLink>) -> Result<&'a mut PeerLink, WebRTCError> {
        if slot.is_none() {
            let pc = self.peers.create_peer_connection().await?;
            *slot = Some(PeerLink::open(pc, self.observer.clone()));
        }
        slot.as_mut()
            .ok_or_else(|| WebRTCError::InvalidState("link unavailable".to_string()))
    }

    /// Set the local description, then wait for gathering up to the timeout
    async fn apply_local_and_gather(
        &self,
        link: &PeerLink,
        description: webrtc::peer_connection::sdp::session_description::RTCSessionDescription,
    ) -> Result<String, WebRTCError> {
        let pc = link.peer_connection();
        let mut gathered = pc.gathering_complete_promise().await;
        let fallback_sdp = description.sdp.clone();
        pc.set_local_description(description)
            .await
            .map_err(|e| WebRTCError::Sdp(format!("Failed to set local description: {}", e)))?;

        let outcome = bounded_wait(
            async {
                let _ = gathered.recv().await;
            },
            self.gather_timeout,
            || (),
        )
        .await;
        if outcome.timed_out() {
            warn!(
                "Link {}: ICE gathering incomplete after {} ms, using candidates so far",
                link.id(),
                self.gather_timeout.as_millis()
            );
            self.observer.emit(LinkEvent::GatheringTimedOut {
                link_id: link.id().to_string(),
                waited_ms: self.gather_timeout.as_millis() as u64,
            });
        }

        Ok(pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or(fallback_sdp))
    }

    async fn report_signaling_error(&self, error: &WebRTCError) {
        let link_id = self.link_id().await;
        self.emit_signaling_error(link_id.as_deref(), error);
    }

    fn emit_signaling_error(&self, link_id: Option<&str>, error: &WebRTCError) {
        warn!("{}", error);
        self.observer.emit(LinkEvent::SignalingError {
            link_id: link_id.map(str::to_string),
            message: error.to_string(),
        });
    }

    fn emit_media_error(&self, link_id: Option<String>, error: &WebRTCError) {
        warn!("{}", error);
        self.observer.emit(LinkEvent::MediaAccessError {
            link_id,
            message: error.to_string(),
        });
    }
}

async fn has_video_transceiver(pc: &Arc<RTCPeerConnection>) -> bool {
    pc.get_transceivers()
        .await
        .iter()
        .any(|t| t.kind() == RTPCodecType::Video)
}

async fn attach_tracks(pc: &Arc<RTCPeerConnection>, media: &LocalMedia) -> Result<(), WebRTCError> {
    for track in media.tracks() {
        let how = attach_track(pc, track.clone()).await?;
        debug!("Local {} track {}: {:?}", track.kind(), track.id(), how);
    }
    Ok(())
}

/// Put `track` on the connection, preferring an existing transceiver of the same kind
/// whose sender is empty over adding a new one
async fn attach_track(
    pc: &Arc<RTCPeerConnection>,
    track: Arc<dyn TrackLocal + Send + Sync>,
) -> Result<Attach, WebRTCError> {
    let mut reusable = false;
    for transceiver in pc.get_transceivers().await {
        if transceiver.kind() != track.kind() {
            continue;
        }
        match transceiver.sender().await.track().await {
            Some(existing) if existing.id() == track.id() => return Ok(Attach::AlreadyAttached),
            Some(_) => {}
            None => reusable = true,
        }
    }

    // add_track fills the first matching empty transceiver before creating one
    pc.add_track(track)
        .await
        .map_err(|e| WebRTCError::Media(format!("Failed to attach local track: {}", e)))?;
    Ok(if reusable { Attach::Reused } else { Attach::Added })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    struct StillMedia;

    #[async_trait]
    impl MediaProvider for StillMedia {
        async fn open(&self, stream_id: &str) -> Result<LocalMedia, WebRTCError> {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.to_string(),
            ));
            Ok(LocalMedia::new(vec![track]))
        }
    }

    struct NoCamera;

    #[async_trait]
    impl MediaProvider for NoCamera {
        async fn open(&self, _stream_id: &str) -> Result<LocalMedia, WebRTCError> {
            Err(WebRTCError::MediaAccess("permission denied".to_string()))
        }
    }

    fn config() -> WebRTCConfig {
        WebRTCConfig {
            ice_servers: vec![],
            gather_timeout_ms: 3_000,
            ..Default::default()
        }
    }

    fn sender() -> ConnectionNegotiator {
        ConnectionNegotiator::new(Role::Sender, config()).with_media_provider(Arc::new(StillMedia))
    }

    fn receiver() -> ConnectionNegotiator {
        ConnectionNegotiator::new(Role::Receiver, config())
    }

    #[tokio::test]
    async fn test_answer_without_pending_offer_is_rejected() {
        let rx = receiver();
        let err = rx.set_remote_answer("v=0\r\n").await.unwrap_err();
        assert!(matches!(err, WebRTCError::InvalidState(_)));
        assert_eq!(rx.state(), LinkState::New);
        assert!(rx.link_id().await.is_none());
    }

    #[tokio::test]
    async fn test_create_answer_requires_remote_offer() {
        let tx = sender();
        assert!(matches!(
            tx.create_answer().await,
            Err(WebRTCError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_sender_offer_requires_local_media() {
        let tx = sender();
        assert!(matches!(
            tx.create_offer().await,
            Err(WebRTCError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_offer_leaves_link_untouched() {
        let rx = receiver();
        let offer = rx.create_offer().await.unwrap();
        let link_before = rx.link_id().await;
        let mut events = rx.subscribe();

        let tx = sender();
        let err = tx.set_remote_offer("definitely not a descriptor").await.unwrap_err();
        assert!(matches!(err, WebRTCError::Signaling(_)));
        assert_eq!(tx.state(), LinkState::New);

        let err = rx.set_remote_offer("v=0\r\ngarbage\r\n").await.unwrap_err();
        assert!(matches!(err, WebRTCError::Signaling(_)));
        assert_eq!(rx.state(), LinkState::HaveLocalOffer);
        assert_eq!(rx.link_id().await, link_before);
        assert!(matches!(events.try_recv(), Ok(LinkEvent::SignalingError { .. })));

        // the pending offer is untouched too
        assert_eq!(rx.create_offer().await.unwrap(), offer);
    }

    #[tokio::test]
    async fn test_offer_refused_by_transport_keeps_current_link() {
        let rx = receiver();
        let offer = rx.create_offer().await.unwrap();
        let link_before = rx.link_id().await;
        let mut events = rx.subscribe();

        // parses as SDP but carries no ICE credentials
        let refused = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                       m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\n\
                       a=rtpmap:96 VP8/90000\r\na=mid:0\r\na=sendonly\r\n";
        assert!(ConnectionDescriptor::parse(refused, DescriptorKind::Offer)
            .and_then(|d| d.to_rtc())
            .is_ok());

        let err = rx.set_remote_offer(refused).await.unwrap_err();
        assert!(matches!(err, WebRTCError::Signaling(_)));
        assert_eq!(rx.state(), LinkState::HaveLocalOffer);
        assert_eq!(rx.link_id().await, link_before);
        match events.try_recv() {
            Ok(LinkEvent::SignalingError { link_id, .. }) => assert_eq!(link_id, link_before),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(rx.create_offer().await.unwrap(), offer);
    }

    #[tokio::test]
    async fn test_answer_on_connected_link_is_already_applied() {
        let rx = receiver();
        rx.create_offer().await.unwrap();
        let link_id = rx.link_id().await.unwrap();
        assert!(rx
            .observer
            .transition_if(&link_id, LinkState::Connected, |_| true));

        let outcome = rx.set_remote_answer("v=0\r\n").await.unwrap();
        assert_eq!(outcome, AnswerOutcome::AlreadyApplied);
        assert_eq!(rx.state(), LinkState::Connected);
        assert_eq!(rx.link_id().await.unwrap(), link_id);
    }

    #[tokio::test]
    async fn test_media_failure_is_reported_and_link_proceeds() {
        let tx = ConnectionNegotiator::new(Role::Sender, config()).with_media_provider(Arc::new(NoCamera));
        let mut events = tx.subscribe();
        assert!(matches!(
            tx.start_local_media().await,
            Err(WebRTCError::MediaAccess(_))
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(LinkEvent::MediaAccessError { .. })
        ));
        assert!(!tx.has_local_media().await);

        let offer = receiver().create_offer().await.unwrap();
        tx.set_remote_offer(&offer.to_token().unwrap()).await.unwrap();
        assert!(tx.create_answer().await.is_ok());
        assert_eq!(tx.state(), LinkState::HaveLocalAnswer);
    }

    #[tokio::test]
    async fn test_full_exchange_and_answer_ordering() {
        let rx = receiver();
        let tx = sender();
        tx.start_local_media().await.unwrap();

        let offer = rx.create_offer().await.unwrap();
        assert_eq!(offer.kind(), DescriptorKind::Offer);
        assert_eq!(rx.state(), LinkState::HaveLocalOffer);
        assert!(offer.sdp().contains("m=video"));

        tx.set_remote_offer(offer.sdp()).await.unwrap();
        assert_eq!(tx.state(), LinkState::HaveRemoteOffer);

        let answer = tx.create_answer().await.unwrap();
        assert_eq!(answer.kind(), DescriptorKind::Answer);
        assert!(answer.sdp().contains("sendonly") || answer.sdp().contains("sendrecv"));

        // local media is attached once even if started again
        tx.start_local_media().await.unwrap();

        assert_eq!(
            rx.set_remote_answer(&answer.to_json().unwrap()).await.unwrap(),
            AnswerOutcome::Applied
        );
        assert_eq!(
            rx.set_remote_answer(answer.sdp()).await.unwrap(),
            AnswerOutcome::AlreadyApplied
        );

        tx.release().await;
        rx.release().await;
        assert_eq!(rx.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_ended_link_is_rebuilt_on_offer() {
        let rx = receiver();
        rx.create_offer().await.unwrap();
        let first = rx.link_id().await.unwrap();
        rx.observer.transition_if(&first, LinkState::Failed, |_| true);

        let offer = rx.create_offer().await.unwrap();
        assert_eq!(offer.kind(), DescriptorKind::Offer);
        assert_ne!(rx.link_id().await.unwrap(), first);
        assert_eq!(rx.state(), LinkState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_fresh_offer_replaces_link() {
        let tx = sender();
        tx.start_local_media().await.unwrap();
        let mut events = tx.subscribe();

        let first = receiver().create_offer().await.unwrap();
        tx.set_remote_offer(first.sdp()).await.unwrap();
        let first_id = tx.link_id().await.unwrap();

        let second = receiver().create_offer().await.unwrap();
        tx.set_remote_offer(second.sdp()).await.unwrap();
        let second_id = tx.link_id().await.unwrap();

        assert_ne!(first_id, second_id);
        assert_eq!(tx.state(), LinkState::HaveRemoteOffer);

        let mut released = false;
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::Released { link_id } = event {
                assert_eq!(link_id, first_id);
                released = true;
            }
        }
        assert!(released);

        // the reattached media is answered with
        let answer = tx.create_answer().await.unwrap();
        assert!(answer.sdp().contains("m=video"));
    }
}
