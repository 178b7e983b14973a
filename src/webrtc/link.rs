//! Peer link state
//!
//! A [`PeerLink`] wraps one peer connection together with the descriptors exchanged on
//! it. Transport callbacks publish through a [`LinkObserver`], which ignores links that
//! are no longer current so a released link can never overwrite its successor's state.

use super::peer_connection::PeerConnectionManager;
use super::signaling::ConnectionDescriptor;
use super::WebRTCError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Negotiation / connection state of the current link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    /// Both descriptors applied, transport establishing
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::HaveLocalOffer => "have-local-offer",
            LinkState::HaveRemoteOffer => "have-remote-offer",
            LinkState::HaveLocalAnswer => "have-local-answer",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Observer notifications, each tagged with the link it concerns
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    StateChanged {
        link_id: String,
        from: LinkState,
        to: LinkState,
    },
    RemoteTrack {
        link_id: String,
        track_id: String,
        stream_id: String,
        kind: String,
    },
    GatheringTimedOut {
        link_id: String,
        waited_ms: u64,
    },
    SignalingError {
        link_id: Option<String>,
        message: String,
    },
    MediaAccessError {
        link_id: Option<String>,
        message: String,
    },
    Released {
        link_id: String,
    },
}

/// The most recent remote video, for whatever renders or decodes it
#[derive(Clone)]
pub struct RemoteStream {
    pub link_id: String,
    pub stream_id: String,
    pub track: Arc<TrackRemote>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("link_id", &self.link_id)
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track.id())
            .finish()
    }
}

/// Publication side shared by the negotiator and its link's callbacks
pub struct LinkObserver {
    current: Mutex<Option<String>>,
    state: watch::Sender<LinkState>,
    remote: watch::Sender<Option<RemoteStream>>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkObserver {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(LinkState::New);
        let (remote, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            current: Mutex::new(None),
            state,
            remote,
            events,
        })
    }

    pub fn is_current(&self, link_id: &str) -> bool {
        self.current.lock().as_deref() == Some(link_id)
    }

    fn make_current(&self, link_id: &str) {
        *self.current.lock() = Some(link_id.to_string());
        self.state.send_replace(LinkState::New);
        self.remote.send_replace(None);
    }

    fn clear_current(&self, link_id: &str) {
        let mut current = self.current.lock();
        if current.as_deref() == Some(link_id) {
            *current = None;
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn watch_remote(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.remote.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Move to `to` if the link is current and `allowed(from)` holds
    pub fn transition_if(&self, link_id: &str, to: LinkState, allowed: impl Fn(LinkState) -> bool) -> bool {
        if !self.is_current(link_id) {
            return false;
        }
        let mut from = LinkState::New;
        let changed = self.state.send_if_modified(|state| {
            if *state == to || !allowed(*state) {
                return false;
            }
            from = *state;
            *state = to;
            true
        });
        if changed {
            info!("Link {}: {} -> {}", link_id, from, to);
            self.emit(LinkEvent::StateChanged {
                link_id: link_id.to_string(),
                from,
                to,
            });
        }
        changed
    }

    fn on_transport_state(&self, link_id: &str, state: RTCPeerConnectionState) {
        let to = match state {
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            RTCPeerConnectionState::Disconnected => {
                warn!("Link {}: transport disconnected, waiting for ICE to recover", link_id);
                return;
            }
            _ => return,
        };
        self.transition_if(link_id, to, |from| !from.is_terminal());
    }

    fn on_remote_track(&self, link_id: &str, track: Arc<TrackRemote>) {
        if !self.is_current(link_id) {
            return;
        }
        let stream_id = track.stream_id();
        info!(
            "Link {}: remote {} track {} on stream {}",
            link_id,
            track.kind(),
            track.id(),
            stream_id
        );
        self.emit(LinkEvent::RemoteTrack {
            link_id: link_id.to_string(),
            track_id: track.id(),
            stream_id: stream_id.clone(),
            kind: track.kind().to_string(),
        });
        self.remote.send_replace(Some(RemoteStream {
            link_id: link_id.to_string(),
            stream_id,
            track,
        }));
    }
}

/// One peer connection and the descriptors applied to it
pub struct PeerLink {
    id: String,
    pc: Arc<RTCPeerConnection>,
    observer: Arc<LinkObserver>,
    pub(super) local: Option<ConnectionDescriptor>,
    pub(super) remote: Option<ConnectionDescriptor>,
}

impl PeerLink {
    /// Wrap a fresh peer connection, make it the current link and wire its callbacks
    pub fn open(pc: Arc<RTCPeerConnection>, observer: Arc<LinkObserver>) -> Self {
        let link = Self::staged(pc, observer);
        link.activate();
        link
    }

    /// Wire callbacks without publishing anything. Until [`Self::activate`] the link's
    /// transport callbacks are ignored and the current link keeps its state.
    pub fn staged(pc: Arc<RTCPeerConnection>, observer: Arc<LinkObserver>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();

        let (obs, link_id) = (observer.clone(), id.clone());
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            obs.on_transport_state(&link_id, state);
            Box::pin(async {})
        }));

        let (obs, link_id) = (observer.clone(), id.clone());
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            obs.on_remote_track(&link_id, track);
            Box::pin(async {})
        }));

        let link_id = id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate {
                Some(c) => debug!("Link {}: local candidate {}:{}", link_id, c.address, c.port),
                None => debug!("Link {}: candidate gathering finished", link_id),
            }
            Box::pin(async {})
        }));

        debug!("Link {} opened", id);
        Self {
            id,
            pc,
            observer,
            local: None,
            remote: None,
        }
    }

    /// Make this the current link, resetting the published state to `New`
    pub fn activate(&self) {
        self.observer.make_current(&self.id);
        debug!("Link {} is current", self.id);
    }

    /// Close a link that never became current, without publishing anything
    pub async fn discard(self) {
        self.pc
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        if let Err(e) = PeerConnectionManager::close(&self.pc).await {
            warn!("Discarding link {}: {}", self.id, e);
        }
        debug!("Link {} discarded", self.id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub fn state(&self) -> LinkState {
        if self.observer.is_current(&self.id) {
            self.observer.state()
        } else {
            LinkState::Closed
        }
    }

    pub fn local_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.local.as_ref()
    }

    pub fn remote_descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.remote.as_ref()
    }

    pub fn transition(&self, to: LinkState, allowed: impl Fn(LinkState) -> bool) -> bool {
        self.observer.transition_if(&self.id, to, allowed)
    }

    /// Detach callbacks and close the transport
    pub async fn release(self) -> Result<(), WebRTCError> {
        self.observer.transition_if(&self.id, LinkState::Closed, |_| true);
        self.pc
            .on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        self.observer.clear_current(&self.id);

        let result = PeerConnectionManager::close(&self.pc).await;
        info!("Link {} released", self.id);
        self.observer.emit(LinkEvent::Released {
            link_id: self.id.clone(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_link_cannot_publish() {
        let observer = LinkObserver::new();
        observer.make_current("a");
        assert!(observer.transition_if("a", LinkState::HaveLocalOffer, |s| s == LinkState::New));

        observer.make_current("b");
        assert_eq!(observer.state(), LinkState::New);
        assert!(!observer.transition_if("a", LinkState::Connected, |_| true));
        assert_eq!(observer.state(), LinkState::New);
    }

    #[test]
    fn test_terminal_states_stick() {
        let observer = LinkObserver::new();
        observer.make_current("a");
        observer.on_transport_state("a", RTCPeerConnectionState::Failed);
        assert_eq!(observer.state(), LinkState::Failed);
        observer.on_transport_state("a", RTCPeerConnectionState::Connected);
        assert_eq!(observer.state(), LinkState::Failed);
    }

    #[test]
    fn test_transitions_are_broadcast() {
        let observer = LinkObserver::new();
        let mut rx = observer.subscribe();
        observer.make_current("a");
        observer.transition_if("a", LinkState::HaveRemoteOffer, |_| true);
        observer.on_transport_state("a", RTCPeerConnectionState::Disconnected);

        match rx.try_recv().unwrap() {
            LinkEvent::StateChanged { link_id, from, to } => {
                assert_eq!(link_id, "a");
                assert_eq!(from, LinkState::New);
                assert_eq!(to, LinkState::HaveRemoteOffer);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = LinkEvent::GatheringTimedOut {
            link_id: "a".into(),
            waited_ms: 12_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "gathering_timed_out");
        assert_eq!(json["waited_ms"], 12_000);
    }
}
