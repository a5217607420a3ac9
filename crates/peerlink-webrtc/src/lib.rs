//! PeerLink WebRTC Transport
//!
//! `PeerTransport` backed by WebRTC data channels. Each session owns one
//! `RTCPeerConnection`; the initiator creates the data channel and the
//! responder adopts the one announced by the remote side. Candidates are
//! trickled through the session's event stream, so the connection manager
//! relays them like any other signal.

use async_trait::async_trait;
use bytes::Bytes;
use peerlink_core::{
    Address, ChannelOptions, IceCandidate, IceServer, NegotiationRole, PeerTransport,
    SessionEvent, SessionHandle, TransportError, TransportSession,
};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const EVENT_BUFFER: usize = 256;

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// Creates one WebRTC peer connection per negotiation
pub struct WebRtcTransport {
    api: API,
}

impl WebRtcTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Unavailable {
                reason: format!("interceptor setup failed: {e}"),
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_session(
        &self,
        local: &Address,
        peer: &Address,
        role: NegotiationRole,
        options: &ChannelOptions,
    ) -> Result<SessionHandle, TransportError> {
        let config = RTCConfiguration {
            ice_servers: options.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await.map_err(|e| {
            TransportError::Unavailable {
                reason: format!("peer connection: {e}"),
            }
        })?);

        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let session = Arc::new(WebRtcSession {
            peer: peer.clone(),
            connection: connection.clone(),
            channel: Arc::new(RwLock::new(None)),
        });
        session.watch_connection(events.clone());

        match role {
            NegotiationRole::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(options.ordered),
                    max_retransmits: Some(options.max_retransmits),
                    ..Default::default()
                };
                let channel = connection
                    .create_data_channel(&options.label, Some(init))
                    .await
                    .map_err(|e| negotiation_error(peer, e))?;
                adopt_channel(channel, session.channel.clone(), events).await;
            }
            NegotiationRole::Responder => {
                let slot = session.channel.clone();
                connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        debug!("Remote data channel '{}' announced", channel.label());
                        adopt_channel(channel, slot, events).await;
                    })
                }));
            }
        }

        debug!("WebRTC session {} -> {} created as {:?}", local, peer, role);
        Ok(SessionHandle {
            session,
            events: events_rx,
        })
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn negotiation_error(peer: &Address, e: webrtc::Error) -> TransportError {
    TransportError::NegotiationFailed {
        peer: peer.clone(),
        reason: e.to_string(),
    }
}

/// Store the data channel and forward its lifecycle into the event stream
async fn adopt_channel(
    channel: Arc<RTCDataChannel>,
    slot: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::Sender<SessionEvent>,
) {
    let on_open = events.clone();
    channel.on_open(Box::new(move || {
        let events = on_open.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::ChannelOpen).await;
        })
    }));

    let on_message = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = on_message.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::Message(message.data.to_vec())).await;
        })
    }));

    channel.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(SessionEvent::Closed).await;
        })
    }));

    *slot.write().await = Some(channel);
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

pub struct WebRtcSession {
    peer: Address,
    connection: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl WebRtcSession {
    fn watch_connection(&self, events: mpsc::Sender<SessionEvent>) {
        let on_candidate = events.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = on_candidate.clone();
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            };
                            let _ = events.send(SessionEvent::LocalCandidate(candidate)).await;
                        }
                        Err(e) => warn!("Unusable local candidate: {}", e),
                    }
                })
            }));

        let peer = self.peer.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    trace!("Peer connection to {} is {}", peer, state);
                    let event = match state {
                        RTCPeerConnectionState::Failed => {
                            SessionEvent::Failed("peer connection failed".to_string())
                        }
                        RTCPeerConnectionState::Closed => SessionEvent::Closed,
                        _ => return,
                    };
                    let _ = events.send(event).await;
                })
            }));
    }

    fn invalid(e: webrtc::Error) -> TransportError {
        TransportError::InvalidDescription {
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp).map_err(Self::invalid)?;
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(Self::invalid)?;

        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_error(&self.peer, e))?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp).map_err(Self::invalid)?;
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(Self::invalid)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| negotiation_error(&self.peer, e))
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(TransportError::ChannelClosed)?;
        channel
            .send(&Bytes::from(payload))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close().await;
        }
        if let Err(e) = self.connection.close().await {
            warn!("Closing peer connection to {} failed: {}", self.peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn options() -> ChannelOptions {
        ChannelOptions {
            ice_servers: Vec::new(),
            ..ChannelOptions::default()
        }
    }

    #[test]
    fn test_ice_server_conversion() {
        let server = IceServer {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("user".to_string()),
            credential: None,
        };
        let rtc = rtc_ice_server(&server);
        assert_eq!(rtc.urls, server.urls);
        assert_eq!(rtc.username, "user");
        assert!(rtc.credential.is_empty());
    }

    #[tokio::test]
    async fn test_offer_carries_data_channel() {
        let transport = WebRtcTransport::new().unwrap();
        let handle = transport
            .create_session(
                &Address::new("0xa"),
                &Address::new("0xb"),
                NegotiationRole::Initiator,
                &options(),
            )
            .await
            .unwrap();

        let offer = handle.session.create_offer().await.unwrap();
        assert!(offer.contains("m=application"));
        handle.session.close().await;
    }

    #[tokio::test]
    async fn test_malformed_offer_is_rejected() {
        let transport = WebRtcTransport::new().unwrap();
        let handle = transport
            .create_session(
                &Address::new("0xb"),
                &Address::new("0xa"),
                NegotiationRole::Responder,
                &options(),
            )
            .await
            .unwrap();

        let err = handle
            .session
            .accept_offer("not an sdp".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidDescription { .. }));
        handle.session.close().await;
    }

    #[tokio::test]
    async fn test_send_before_channel_exists() {
        let transport = WebRtcTransport::new().unwrap();
        let handle = transport
            .create_session(
                &Address::new("0xb"),
                &Address::new("0xa"),
                NegotiationRole::Responder,
                &options(),
            )
            .await
            .unwrap();

        let err = handle.session.send(b"early".to_vec()).await.unwrap_err();
        assert_eq!(err, TransportError::ChannelClosed);
        handle.session.close().await;
    }

    /// Full negotiation over host candidates
    #[tokio::test]
    #[ignore = "needs local UDP networking"]
    async fn test_two_sessions_exchange_frames() {
        let transport = WebRtcTransport::new().unwrap();
        let (a, b) = (Address::new("0xa"), Address::new("0xb"));
        let mut offerer = transport
            .create_session(&a, &b, NegotiationRole::Initiator, &options())
            .await
            .unwrap();
        let mut answerer = transport
            .create_session(&b, &a, NegotiationRole::Responder, &options())
            .await
            .unwrap();

        let offer = offerer.session.create_offer().await.unwrap();
        let answer = answerer.session.accept_offer(offer).await.unwrap();
        offerer.session.accept_answer(answer).await.unwrap();

        let opened = timeout(Duration::from_secs(10), async {
            let mut open = (false, false);
            while !(open.0 && open.1) {
                tokio::select! {
                    Some(event) = offerer.events.recv() => match event {
                        SessionEvent::LocalCandidate(c) => answerer.session.add_remote_candidate(c).await.unwrap(),
                        SessionEvent::ChannelOpen => open.0 = true,
                        _ => {}
                    },
                    Some(event) = answerer.events.recv() => match event {
                        SessionEvent::LocalCandidate(c) => offerer.session.add_remote_candidate(c).await.unwrap(),
                        SessionEvent::ChannelOpen => open.1 = true,
                        _ => {}
                    },
                }
            }
        })
        .await;
        assert!(opened.is_ok());

        offerer.session.send(b"ping".to_vec()).await.unwrap();
        let received = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(SessionEvent::Message(bytes)) = answerer.events.recv().await {
                    return bytes;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, b"ping");

        offerer.session.close().await;
        answerer.session.close().await;
    }
}
