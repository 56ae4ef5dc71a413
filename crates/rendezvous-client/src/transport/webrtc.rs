//! [`TransportFactory`] backed by the `webrtc` crate.
//!
//! Candidates trickle: the SDP handed to signaling is taken right after the local
//! description is set, and every gathered candidate is reported as a
//! [`TransportEvent::LocalCandidate`].

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ChannelEvent, DataChannel, IceCandidate, LocalAnswer, LocalOffer, PeerTransport,
    TransportEvent, TransportFactory, TransportId, TransportState, close_on_error,
    next_transport_id,
};
use crate::error::{TransportError, to_setup_error};

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const DEFAULT_CHANNEL_LABEL: &str = "rendezvous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    /// STUN/TURN urls handed to every peer connection.
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl WebRtcConfig {
    /// Defaults, with `RENDEZVOUS_ICE_SERVERS` (comma separated) replacing the server list.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(servers) = env::var("RENDEZVOUS_ICE_SERVERS")
            .ok()
            .map(|value| parse_server_list(&value))
            .filter(|servers| !servers.is_empty())
        {
            config.ice_servers = servers;
        }
        config
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

fn parse_server_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let tx = open_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "rendezvous::webrtc", "data channel opened");
                let _ = tx.send(ChannelEvent::Open);
            })
        }));
        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Message(msg.data));
            })
        }));
        let error_tx = tx.clone();
        dc.on_error(Box::new(move |err| {
            let tx = error_tx.clone();
            Box::pin(async move {
                tracing::warn!(target = "rendezvous::webrtc", error = %err, "data channel error");
                let _ = tx.send(ChannelEvent::Error(err.to_string()));
            })
        }));
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::trace!(target = "rendezvous::webrtc", "data channel closed");
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));

        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            events_rx: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.dc.send(&data).await.map(|_| ()).map_err(to_setup_error)
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "rendezvous::webrtc", error = %err, "data channel close failed");
        }
    }
}

struct WebRtcPeer {
    id: TransportId,
    pc: Arc<RTCPeerConnection>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebRtcPeer {
    fn attach(pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = next_transport_id();

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    let _ = tx.send(TransportEvent::GatheringComplete);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => tracing::warn!(
                        target = "rendezvous::webrtc",
                        transport = %id,
                        error = %err,
                        "failed to serialise local candidate"
                    ),
                }
            })
        }));

        let ice_tx = tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                if state == RTCIceConnectionState::Checking {
                    let _ = tx.send(TransportEvent::StateChanged(TransportState::Checking));
                }
            })
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = state_tx.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "rendezvous::webrtc",
                    transport = %id,
                    ?state,
                    "peer connection state changed"
                );
                if let Some(state) = map_peer_state(state) {
                    let _ = tx.send(TransportEvent::StateChanged(state));
                }
            })
        }));

        let channel_tx = tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                let channel: Arc<dyn DataChannel> = WebRtcChannel::wrap(dc);
                let _ = tx.send(TransportEvent::DataChannel(channel));
            })
        }));

        Arc::new(Self {
            id,
            pc,
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        })
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn local_sdp(&self) -> Result<String, TransportError> {
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| TransportError::Setup("missing local description".into()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    fn id(&self) -> TransportId {
        self.id
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned()).map_err(to_setup_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(to_setup_error)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await.map_err(to_setup_error)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                target = "rendezvous::webrtc",
                transport = %self.id,
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

pub struct WebRtcTransportFactory {
    api: API,
    config: WebRtcConfig,
}

impl std::fmt::Debug for WebRtcTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransportFactory")
            .field("config", &self.config)
            .finish()
    }
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            config,
        })
    }

    async fn peer(&self) -> Result<Arc<WebRtcPeer>, TransportError> {
        let pc = self
            .api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcPeer::attach(Arc::new(pc)))
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create_offer(&self) -> Result<LocalOffer, TransportError> {
        let peer = self.peer().await?;
        let negotiated = negotiate_offer(&peer, &self.config.channel_label).await;
        let (channel, sdp) = close_on_error(peer.as_ref(), negotiated).await?;
        tracing::debug!(target = "rendezvous::webrtc", transport = %peer.id, "offer created");

        Ok(LocalOffer {
            transport: peer,
            channel: Some(channel),
            sdp,
        })
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<LocalAnswer, TransportError> {
        let peer = self.peer().await?;
        let negotiated = negotiate_answer(&peer, offer_sdp).await;
        let sdp = close_on_error(peer.as_ref(), negotiated).await?;
        tracing::debug!(target = "rendezvous::webrtc", transport = %peer.id, "answer created");

        Ok(LocalAnswer {
            transport: peer,
            sdp,
        })
    }
}

async fn negotiate_offer(
    peer: &WebRtcPeer,
    label: &str,
) -> Result<(Arc<dyn DataChannel>, String), TransportError> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    };
    let dc = peer
        .pc
        .create_data_channel(label, Some(init))
        .await
        .map_err(to_setup_error)?;
    let channel: Arc<dyn DataChannel> = WebRtcChannel::wrap(dc);

    let offer = peer.pc.create_offer(None).await.map_err(to_setup_error)?;
    peer.emit(TransportEvent::GatheringStarted);
    peer.pc
        .set_local_description(offer)
        .await
        .map_err(to_setup_error)?;
    Ok((channel, peer.local_sdp().await?))
}

async fn negotiate_answer(peer: &WebRtcPeer, offer_sdp: &str) -> Result<String, TransportError> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_owned()).map_err(to_setup_error)?;
    peer.pc
        .set_remote_description(offer)
        .await
        .map_err(to_setup_error)?;
    let answer = peer.pc.create_answer(None).await.map_err(to_setup_error)?;
    peer.emit(TransportEvent::GatheringStarted);
    peer.pc
        .set_local_description(answer)
        .await
        .map_err(to_setup_error)?;
    peer.local_sdp().await
}
