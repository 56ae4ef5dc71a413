//! Seams between the connection state machine and the peer transport that actually
//! carries data. Implementations are injected through [`TransportFactory`]; nothing in
//! the crate reaches for a global transport constructor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod mock;
#[cfg(feature = "webrtc")]
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_transport_id() -> TransportId {
    TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Connectivity descriptor in the shape browsers and `webrtc` exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Peer-connection level state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Checking,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum TransportEvent {
    GatheringStarted,
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(TransportState),
    /// A channel opened by the remote side (answerers receive theirs this way).
    DataChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GatheringStarted => f.write_str("GatheringStarted"),
            Self::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            Self::GatheringComplete => f.write_str("GatheringComplete"),
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
    Error(String),
}

/// One negotiated peer connection.
///
/// Events are delivered on a single receiver that can be taken once. Events raised
/// before it is taken are queued, so candidates gathered while an offer is still being
/// published are not lost.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Applies the remote answer to a transport that produced an offer.
    async fn apply_answer(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Transport plus channel plus SDP produced for a new offer.
pub struct LocalOffer {
    pub transport: Arc<dyn PeerTransport>,
    pub channel: Option<Arc<dyn DataChannel>>,
    pub sdp: String,
}

/// Transport produced in response to a remote offer. Its channel arrives later as a
/// [`TransportEvent::DataChannel`].
pub struct LocalAnswer {
    pub transport: Arc<dyn PeerTransport>,
    pub sdp: String,
}

impl fmt::Debug for LocalOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalOffer")
            .field("transport", &self.transport.id())
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

impl fmt::Debug for LocalAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAnswer")
            .field("transport", &self.transport.id())
            .finish()
    }
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_offer(&self) -> Result<LocalOffer, TransportError>;

    async fn accept_offer(&self, offer_sdp: &str) -> Result<LocalAnswer, TransportError>;
}

/// Closes `transport` when a negotiation step on it failed, then hands the result back.
#[cfg_attr(not(feature = "webrtc"), allow(dead_code))]
pub(crate) async fn close_on_error<T>(
    transport: &dyn PeerTransport,
    result: Result<T, TransportError>,
) -> Result<T, TransportError> {
    if let Err(err) = &result {
        tracing::debug!(
            target = "rendezvous::transport",
            transport = %transport.id(),
            error = %err,
            "negotiation failed; closing transport"
        );
        transport.close().await;
    }
    result
}
