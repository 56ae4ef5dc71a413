//! Peer-to-peer connections through a rendezvous server.
//!
//! Peers find each other by tag instead of by address. A host keeps a pool of published
//! offers warm ([`OfferPool`]); a guest discovers one and answers it
//! ([`RendezvousClient::connect`]). Both ends get a [`Connection`] that buffers outbound
//! messages while the transport is down and replays them in order once it is back.
//!
//! The rendezvous server is reached through the [`Signaling`] trait and peer transports
//! are produced by a [`TransportFactory`], so both can be swapped for the in-memory
//! implementations in [`signaling::memory`] and [`transport::mock`].

pub mod backoff;
pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod lock;
pub mod polling;
pub mod pool;
pub mod signaling;
mod timer;
pub mod transport;

pub use backoff::ExponentialBackoff;
pub use buffer::{BufferedMessage, MessageBuffer, MessageId};
pub use client::RendezvousClient;
pub use config::{
    BackoffConfig, BufferConfig, ClientConfig, ConnectionConfig, PollingConfig, PoolConfig,
};
pub use connection::{
    AnswerOutcome, AnswererContext, Connection, ConnectionEvent, ConnectionId, ConnectionState,
    Role, SendOutcome,
};
pub use error::{RendezvousError, SignalingError, TransportError};
pub use lock::{AsyncLock, AsyncLockGuard};
pub use polling::{PollEvent, PollingManager};
pub use pool::{OfferPool, PoolEvent};
pub use signaling::Signaling;
pub use transport::{DataChannel, PeerTransport, TransportFactory};
#[cfg(feature = "webrtc")]
pub use transport::webrtc::{WebRtcConfig, WebRtcTransportFactory};
