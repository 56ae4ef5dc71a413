use thiserror::Error;

use crate::connection::ConnectionState;

/// Failures raised by a peer transport or its data channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("data channel is not open")]
    NotOpen,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timed out")]
    Timeout,
}

/// Failures reported by the signaling collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling unavailable: {0}")]
    Unavailable(String),
    #[error("signaling rejected request: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("signaling credential rejected")]
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("conflicting answer for offer {offer_id}")]
    ConflictingAnswer { offer_id: String },
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("{operation} is not supported by this connection role")]
    WrongRole { operation: &'static str },
    #[error("rotation already in progress")]
    RotationInProgress,
    #[error("rotation limit reached after {attempts} attempts")]
    RotationLimit { attempts: u32 },
    #[error("no offers found for tags {tags:?}")]
    NoOffersFound { tags: Vec<String> },
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
