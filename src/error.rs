//! Error types for call and conference orchestration.

use crate::call::InvalidTransition;
use crate::types::PeerId;
use thiserror::Error;

/// Failure to obtain a camera or microphone stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    Denied,

    #[error("no matching media device found")]
    NotFound,

    #[error("media device is busy or unavailable")]
    Unavailable,

    #[error("media acquisition failed: {0}")]
    Other(String),
}

impl MediaError {
    /// Whether the host can show a specific remedy for this failure.
    pub const fn is_actionable(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("signaling channel is not open")]
    SignalingUnavailable,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("room is full")]
    RoomFull,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(PeerId),

    #[error("invalid state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("session is not active")]
    NotActive,

    #[error("service request failed: {0}")]
    Service(#[source] anyhow::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("encryption error: {0}")]
    Encryption(String),
}

impl CallError {
    pub(crate) fn negotiation(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Negotiation(format!("{context}: {err}"))
    }
}
