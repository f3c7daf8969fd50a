//! Peer connections and their per-peer negotiation bookkeeping.
//!
//! # Architecture
//!
//! - [`PeerConnection`] / [`PeerConnectionFactory`]: the ICE agent seam. A
//!   backend owns the real connection and reports callbacks as [`PeerEvent`]s,
//!   tagged with the [`ConnectionId`] of the connection that raised them.
//! - [`PeerConnectionEntry`]: one connection plus its pending-candidate queue.
//!   Candidates that arrive before a remote description are queued and flushed
//!   in arrival order right after the description is applied.
//! - [`PeerTable`]: the owned collection of entries used by the mesh manager.

mod entry;
#[cfg(feature = "webrtc")]
pub mod rtc;
mod table;

pub use entry::{CandidateDisposition, CandidateQueue, PeerConnectionEntry};
pub use table::PeerTable;

use crate::ice::IceServer;
use crate::media::{LocalTrack, RemoteStream};
use crate::types::PeerId;
use anyhow::Result;
use async_trait::async_trait;
use log::trace;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// An ICE candidate received from or to be sent to a peer.
///
/// The format follows RFC 5245; field names match the browser's
/// `RTCIceCandidateInit` so candidates survive a JSON round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate string (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    /// SDP media stream identification (e.g., "0" for audio)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    /// Username fragment for ICE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Aggregate connection state as reported by the ICE/DTLS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection is considered gone.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Asynchronous callbacks from a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered and must be relayed to the peer.
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// The first remote track arrived.
    RemoteTrack(RemoteStream),
}

/// One connection instance. Reopening a connection to the same peer yields a
/// new id, so callbacks still queued from the old one can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A [`PeerEvent`] tagged with the connection that produced it.
pub type TaggedPeerEvent = (PeerId, ConnectionId, PeerEvent);

/// Channel into which backends push [`PeerEvent`]s for the host to dispatch.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    tx: mpsc::UnboundedSender<TaggedPeerEvent>,
    next_id: Arc<AtomicU64>,
}

impl PeerEventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaggedPeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    /// Binds a fresh [`ConnectionId`] for a new connection to `peer`.
    pub fn for_peer(&self, peer: PeerId) -> PeerEvents {
        PeerEvents {
            peer,
            connection: ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            tx: self.tx.clone(),
        }
    }
}

/// [`PeerEventSender`] bound to one connection.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    peer: PeerId,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<TaggedPeerEvent>,
}

impl PeerEvents {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn emit(&self, event: PeerEvent) {
        if self
            .tx
            .send((self.peer.clone(), self.connection, event))
            .is_err()
        {
            trace!("Peer event for {} dropped, no receiver", self.peer);
        }
    }
}

/// Parameters for every new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionOptions {
    pub ice_servers: Vec<IceServer>,
    pub max_bitrate_kbps: u32,
}

/// One underlying RTCPeerConnection-like handle.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer: &PeerId,
        options: &PeerConnectionOptions,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_json_matches_browser_shape() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());

        let back: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
    }

    #[tokio::test]
    async fn test_peer_events_are_tagged_with_peer_and_connection() {
        let (sender, mut rx) = PeerEventSender::channel();
        let first = sender.for_peer(PeerId::new("bob"));
        let second = sender.for_peer(PeerId::new("bob"));
        assert_ne!(first.connection_id(), second.connection_id());

        first.emit(PeerEvent::StateChanged(ConnectionState::Connecting));

        let (peer, connection, event) = rx.recv().await.unwrap();
        assert_eq!(peer.as_str(), "bob");
        assert_eq!(connection, first.connection_id());
        assert_eq!(event, PeerEvent::StateChanged(ConnectionState::Connecting));
    }
}
