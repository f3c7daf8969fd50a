//! Signaling message definitions.

use crate::peer::IceCandidate;
use crate::types::{ConferenceId, MediaKind, PeerId};
use std::fmt;

/// Sender identity used by the signaling server for its own messages.
pub const SYSTEM_SENDER: &str = "system";

/// `CONF_LEAVE` reason the server uses when a room is at capacity.
pub const ROOM_FULL_REASON: &str = "full";

/// Wire-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingType {
    /// Call offer, or a renegotiation offer on an active call.
    CallOffer,
    CallAnswer,
    /// ICE candidate for a 1:1 call.
    IceCandidate,
    CallReject,
    CallEnd,
    /// The callee is already in a call.
    CallBusy,
    /// Room broadcast announcing a newcomer.
    ConfJoin,
    /// Existing-member roster sent to the newcomer only.
    ConfPeers,
    ConfOffer,
    ConfAnswer,
    ConfIce,
    ConfLeave,
}

impl SignalingType {
    pub const ALL: [SignalingType; 12] = [
        Self::CallOffer,
        Self::CallAnswer,
        Self::IceCandidate,
        Self::CallReject,
        Self::CallEnd,
        Self::CallBusy,
        Self::ConfJoin,
        Self::ConfPeers,
        Self::ConfOffer,
        Self::ConfAnswer,
        Self::ConfIce,
        Self::ConfLeave,
    ];

    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallOffer => "CALL_OFFER",
            Self::CallAnswer => "CALL_ANSWER",
            Self::IceCandidate => "ICE_CANDIDATE",
            Self::CallReject => "CALL_REJECT",
            Self::CallEnd => "CALL_END",
            Self::CallBusy => "CALL_BUSY",
            Self::ConfJoin => "CONF_JOIN",
            Self::ConfPeers => "CONF_PEERS",
            Self::ConfOffer => "CONF_OFFER",
            Self::ConfAnswer => "CONF_ANSWER",
            Self::ConfIce => "CONF_ICE",
            Self::ConfLeave => "CONF_LEAVE",
        }
    }

    /// Parse from tag name (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag_name().eq_ignore_ascii_case(tag))
    }

    /// Whether this message belongs to the mesh protocol.
    pub const fn is_conference(&self) -> bool {
        matches!(
            self,
            Self::ConfJoin
                | Self::ConfPeers
                | Self::ConfOffer
                | Self::ConfAnswer
                | Self::ConfIce
                | Self::ConfLeave
        )
    }

    /// Whether the payload carries an SDP or ICE body that goes through the filter.
    pub const fn carries_body(&self) -> bool {
        matches!(
            self,
            Self::CallOffer
                | Self::CallAnswer
                | Self::IceCandidate
                | Self::ConfOffer
                | Self::ConfAnswer
                | Self::ConfIce
        )
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// Typed signaling payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    CallOffer {
        call_type: MediaKind,
        sdp: String,
        renegotiate: bool,
    },
    CallAnswer {
        sdp: String,
        renegotiate: bool,
    },
    IceCandidate(IceCandidate),
    CallReject {
        reason: Option<String>,
    },
    CallEnd {
        reason: Option<String>,
    },
    CallBusy {
        reason: Option<String>,
    },
    ConfJoin {
        conference_id: ConferenceId,
    },
    ConfPeers {
        conference_id: ConferenceId,
        peers: Vec<PeerId>,
    },
    ConfOffer {
        conference_id: ConferenceId,
        call_type: MediaKind,
        sdp: String,
        renegotiate: bool,
    },
    ConfAnswer {
        conference_id: ConferenceId,
        sdp: String,
        renegotiate: bool,
    },
    ConfIce {
        conference_id: ConferenceId,
        candidate: IceCandidate,
    },
    ConfLeave {
        conference_id: ConferenceId,
        reason: Option<String>,
    },
}

impl Signal {
    pub const fn signaling_type(&self) -> SignalingType {
        match self {
            Self::CallOffer { .. } => SignalingType::CallOffer,
            Self::CallAnswer { .. } => SignalingType::CallAnswer,
            Self::IceCandidate(_) => SignalingType::IceCandidate,
            Self::CallReject { .. } => SignalingType::CallReject,
            Self::CallEnd { .. } => SignalingType::CallEnd,
            Self::CallBusy { .. } => SignalingType::CallBusy,
            Self::ConfJoin { .. } => SignalingType::ConfJoin,
            Self::ConfPeers { .. } => SignalingType::ConfPeers,
            Self::ConfOffer { .. } => SignalingType::ConfOffer,
            Self::ConfAnswer { .. } => SignalingType::ConfAnswer,
            Self::ConfIce { .. } => SignalingType::ConfIce,
            Self::ConfLeave { .. } => SignalingType::ConfLeave,
        }
    }

    pub fn conference_id(&self) -> Option<&ConferenceId> {
        match self {
            Self::ConfJoin { conference_id }
            | Self::ConfPeers { conference_id, .. }
            | Self::ConfOffer { conference_id, .. }
            | Self::ConfAnswer { conference_id, .. }
            | Self::ConfIce { conference_id, .. }
            | Self::ConfLeave { conference_id, .. } => Some(conference_id),
            _ => None,
        }
    }
}

/// A signal with its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: PeerId,
    /// `None` for room broadcasts.
    pub target: Option<PeerId>,
    pub signal: Signal,
}

impl Envelope {
    pub fn new(sender: PeerId, target: Option<PeerId>, signal: Signal) -> Self {
        Self {
            sender,
            target,
            signal,
        }
    }

    pub fn signaling_type(&self) -> SignalingType {
        self.signal.signaling_type()
    }

    pub fn is_from_system(&self) -> bool {
        self.sender.as_str() == SYSTEM_SENDER
    }
}
