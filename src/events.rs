//! Notifications emitted by the managers to their host.

use crate::call::CallState;
use crate::conference::{ConferenceState, MediaKey};
use crate::error::MediaError;
use crate::media::RemoteStream;
use crate::types::{ConferenceId, MediaKind, PeerId};
use log::trace;
use tokio::sync::mpsc;

/// Why a 1:1 call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Local `end_call`.
    LocalHangup,
    /// Local `reject_call`.
    LocalReject,
    RemoteHangup,
    RemoteReject,
    RemoteBusy,
    /// Nobody answered within the ring window.
    Timeout,
    ConnectionLost,
    Media(MediaError),
    Negotiation(String),
    /// Resources released without signaling.
    Cleanup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        from: CallState,
        to: CallState,
    },
    IncomingCall {
        peer: PeerId,
        media_kind: MediaKind,
    },
    RingtoneStarted,
    RingtoneStopped,
    RemoteStream(RemoteStream),
    /// Media kind changed by a renegotiation.
    MediaUpgraded(MediaKind),
    /// Elapsed seconds since the call became active.
    Duration {
        secs: i64,
    },
    Ended {
        peer: PeerId,
        reason: EndReason,
        duration_secs: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceEvent {
    StateChanged {
        from: ConferenceState,
        to: ConferenceState,
    },
    ParticipantJoined(PeerId),
    ParticipantLeft(PeerId),
    PeerConnected(PeerId),
    /// A peer's connection dropped and its entry was removed.
    PeerUnreachable(PeerId),
    RemoteStream {
        peer: PeerId,
        stream: RemoteStream,
    },
    MediaUpgraded(MediaKind),
    MediaKeyRotated {
        generation: u32,
        key: MediaKey,
        recipients: Vec<PeerId>,
    },
    Duration {
        secs: i64,
    },
    /// The join attempt was abandoned, e.g. because the room is full.
    JoinAborted {
        conference_id: ConferenceId,
        reason: String,
    },
    Left {
        conference_id: ConferenceId,
    },
}

/// Fire-and-forget event channel. A dropped receiver is tolerated.
#[derive(Debug, Clone)]
pub struct EventSink<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T: std::fmt::Debug> EventSink<T> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: T) {
        if let Err(e) = self.tx.send(event) {
            trace!("Event dropped, no receiver: {:?}", e.0);
        }
    }
}
