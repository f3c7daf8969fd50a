use super::{ConnectionId, ConnectionState, IceCandidate, PeerConnection, SessionDescription};
use crate::error::CallError;
use crate::media::{LocalTrack, RemoteStream};
use crate::types::PeerId;
use log::{debug, warn};
use std::collections::VecDeque;

/// Candidates received before a remote description exists, in arrival order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CandidateQueue {
    candidates: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.candidates.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn take_all(&mut self) -> VecDeque<IceCandidate> {
        std::mem::take(&mut self.candidates)
    }
}

/// What happened to a remote candidate handed to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
}

/// One peer connection together with its negotiation bookkeeping.
pub struct PeerConnectionEntry {
    peer: PeerId,
    connection_id: Option<ConnectionId>,
    connection: Box<dyn PeerConnection>,
    pending: CandidateQueue,
    has_remote_description: bool,
    remote_stream: Option<RemoteStream>,
    state: ConnectionState,
}

impl std::fmt::Debug for PeerConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionEntry")
            .field("peer", &self.peer)
            .field("connection_id", &self.connection_id)
            .field("pending", &self.pending.len())
            .field("has_remote_description", &self.has_remote_description)
            .field("remote_stream", &self.remote_stream)
            .field("state", &self.state)
            .finish()
    }
}

impl PeerConnectionEntry {
    pub fn new(peer: PeerId, connection: Box<dyn PeerConnection>) -> Self {
        Self::with_pending(peer, connection, CandidateQueue::new())
    }

    /// Adopts candidates that were buffered before the connection existed.
    pub fn with_pending(
        peer: PeerId,
        connection: Box<dyn PeerConnection>,
        pending: CandidateQueue,
    ) -> Self {
        Self {
            peer,
            connection_id: None,
            connection,
            pending,
            has_remote_description: false,
            remote_stream: None,
            state: ConnectionState::New,
        }
    }

    /// Ties the entry to the event channel its connection reports on.
    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Whether an event tagged `id` came from this entry's connection.
    pub fn owns(&self, id: ConnectionId) -> bool {
        self.connection_id == Some(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn set_remote_stream(&mut self, stream: RemoteStream) {
        self.remote_stream = Some(stream);
    }

    pub async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), CallError> {
        for track in tracks {
            self.connection
                .add_track(track)
                .await
                .map_err(|e| CallError::negotiation("add track", e))?;
        }
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.connection
            .create_offer()
            .await
            .map_err(|e| CallError::negotiation("create offer", e))
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.connection
            .create_answer()
            .await
            .map_err(|e| CallError::negotiation("create answer", e))
    }

    /// Sets the remote description, then applies every queued candidate in
    /// arrival order and empties the queue. Returns how many were applied.
    ///
    /// If the description is rejected the queue is left untouched.
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<usize, CallError> {
        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::negotiation("set remote description", e))?;
        self.has_remote_description = true;

        let queued = self.pending.take_all();
        let mut applied = 0;
        for candidate in queued {
            match self.connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("Queued ICE candidate from {} rejected: {}", self.peer, e),
            }
        }
        if applied > 0 {
            debug!("Flushed {} queued ICE candidates for {}", applied, self.peer);
        }
        Ok(applied)
    }

    /// Applies the candidate now if a remote description exists, else queues it.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, CallError> {
        if !self.has_remote_description {
            self.pending.push(candidate);
            return Ok(CandidateDisposition::Queued);
        }
        self.connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| CallError::negotiation("add ICE candidate", e))?;
        Ok(CandidateDisposition::Applied)
    }

    /// Closes the underlying connection. The entry is consumed.
    pub async fn close(self) {
        if let Err(e) = self.connection.close().await {
            debug!("Closing connection to {} failed: {}", self.peer, e);
        }
    }
}
