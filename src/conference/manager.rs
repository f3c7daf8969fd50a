use super::key::MediaKey;
use super::room::RoomService;
use super::state::{ConferenceState, ConferenceTransition};
use crate::error::CallError;
use crate::events::{ConferenceEvent, EventSink};
use crate::media::{LocalMedia, MediaConstraints, TrackKind};
use crate::peer::{
    CandidateQueue, ConnectionId, ConnectionState, IceCandidate, PeerEvent, PeerTable,
    SessionDescription,
};
use crate::session::SessionContext;
use crate::signaling::{Envelope, ROOM_FULL_REASON, SYSTEM_SENDER, Signal};
use crate::timer::{TimerFired, TimerId, TimerKind};
use crate::types::{ConferenceId, MediaKind, PeerId};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Default)]
struct ConferenceSession {
    state: ConferenceState,
    conference_id: Option<ConferenceId>,
    media_kind: MediaKind,
    /// Includes self once joined.
    participants: BTreeSet<PeerId>,
    peers: PeerTable,
    local_media: LocalMedia,
    media_key: Option<MediaKey>,
    started_at: Option<DateTime<Utc>>,
    duration_timer: Option<TimerId>,
    muted: bool,
    video_suspended: bool,
}

/// Full-mesh conference membership for the local identity.
///
/// Only a newcomer ever originates offers: existing members wait for its
/// `CONF_OFFER`, so two peers never offer to each other in the same round.
pub struct ConferenceSessionManager {
    ctx: SessionContext,
    rooms: Arc<dyn RoomService>,
    events: EventSink<ConferenceEvent>,
    session: ConferenceSession,
}

impl ConferenceSessionManager {
    pub fn new(
        ctx: SessionContext,
        rooms: Arc<dyn RoomService>,
        events: EventSink<ConferenceEvent>,
    ) -> Self {
        Self {
            ctx,
            rooms,
            events,
            session: ConferenceSession::default(),
        }
    }

    pub fn state(&self) -> ConferenceState {
        self.session.state
    }

    pub fn conference_id(&self) -> Option<&ConferenceId> {
        self.session.conference_id.as_ref()
    }

    pub fn media_kind(&self) -> MediaKind {
        self.session.media_kind
    }

    pub fn participants(&self) -> Vec<PeerId> {
        self.session.participants.iter().cloned().collect()
    }

    /// Peers with a live connection entry, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.session.peers.peers()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.session.peers.get(peer).map(|e| e.state())
    }

    pub fn media_key(&self) -> Option<&MediaKey> {
        self.session.media_key.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.session.muted
    }

    pub fn is_video_suspended(&self) -> bool {
        self.session.video_suspended
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.session
            .started_at
            .map(|started| (self.ctx.clock.now() - started).num_seconds())
    }

    // ---- commands ----

    /// Creates a room and joins it as its first member.
    pub async fn create_conference(&mut self, kind: MediaKind) -> Result<ConferenceId, CallError> {
        self.transition(ConferenceTransition::Join)?;
        self.session.media_kind = kind;

        let room = match self.rooms.create_room(self.ctx.self_id()).await {
            Ok(room) => room,
            Err(e) => {
                warn!("Creating a conference failed: {}", e);
                self.teardown();
                return Err(e);
            }
        };
        info!("Created conference {}", room);
        self.enter_room(room.clone(), kind).await?;
        Ok(room)
    }

    pub async fn join_conference(
        &mut self,
        room: ConferenceId,
        kind: MediaKind,
    ) -> Result<(), CallError> {
        self.transition(ConferenceTransition::Join)?;
        info!("Joining conference {}", room);
        self.enter_room(room, kind).await
    }

    async fn enter_room(&mut self, room: ConferenceId, kind: MediaKind) -> Result<(), CallError> {
        self.session.conference_id = Some(room.clone());
        self.session.media_kind = kind;

        if let Err(e) = self.register(&room, kind).await {
            warn!("Join of {} failed: {}", room, e);
            self.abort_join(e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn register(&mut self, room: &ConferenceId, kind: MediaKind) -> Result<(), CallError> {
        let stream = self
            .ctx
            .media
            .acquire(MediaConstraints::for_kind(kind))
            .await?;
        self.session.local_media = LocalMedia::new(stream);
        self.apply_track_toggles();

        let me = self.ctx.self_id().clone();
        self.rooms.join_room(room, &me).await?;

        let announced = self
            .ctx
            .signaler
            .try_send(
                None,
                Signal::ConfJoin {
                    conference_id: room.clone(),
                },
            )
            .await;
        if let Err(e) = announced {
            if let Err(leave) = self.rooms.leave_room(room, &me).await {
                debug!("Leaving {} after failed announce: {}", room, leave);
            }
            return Err(e);
        }

        self.session.participants.insert(me);
        self.session.media_key = Some(MediaKey::generate());
        self.transition(ConferenceTransition::Joined)?;
        info!("Joined conference {}", room);
        Ok(())
    }

    /// Announces departure, deregisters and releases everything.
    pub async fn leave_conference(&mut self) -> Result<(), CallError> {
        let Some(room) = self.session.conference_id.clone() else {
            debug!("leave_conference with no conference");
            return Ok(());
        };

        self.ctx
            .signaler
            .send(
                None,
                Signal::ConfLeave {
                    conference_id: room.clone(),
                    reason: None,
                },
            )
            .await;
        if let Err(e) = self.rooms.leave_room(&room, self.ctx.self_id()).await {
            warn!("Room service leave for {} failed: {}", room, e);
        }

        self.close_all().await;
        self.teardown();
        info!("Left conference {}", room);
        self.events
            .emit(ConferenceEvent::Left { conference_id: room });
        Ok(())
    }

    /// Releases all connections, media and timers without signaling.
    pub async fn cleanup(&mut self) {
        self.close_all().await;
        self.teardown();
    }

    /// Adds a camera track to every peer and renegotiates each connection.
    pub async fn upgrade_to_video(&mut self) -> Result<(), CallError> {
        if !self.session.state.is_active() {
            return Err(CallError::NotActive);
        }
        if self.session.media_kind.has_video() {
            return Ok(());
        }

        let stream = self
            .ctx
            .media
            .acquire(MediaConstraints::video_only())
            .await?;
        let tracks = self.session.local_media.attach(stream);
        self.apply_track_toggles();
        self.session.media_kind = MediaKind::Video;
        self.events
            .emit(ConferenceEvent::MediaUpgraded(MediaKind::Video));

        for peer in self.session.peers.peers() {
            let result = match self.session.peers.get(&peer) {
                Some(entry) => match entry.attach_tracks(&tracks).await {
                    Ok(()) => entry.create_offer().await,
                    Err(e) => Err(e),
                },
                None => continue,
            };
            match result {
                Ok(offer) => {
                    self.send_offer(&peer, offer.sdp, true).await;
                }
                Err(e) => {
                    warn!("Video renegotiation with {} failed: {}", peer, e);
                    self.drop_peer(&peer, true).await;
                }
            }
        }
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.session.muted = muted;
        self.apply_track_toggles();
    }

    pub fn set_video_suspended(&mut self, suspended: bool) {
        self.session.video_suspended = suspended;
        self.apply_track_toggles();
    }

    // ---- inbound signaling ----

    pub async fn handle_signal(&mut self, envelope: Envelope) -> Result<(), CallError> {
        let Envelope { sender, signal, .. } = envelope;
        let kind = signal.signaling_type();
        if !kind.is_conference() {
            return Ok(());
        }
        if self.session.state.is_idle() {
            debug!("Ignoring {} from {}: not in a conference", kind, sender);
            return Ok(());
        }
        if signal.conference_id() != self.session.conference_id.as_ref() {
            debug!("Ignoring {} from {} for another room", kind, sender);
            return Ok(());
        }
        if &sender == self.ctx.self_id() {
            return Ok(());
        }
        debug!("<- {} from {}", kind, sender);

        match signal {
            Signal::ConfJoin { .. } => {
                self.on_member_joined(sender);
                Ok(())
            }
            Signal::ConfPeers { peers, .. } => self.on_roster(peers).await,
            Signal::ConfOffer {
                sdp, renegotiate, ..
            } => self.on_offer(sender, sdp, renegotiate).await,
            Signal::ConfAnswer { sdp, .. } => self.on_answer(sender, sdp).await,
            Signal::ConfIce { candidate, .. } => self.on_remote_candidate(sender, candidate).await,
            Signal::ConfLeave { reason, .. } => {
                if sender.as_str() == SYSTEM_SENDER
                    && reason.as_deref() == Some(ROOM_FULL_REASON)
                {
                    warn!("Room is full, abandoning join");
                    self.abort_join(ROOM_FULL_REASON.to_string()).await;
                    return Err(CallError::RoomFull);
                }
                if self.session.participants.contains(&sender)
                    || self.session.peers.contains(&sender)
                {
                    info!("{} left the conference", sender);
                    self.drop_peer(&sender, false).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_member_joined(&mut self, peer: PeerId) {
        if self.session.participants.contains(&peer) {
            return;
        }
        if self.session.participants.len() >= self.ctx.config.max_participants {
            warn!("Ignoring join from {}: room at capacity", peer);
            return;
        }
        info!("{} joined the conference", peer);
        self.session.participants.insert(peer.clone());
        self.events.emit(ConferenceEvent::ParticipantJoined(peer));
        self.rotate_media_key();
    }

    /// Newcomer side: offer to every member already in the room.
    async fn on_roster(&mut self, roster: Vec<PeerId>) -> Result<(), CallError> {
        let me = self.ctx.self_id().clone();
        let existing: Vec<PeerId> = roster.into_iter().filter(|p| *p != me).collect();

        if existing.len() + 1 > self.ctx.config.max_participants {
            warn!(
                "Roster of {} members exceeds the cap of {}",
                existing.len(),
                self.ctx.config.max_participants
            );
            if let Some(room) = self.session.conference_id.clone() {
                self.ctx
                    .signaler
                    .send(
                        None,
                        Signal::ConfLeave {
                            conference_id: room.clone(),
                            reason: Some(ROOM_FULL_REASON.into()),
                        },
                    )
                    .await;
                if let Err(e) = self.rooms.leave_room(&room, &me).await {
                    debug!("Leaving full room {}: {}", room, e);
                }
            }
            self.abort_join(ROOM_FULL_REASON.to_string()).await;
            return Err(CallError::RoomFull);
        }

        if existing.is_empty() {
            debug!("First member of the room");
            return Ok(());
        }
        info!("Offering to {} existing members", existing.len());
        for peer in existing {
            if self.session.participants.insert(peer.clone()) {
                self.events
                    .emit(ConferenceEvent::ParticipantJoined(peer.clone()));
            }
            if let Err(e) = self.offer_to(&peer).await {
                warn!("Offer to {} failed: {}", peer, e);
                self.drop_peer(&peer, true).await;
            }
        }
        self.rotate_media_key();
        Ok(())
    }

    async fn offer_to(&mut self, peer: &PeerId) -> Result<(), CallError> {
        self.ensure_entry(peer).await?;
        let offer = match self.session.peers.get(peer) {
            Some(entry) => entry.create_offer().await?,
            None => return Err(CallError::PeerUnreachable(peer.clone())),
        };
        self.send_offer(peer, offer.sdp, false).await;
        Ok(())
    }

    async fn send_offer(&self, peer: &PeerId, sdp: String, renegotiate: bool) {
        let Some(room) = self.session.conference_id.clone() else {
            return;
        };
        self.ctx
            .signaler
            .send(
                Some(peer),
                Signal::ConfOffer {
                    conference_id: room,
                    call_type: self.session.media_kind,
                    sdp,
                    renegotiate,
                },
            )
            .await;
    }

    async fn on_offer(
        &mut self,
        sender: PeerId,
        sdp: String,
        renegotiate: bool,
    ) -> Result<(), CallError> {
        if !self.session.participants.contains(&sender) {
            if self.slots_taken_besides(&sender) >= self.ctx.config.max_participants {
                warn!("Ignoring offer from {}: room at capacity", sender);
                self.drop_peer(&sender, false).await;
                return Ok(());
            }
            self.session.participants.insert(sender.clone());
            self.events
                .emit(ConferenceEvent::ParticipantJoined(sender.clone()));
            self.rotate_media_key();
        }

        if let Err(e) = self.answer(&sender, sdp, renegotiate).await {
            warn!("Answering {} failed: {}", sender, e);
            self.drop_peer(&sender, true).await;
            return Err(e);
        }
        Ok(())
    }

    async fn answer(
        &mut self,
        sender: &PeerId,
        sdp: String,
        renegotiate: bool,
    ) -> Result<(), CallError> {
        self.ensure_entry(sender).await?;
        let Some(entry) = self.session.peers.get_mut(sender) else {
            return Err(CallError::PeerUnreachable(sender.clone()));
        };
        entry
            .apply_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = entry.create_answer().await?;

        let Some(room) = self.session.conference_id.clone() else {
            return Ok(());
        };
        self.ctx
            .signaler
            .send(
                Some(sender),
                Signal::ConfAnswer {
                    conference_id: room,
                    sdp: answer.sdp,
                    renegotiate,
                },
            )
            .await;
        Ok(())
    }

    async fn on_answer(&mut self, sender: PeerId, sdp: String) -> Result<(), CallError> {
        let Some(entry) = self.session.peers.get_mut(&sender) else {
            warn!("Answer from {} without a pending offer", sender);
            return Ok(());
        };
        if let Err(e) = entry
            .apply_remote_description(SessionDescription::answer(sdp))
            .await
        {
            warn!("Applying answer from {} failed: {}", sender, e);
            self.drop_peer(&sender, true).await;
            return Err(e);
        }
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        sender: PeerId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        if !self.session.peers.contains(&sender) {
            if !self.session.participants.contains(&sender)
                && self.slots_taken_besides(&sender) >= self.ctx.config.max_participants
            {
                debug!("Dropping ICE from {}: room at capacity", sender);
                return Ok(());
            }
            self.ensure_entry(&sender).await?;
        }
        if let Some(entry) = self.session.peers.get_mut(&sender)
            && let Err(e) = entry.add_remote_candidate(candidate).await
        {
            warn!("ICE candidate from {} rejected: {}", sender, e);
        }
        Ok(())
    }

    // ---- connection callbacks ----

    /// Dispatches a callback from one mesh connection. Events from a
    /// connection that has since been closed or replaced are dropped.
    pub async fn handle_peer_event(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        event: PeerEvent,
    ) {
        let owned = self
            .session
            .peers
            .get(&peer)
            .is_some_and(|entry| entry.owns(connection));
        if !owned {
            debug!("Dropping peer event for {} ({}): no entry", peer, connection);
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(room) = self.session.conference_id.clone() else {
                    return;
                };
                self.ctx
                    .signaler
                    .send(
                        Some(&peer),
                        Signal::ConfIce {
                            conference_id: room,
                            candidate,
                        },
                    )
                    .await;
            }
            PeerEvent::StateChanged(state) => {
                if let Some(entry) = self.session.peers.get_mut(&peer) {
                    entry.set_state(state);
                }
                if state.is_terminal() {
                    warn!("Connection to {} lost ({:?})", peer, state);
                    self.drop_peer(&peer, true).await;
                } else if state == ConnectionState::Connected {
                    info!("Connected to {}", peer);
                    self.events.emit(ConferenceEvent::PeerConnected(peer));
                    self.start_duration_timer();
                }
            }
            PeerEvent::RemoteTrack(stream) => {
                if let Some(entry) = self.session.peers.get_mut(&peer) {
                    entry.set_remote_stream(stream.clone());
                }
                self.events
                    .emit(ConferenceEvent::RemoteStream { peer, stream });
            }
        }
    }

    pub async fn on_timer(&mut self, fired: TimerFired) {
        if fired.kind != TimerKind::DurationTick || self.session.duration_timer != Some(fired.id)
        {
            debug!("Ignoring stale timer {:?}", fired);
            return;
        }
        if let Some(secs) = self.duration_secs() {
            self.events.emit(ConferenceEvent::Duration { secs });
        }
        self.session.duration_timer = Some(
            self.ctx
                .scheduler
                .schedule(TimerKind::DurationTick, self.ctx.config.duration_tick()),
        );
    }

    // ---- helpers ----

    fn transition(&mut self, transition: ConferenceTransition) -> Result<(), CallError> {
        let from = self.session.state;
        let to = from.apply(transition)?;
        self.session.state = to;
        self.events.emit(ConferenceEvent::StateChanged { from, to });
        Ok(())
    }

    fn apply_track_toggles(&self) {
        let media = &self.session.local_media;
        media.set_enabled(TrackKind::Audio, !self.session.muted);
        media.set_enabled(TrackKind::Video, !self.session.video_suspended);
    }

    /// Members plus connections opened for not-yet-members, not counting `peer`.
    fn slots_taken_besides(&self, peer: &PeerId) -> usize {
        let pending = self
            .session
            .peers
            .peers()
            .into_iter()
            .filter(|p| p != peer && !self.session.participants.contains(p))
            .count();
        self.session.participants.len() + pending
    }

    /// Creates the entry for `peer` with local tracks attached, if missing.
    async fn ensure_entry(&mut self, peer: &PeerId) -> Result<(), CallError> {
        if self.session.peers.contains(peer) {
            return Ok(());
        }
        let entry = self.ctx.open_entry(peer, CandidateQueue::new()).await?;
        let tracks = self.session.local_media.tracks();
        let attached = entry.attach_tracks(&tracks).await;
        if let Some(displaced) = self.session.peers.insert(entry) {
            displaced.close().await;
        }
        attached
    }

    /// Removes one peer; the rest of the mesh is untouched.
    async fn drop_peer(&mut self, peer: &PeerId, unreachable: bool) {
        if let Some(entry) = self.session.peers.remove(peer) {
            entry.close().await;
        }
        let was_member = self.session.participants.remove(peer);
        if unreachable {
            self.events
                .emit(ConferenceEvent::PeerUnreachable(peer.clone()));
        }
        if was_member {
            self.events
                .emit(ConferenceEvent::ParticipantLeft(peer.clone()));
            self.rotate_media_key();
        }
    }

    fn rotate_media_key(&mut self) {
        if !self.session.state.is_active() {
            return;
        }
        let next = match &self.session.media_key {
            Some(current) => current.rotate(),
            None => MediaKey::generate(),
        };
        let me = self.ctx.self_id();
        let recipients: Vec<PeerId> = self
            .session
            .participants
            .iter()
            .filter(|p| *p != me)
            .cloned()
            .collect();
        debug!(
            "Media key generation {} ({}) for {} peers",
            next.generation(),
            next.fingerprint(),
            recipients.len()
        );
        self.events.emit(ConferenceEvent::MediaKeyRotated {
            generation: next.generation(),
            key: next.clone(),
            recipients,
        });
        self.session.media_key = Some(next);
    }

    fn start_duration_timer(&mut self) {
        if self.session.started_at.is_some() {
            return;
        }
        self.session.started_at = Some(self.ctx.clock.now());
        self.session.duration_timer = Some(
            self.ctx
                .scheduler
                .schedule(TimerKind::DurationTick, self.ctx.config.duration_tick()),
        );
    }

    async fn close_all(&mut self) {
        for entry in self.session.peers.drain() {
            entry.close().await;
        }
    }

    async fn abort_join(&mut self, reason: String) {
        let room = self.session.conference_id.clone();
        self.close_all().await;
        self.teardown();
        if let Some(conference_id) = room {
            self.events
                .emit(ConferenceEvent::JoinAborted { conference_id, reason });
        }
    }

    /// Returns to idle. Connections must already be closed.
    fn teardown(&mut self) {
        if let Some(id) = self.session.duration_timer.take() {
            self.ctx.scheduler.cancel(id);
        }
        let mut session = std::mem::take(&mut self.session);
        session.local_media.release();

        if !session.state.is_idle() {
            self.events.emit(ConferenceEvent::StateChanged {
                from: session.state,
                to: ConferenceState::Idle,
            });
        }
    }
}
