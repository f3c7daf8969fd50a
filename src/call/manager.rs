//! 1:1 call orchestration.

use super::state::{CallState, CallTransition};
use crate::error::CallError;
use crate::events::{CallEvent, EndReason, EventSink};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, RemoteStream, TrackKind};
use crate::peer::{
    CandidateQueue, ConnectionId, ConnectionState, IceCandidate, PeerConnectionEntry, PeerEvent,
    SessionDescription,
};
use crate::session::SessionContext;
use crate::signaling::{Envelope, Signal};
use crate::timer::{TimerFired, TimerId, TimerKind};
use crate::types::{MediaKind, PeerId};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

/// `CALL_END` reason sent by a caller whose ring window expired.
pub const TIMEOUT_REASON: &str = "timeout";

/// `CALL_BUSY` reason sent when an offer arrives during another call.
pub const BUSY_REASON: &str = "busy";

#[derive(Default)]
struct CallSession {
    state: CallState,
    peer: Option<PeerId>,
    media_kind: MediaKind,
    local_media: LocalMedia,
    entry: Option<PeerConnectionEntry>,
    pending_offer: Option<String>,
    /// ICE that arrived while ringing, before any connection exists.
    early_candidates: CandidateQueue,
    ringing: bool,
    started_at: Option<DateTime<Utc>>,
    muted: bool,
    video_suspended: bool,
    ring_timer: Option<TimerId>,
    duration_timer: Option<TimerId>,
}

/// Owns at most one 1:1 call for the local identity.
///
/// Every mutation goes through a command method, [`handle_signal`],
/// [`handle_peer_event`] or [`on_timer`]. The host is expected to call these
/// from a single task.
///
/// [`handle_signal`]: CallSessionManager::handle_signal
/// [`handle_peer_event`]: CallSessionManager::handle_peer_event
/// [`on_timer`]: CallSessionManager::on_timer
pub struct CallSessionManager {
    ctx: SessionContext,
    events: EventSink<CallEvent>,
    session: CallSession,
}

impl CallSessionManager {
    pub fn new(ctx: SessionContext, events: EventSink<CallEvent>) -> Self {
        Self {
            ctx,
            events,
            session: CallSession::default(),
        }
    }

    pub fn state(&self) -> CallState {
        self.session.state
    }

    pub fn peer(&self) -> Option<&PeerId> {
        self.session.peer.as_ref()
    }

    pub fn media_kind(&self) -> MediaKind {
        self.session.media_kind
    }

    pub fn is_muted(&self) -> bool {
        self.session.muted
    }

    pub fn is_video_suspended(&self) -> bool {
        self.session.video_suspended
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.session.started_at
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.session.entry.as_ref()?.remote_stream()
    }

    pub fn has_connection(&self) -> bool {
        self.session.entry.is_some()
    }

    /// Seconds since the call became active.
    pub fn duration_secs(&self) -> Option<i64> {
        self.session
            .started_at
            .map(|started| (self.ctx.clock.now() - started).num_seconds())
    }

    // ---- commands ----

    pub async fn start_call(&mut self, peer: PeerId, kind: MediaKind) -> Result<(), CallError> {
        self.session.state.apply(CallTransition::StartCall)?;
        info!("Calling {} ({})", peer, kind);

        self.session.peer = Some(peer.clone());
        self.session.media_kind = kind;
        self.transition(CallTransition::StartCall)?;

        if let Err(e) = self.setup_outgoing(&peer, kind).await {
            warn!("Outgoing call to {} failed during setup: {}", peer, e);
            self.teardown(end_reason(&e)).await;
            return Err(e);
        }
        Ok(())
    }

    async fn setup_outgoing(&mut self, peer: &PeerId, kind: MediaKind) -> Result<(), CallError> {
        self.acquire_local_media(MediaConstraints::for_kind(kind))
            .await?;

        let entry = self.ctx.open_entry(peer, CandidateQueue::new()).await?;
        let tracks = self.session.local_media.tracks();
        let entry = self.session.entry.insert(entry);
        entry.attach_tracks(&tracks).await?;
        let offer = entry.create_offer().await?;

        self.ctx
            .signaler
            .send(
                Some(peer),
                Signal::CallOffer {
                    call_type: kind,
                    sdp: offer.sdp,
                    renegotiate: false,
                },
            )
            .await;

        self.start_ringing();
        Ok(())
    }

    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        self.session.state.apply(CallTransition::Accept)?;
        let Some(peer) = self.session.peer.clone() else {
            return Err(CallError::NotActive);
        };
        info!("Accepting call from {}", peer);

        self.cancel_ring_timer();
        self.stop_ringing();
        self.transition(CallTransition::Accept)?;

        if let Err(e) = self.setup_incoming(&peer).await {
            warn!("Accepting call from {} failed: {}", peer, e);
            self.ctx
                .signaler
                .send(
                    Some(&peer),
                    Signal::CallEnd {
                        reason: Some("error".into()),
                    },
                )
                .await;
            self.teardown(end_reason(&e)).await;
            return Err(e);
        }
        Ok(())
    }

    async fn setup_incoming(&mut self, peer: &PeerId) -> Result<(), CallError> {
        let offer = self
            .session
            .pending_offer
            .take()
            .ok_or_else(|| CallError::Negotiation("no pending offer".into()))?;

        self.acquire_local_media(MediaConstraints::for_kind(self.session.media_kind))
            .await?;

        let early = std::mem::take(&mut self.session.early_candidates);
        let entry = self.ctx.open_entry(peer, early).await?;
        let tracks = self.session.local_media.tracks();
        let entry = self.session.entry.insert(entry);
        entry.attach_tracks(&tracks).await?;
        entry
            .apply_remote_description(SessionDescription::offer(offer))
            .await?;
        let answer = entry.create_answer().await?;

        self.ctx
            .signaler
            .send(
                Some(peer),
                Signal::CallAnswer {
                    sdp: answer.sdp,
                    renegotiate: false,
                },
            )
            .await;
        Ok(())
    }

    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        self.session.state.apply(CallTransition::Reject)?;
        if let Some(peer) = self.session.peer.clone() {
            info!("Rejecting call from {}", peer);
            self.ctx
                .signaler
                .send(Some(&peer), Signal::CallReject { reason: None })
                .await;
        }
        self.teardown(EndReason::LocalReject).await;
        Ok(())
    }

    /// Hangs up with a `CALL_END`. A no-op when idle.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        if self.session.state.is_idle() {
            debug!("end_call with no call in progress");
            return Ok(());
        }
        if let Some(peer) = self.session.peer.clone() {
            info!("Ending call with {}", peer);
            self.ctx
                .signaler
                .send(Some(&peer), Signal::CallEnd { reason: None })
                .await;
        }
        self.teardown(EndReason::LocalHangup).await;
        Ok(())
    }

    /// Releases everything without signaling the peer. Safe from any state.
    pub async fn cleanup(&mut self) {
        self.teardown(EndReason::Cleanup).await;
    }

    /// Adds a camera track to the running call and renegotiates.
    pub async fn upgrade_to_video(&mut self) -> Result<(), CallError> {
        if !self.session.state.is_active() {
            return Err(CallError::NotActive);
        }
        if self.session.media_kind.has_video() {
            debug!("Call already carries video");
            return Ok(());
        }
        let (Some(peer), Some(_)) = (self.session.peer.clone(), self.session.entry.as_ref())
        else {
            return Err(CallError::NotActive);
        };

        let mut stream = self
            .ctx
            .media
            .acquire(MediaConstraints::video_only())
            .await?;
        let offer = match self.offer_with_tracks(&stream.tracks()).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Video upgrade with {} failed: {}", peer, e);
                stream.stop();
                return Err(e);
            }
        };
        self.session.local_media.attach(stream);
        if self.session.video_suspended {
            self.session.local_media.set_enabled(TrackKind::Video, false);
        }

        self.ctx
            .signaler
            .send(
                Some(&peer),
                Signal::CallOffer {
                    call_type: MediaKind::Video,
                    sdp: offer.sdp,
                    renegotiate: true,
                },
            )
            .await;

        self.session.media_kind = MediaKind::Video;
        self.events.emit(CallEvent::MediaUpgraded(MediaKind::Video));
        info!("Upgraded call with {} to video", peer);
        Ok(())
    }

    async fn offer_with_tracks(
        &self,
        tracks: &[LocalTrack],
    ) -> Result<SessionDescription, CallError> {
        let Some(entry) = self.session.entry.as_ref() else {
            return Err(CallError::NotActive);
        };
        entry.attach_tracks(tracks).await?;
        entry.create_offer().await
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.session.muted = muted;
        self.session.local_media.set_enabled(TrackKind::Audio, !muted);
    }

    pub fn set_video_suspended(&mut self, suspended: bool) {
        self.session.video_suspended = suspended;
        self.session
            .local_media
            .set_enabled(TrackKind::Video, !suspended);
    }

    // ---- inbound signaling ----

    pub async fn handle_signal(&mut self, envelope: Envelope) -> Result<(), CallError> {
        let Envelope { sender, signal, .. } = envelope;
        debug!("<- {} from {}", signal.signaling_type(), sender);

        match signal {
            Signal::CallOffer {
                call_type,
                sdp,
                renegotiate,
            } => self.on_offer(sender, call_type, sdp, renegotiate).await,
            Signal::CallAnswer { sdp, renegotiate } => {
                self.on_answer(sender, sdp, renegotiate).await
            }
            Signal::IceCandidate(candidate) => {
                self.on_remote_candidate(sender, candidate).await;
                Ok(())
            }
            Signal::CallEnd { reason } => {
                self.on_remote_end(sender, EndReason::RemoteHangup, reason)
                    .await;
                Ok(())
            }
            Signal::CallReject { reason } => {
                self.on_remote_end(sender, EndReason::RemoteReject, reason)
                    .await;
                Ok(())
            }
            Signal::CallBusy { reason } => {
                self.on_remote_end(sender, EndReason::RemoteBusy, reason)
                    .await;
                Ok(())
            }
            other => {
                debug!("Ignoring {} in call manager", other.signaling_type());
                Ok(())
            }
        }
    }

    async fn on_offer(
        &mut self,
        sender: PeerId,
        call_type: MediaKind,
        sdp: String,
        renegotiate: bool,
    ) -> Result<(), CallError> {
        if renegotiate && self.is_current_peer(&sender) {
            if self.session.state.is_active() {
                return self.answer_renegotiation(&sender, call_type, sdp).await;
            }
            warn!(
                "Ignoring renegotiation offer from {} in state {:?}",
                sender, self.session.state
            );
            return Ok(());
        }

        if !self.session.state.is_idle() {
            info!("Busy: rejecting offer from {}", sender);
            self.ctx
                .signaler
                .send(
                    Some(&sender),
                    Signal::CallBusy {
                        reason: Some(BUSY_REASON.into()),
                    },
                )
                .await;
            return Ok(());
        }

        info!("Incoming {} call from {}", call_type, sender);
        self.session.peer = Some(sender.clone());
        self.session.media_kind = call_type;
        self.session.pending_offer = Some(sdp);
        self.session.early_candidates = CandidateQueue::new();
        self.transition(CallTransition::OfferReceived)?;

        self.events.emit(CallEvent::IncomingCall {
            peer: sender,
            media_kind: call_type,
        });
        self.start_ringing();
        Ok(())
    }

    async fn answer_renegotiation(
        &mut self,
        sender: &PeerId,
        call_type: MediaKind,
        sdp: String,
    ) -> Result<(), CallError> {
        let Some(entry) = self.session.entry.as_mut() else {
            return Err(CallError::NotActive);
        };
        entry
            .apply_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = entry.create_answer().await?;

        self.ctx
            .signaler
            .send(
                Some(sender),
                Signal::CallAnswer {
                    sdp: answer.sdp,
                    renegotiate: true,
                },
            )
            .await;

        if call_type.has_video() && !self.session.media_kind.has_video() {
            self.session.media_kind = MediaKind::Video;
            self.events.emit(CallEvent::MediaUpgraded(MediaKind::Video));
        }
        debug!("Answered renegotiation from {}", sender);
        Ok(())
    }

    async fn on_answer(
        &mut self,
        sender: PeerId,
        sdp: String,
        renegotiate: bool,
    ) -> Result<(), CallError> {
        if !self.is_current_peer(&sender) {
            debug!("Ignoring answer from {}, not in a call with them", sender);
            return Ok(());
        }

        if renegotiate {
            if !self.session.state.is_active() {
                warn!("Ignoring renegotiation answer outside an active call");
                return Ok(());
            }
            let Some(entry) = self.session.entry.as_mut() else {
                return Err(CallError::NotActive);
            };
            entry
                .apply_remote_description(SessionDescription::answer(sdp))
                .await?;
            debug!("Renegotiation with {} complete", sender);
            return Ok(());
        }

        if let Err(e) = self.session.state.apply(CallTransition::AnswerReceived) {
            warn!("Unexpected answer from {}: {}", sender, e);
            return Ok(());
        }
        self.cancel_ring_timer();
        self.transition(CallTransition::AnswerReceived)?;

        let result = match self.session.entry.as_mut() {
            Some(entry) => entry
                .apply_remote_description(SessionDescription::answer(sdp))
                .await
                .map(|_| ()),
            None => Err(CallError::Negotiation("answer without connection".into())),
        };
        if let Err(e) = result {
            warn!("Applying answer from {} failed: {}", sender, e);
            self.teardown(end_reason(&e)).await;
            return Err(e);
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, sender: PeerId, candidate: IceCandidate) {
        if !self.is_current_peer(&sender) {
            debug!("Ignoring ICE from {}, not in a call with them", sender);
            return;
        }
        match self.session.entry.as_mut() {
            Some(entry) => {
                if let Err(e) = entry.add_remote_candidate(candidate).await {
                    warn!("ICE candidate from {} rejected: {}", sender, e);
                }
            }
            None => self.session.early_candidates.push(candidate),
        }
    }

    async fn on_remote_end(&mut self, sender: PeerId, reason: EndReason, wire: Option<String>) {
        if !self.is_current_peer(&sender) {
            debug!("Ignoring {:?} from {}, not in a call with them", reason, sender);
            return;
        }
        info!(
            "Call with {} ended remotely ({:?}, reason {})",
            sender,
            reason,
            wire.as_deref().unwrap_or("none")
        );
        self.teardown(reason).await;
    }

    // ---- connection callbacks ----

    /// Dispatches a callback from the connection identified by `connection`.
    /// Events from a connection this call no longer owns are dropped.
    pub async fn handle_peer_event(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        event: PeerEvent,
    ) {
        let owned = self
            .session
            .entry
            .as_ref()
            .is_some_and(|entry| entry.owns(connection));
        if !self.is_current_peer(&peer) || !owned {
            debug!(
                "Dropping peer event for {} ({}): no matching call",
                peer, connection
            );
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.ctx
                    .signaler
                    .send(Some(&peer), Signal::IceCandidate(candidate))
                    .await;
            }
            PeerEvent::StateChanged(state) => self.on_connection_state(&peer, state).await,
            PeerEvent::RemoteTrack(stream) => {
                if let Some(entry) = self.session.entry.as_mut() {
                    entry.set_remote_stream(stream.clone());
                }
                self.events.emit(CallEvent::RemoteStream(stream));
            }
        }
    }

    async fn on_connection_state(&mut self, peer: &PeerId, state: ConnectionState) {
        if let Some(entry) = self.session.entry.as_mut() {
            entry.set_state(state);
        }
        debug!("Connection to {} is {:?}", peer, state);

        if state.is_terminal() {
            warn!("Connection to {} lost ({:?})", peer, state);
            self.teardown(EndReason::ConnectionLost).await;
            return;
        }

        if state == ConnectionState::Connected
            && self.session.state == CallState::Connecting
            && self.transition(CallTransition::Connected).is_ok()
        {
            self.cancel_ring_timer();
            self.stop_ringing();
            self.session.started_at = Some(self.ctx.clock.now());
            self.session.duration_timer = Some(
                self.ctx
                    .scheduler
                    .schedule(TimerKind::DurationTick, self.ctx.config.duration_tick()),
            );
            info!("Call with {} is active", peer);
        }
    }

    // ---- timers ----

    pub async fn on_timer(&mut self, fired: TimerFired) {
        match fired.kind {
            TimerKind::RingTimeout if self.session.ring_timer == Some(fired.id) => {
                self.session.ring_timer = None;
                self.on_ring_timeout().await;
            }
            TimerKind::DurationTick if self.session.duration_timer == Some(fired.id) => {
                if let Some(secs) = self.duration_secs() {
                    self.events.emit(CallEvent::Duration { secs });
                }
                self.session.duration_timer = Some(
                    self.ctx
                        .scheduler
                        .schedule(TimerKind::DurationTick, self.ctx.config.duration_tick()),
                );
            }
            _ => debug!("Ignoring stale timer {:?}", fired),
        }
    }

    async fn on_ring_timeout(&mut self) {
        let Some(peer) = self.session.peer.clone() else {
            return;
        };
        match self.session.state {
            CallState::Outgoing => {
                info!("{} did not answer, cancelling", peer);
                self.ctx
                    .signaler
                    .send(
                        Some(&peer),
                        Signal::CallEnd {
                            reason: Some(TIMEOUT_REASON.into()),
                        },
                    )
                    .await;
                self.teardown(EndReason::Timeout).await;
            }
            CallState::Incoming => {
                info!("Missed call from {}", peer);
                self.teardown(EndReason::Timeout).await;
            }
            other => debug!("Ring timeout ignored in state {:?}", other),
        }
    }

    // ---- helpers ----

    fn is_current_peer(&self, peer: &PeerId) -> bool {
        self.session.peer.as_ref() == Some(peer)
    }

    fn transition(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let from = self.session.state;
        let to = from.apply(transition)?;
        if from != to {
            self.session.state = to;
            self.events.emit(CallEvent::StateChanged { from, to });
        }
        Ok(())
    }

    async fn acquire_local_media(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        let stream = self.ctx.media.acquire(constraints).await?;
        self.session.local_media = LocalMedia::new(stream);
        if self.session.muted {
            self.session.local_media.set_enabled(TrackKind::Audio, false);
        }
        if self.session.video_suspended {
            self.session.local_media.set_enabled(TrackKind::Video, false);
        }
        Ok(())
    }

    fn start_ringing(&mut self) {
        self.session.ringing = true;
        self.events.emit(CallEvent::RingtoneStarted);
        self.session.ring_timer = Some(
            self.ctx
                .scheduler
                .schedule(TimerKind::RingTimeout, self.ctx.config.ring_timeout()),
        );
    }

    fn stop_ringing(&mut self) {
        if std::mem::take(&mut self.session.ringing) {
            self.events.emit(CallEvent::RingtoneStopped);
        }
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(id) = self.session.ring_timer.take() {
            self.ctx.scheduler.cancel(id);
        }
    }

    /// Returns to idle, releasing timers, connection and media. Idempotent.
    async fn teardown(&mut self, reason: EndReason) {
        self.cancel_ring_timer();
        if let Some(id) = self.session.duration_timer.take() {
            self.ctx.scheduler.cancel(id);
        }
        self.stop_ringing();

        let duration_secs = self.duration_secs();
        let mut session = std::mem::take(&mut self.session);

        if let Some(entry) = session.entry.take() {
            entry.close().await;
        }
        session.local_media.release();

        if session.state.is_idle() {
            return;
        }
        self.events.emit(CallEvent::StateChanged {
            from: session.state,
            to: CallState::Idle,
        });
        if let Some(peer) = session.peer {
            debug!("Call with {} torn down ({:?})", peer, reason);
            self.events.emit(CallEvent::Ended {
                peer,
                reason,
                duration_secs,
            });
        }
    }
}

fn end_reason(err: &CallError) -> EndReason {
    match err {
        CallError::Media(e) => EndReason::Media(e.clone()),
        other => EndReason::Negotiation(other.to_string()),
    }
}
