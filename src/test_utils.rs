use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::config::CoreConfig;
use crate::conference::RoomService;
use crate::error::{CallError, MediaError};
use crate::ice::{IceConfigProvider, IceServer, StaticIceServers};
use crate::media::{LocalTrack, MediaAcquisition, MediaConstraints, MediaStream, TrackKind};
use crate::net::SignalingTransport;
use crate::peer::{
    IceCandidate, PeerConnection, PeerConnectionFactory, PeerConnectionOptions, PeerEvent,
    PeerEventSender, PeerEvents, SessionDescription, TaggedPeerEvent,
};
use crate::session::SessionContext;
use crate::signaling::{Envelope, Signaler, SignalingCodec, SignalingType};
use crate::timer::{Clock, Scheduler, TimerFired, TimerId, TimerKind};
use crate::types::{ConferenceId, PeerId};

// ---- peer connections ----

#[derive(Debug, Clone, PartialEq)]
pub enum PcCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(String),
    AddTrack(TrackKind),
    Close,
}

#[derive(Default)]
struct PcState {
    calls: Vec<PcCall>,
    fail_set_remote: bool,
    fail_create_offer: bool,
}

/// Shared view of everything a [`FakePeerConnection`] was asked to do.
#[derive(Clone, Default)]
pub struct PcLog {
    state: Arc<Mutex<PcState>>,
}

impl PcLog {
    pub fn calls(&self) -> Vec<PcCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_set_remote(&self, fail: bool) {
        self.state.lock().unwrap().fail_set_remote = fail;
    }

    pub fn fail_create_offer(&self, fail: bool) {
        self.state.lock().unwrap().fail_create_offer = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.calls().contains(&PcCall::Close)
    }

    pub fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PcCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &PcCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: PcCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

pub struct FakePeerConnection {
    label: String,
    log: PcLog,
}

impl FakePeerConnection {
    pub fn new() -> (Self, PcLog) {
        Self::labelled("fake")
    }

    pub fn labelled(label: &str) -> (Self, PcLog) {
        let log = PcLog::default();
        (
            Self {
                label: label.to_string(),
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        if self.log.state.lock().unwrap().fail_create_offer {
            anyhow::bail!("create offer refused");
        }
        self.log.record(PcCall::CreateOffer);
        let n = self.log.count(&PcCall::CreateOffer);
        Ok(SessionDescription::offer(format!("offer-{}-{n}", self.label)))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.log.record(PcCall::CreateAnswer);
        let n = self.log.count(&PcCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-{}-{n}", self.label)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        if self.log.state.lock().unwrap().fail_set_remote {
            anyhow::bail!("malformed SDP");
        }
        self.log.record(PcCall::SetRemote(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.log.record(PcCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()> {
        self.log.record(PcCall::AddTrack(track.kind));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.log.record(PcCall::Close);
        Ok(())
    }
}

/// Hands out [`FakePeerConnection`]s and remembers them per peer.
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<(PeerId, PcLog)>>,
    options: Mutex<Vec<PeerConnectionOptions>>,
    events: Mutex<HashMap<PeerId, PeerEvents>>,
    fail: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Most recent connection opened to `peer`.
    pub fn log_for(&self, peer: &str) -> Option<PcLog> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p.as_str() == peer)
            .map(|(_, log)| log.clone())
    }

    pub fn created(&self) -> Vec<PeerId> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Connections that were opened and never closed.
    pub fn open_connections(&self) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, log)| !log.is_closed())
            .count()
    }

    pub fn last_options(&self) -> Option<PeerConnectionOptions> {
        self.options.lock().unwrap().last().cloned()
    }

    /// Event channel of the most recent connection opened to `peer`.
    pub fn events_for(&self, peer: &str) -> Option<PeerEvents> {
        self.events.lock().unwrap().get(&PeerId::new(peer)).cloned()
    }

    /// Raises `event` on the most recent connection to `peer`.
    pub fn emit(&self, peer: &str, event: PeerEvent) {
        self.events_for(peer)
            .unwrap_or_else(|| panic!("no connection to {peer}"))
            .emit(event);
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        peer: &PeerId,
        options: &PeerConnectionOptions,
        events: PeerEvents,
    ) -> anyhow::Result<Box<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("no ICE agent available");
        }
        let (connection, log) = FakePeerConnection::labelled(peer.as_str());
        self.created.lock().unwrap().push((peer.clone(), log));
        self.options.lock().unwrap().push(options.clone());
        self.events.lock().unwrap().insert(peer.clone(), events);
        Ok(Box::new(connection))
    }
}

// ---- signaling ----

/// Captures outbound frames instead of writing them to a socket.
pub struct RecordingTransport {
    open: AtomicBool,
    frames: Mutex<Vec<String>>,
    codec: SignalingCodec,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
            codec: SignalingCodec::default(),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| self.codec.decode(f).unwrap())
            .collect()
    }

    pub fn sent_of(&self, kind: SignalingType) -> Vec<Envelope> {
        self.sent()
            .into_iter()
            .filter(|e| e.signaling_type() == kind)
            .collect()
    }

    pub fn take_sent(&self) -> Vec<Envelope> {
        let frames = std::mem::take(&mut *self.frames.lock().unwrap());
        frames
            .iter()
            .map(|f| self.codec.decode(f).unwrap())
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: String) -> anyhow::Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

// ---- media ----

#[derive(Debug, Default)]
struct StreamState {
    stopped: bool,
    disabled: HashSet<TrackKind>,
}

pub struct FakeStream {
    id: u64,
    kinds: Vec<TrackKind>,
    state: Arc<Mutex<StreamState>>,
}

impl MediaStream for FakeStream {
    fn tracks(&self) -> Vec<LocalTrack> {
        self.kinds
            .iter()
            .map(|kind| LocalTrack {
                id: format!("track-{}-{:?}", self.id, kind),
                kind: *kind,
            })
            .collect()
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if enabled {
            state.disabled.remove(&kind);
        } else {
            state.disabled.insert(kind);
        }
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().stopped = true;
    }
}

/// Grants (or refuses) media according to a script.
#[derive(Default)]
pub struct ScriptedMedia {
    failure: Mutex<Option<MediaError>>,
    requests: Mutex<Vec<MediaConstraints>>,
    streams: Mutex<Vec<Arc<Mutex<StreamState>>>>,
    next_id: AtomicU64,
}

impl ScriptedMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, error: Option<MediaError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    /// Streams handed out and not yet stopped.
    pub fn live_streams(&self) -> usize {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.lock().unwrap().stopped)
            .count()
    }

    pub fn is_disabled(&self, kind: TrackKind) -> bool {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.lock().unwrap().disabled.contains(&kind))
    }
}

#[async_trait]
impl MediaAcquisition for ScriptedMedia {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn MediaStream>, MediaError> {
        self.requests.lock().unwrap().push(constraints);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        let state = Arc::new(Mutex::new(StreamState::default()));
        self.streams.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeStream {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kinds,
            state,
        }))
    }
}

// ---- timers ----

#[derive(Default)]
struct ScheduledTimers {
    armed: Vec<(TimerId, TimerKind, Duration)>,
    cancelled: HashSet<TimerId>,
    fired: HashSet<TimerId>,
}

/// Records timer requests; tests fire them by hand.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    timers: Mutex<ScheduledTimers>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Timers that were neither cancelled nor fired.
    pub fn pending(&self) -> Vec<(TimerId, TimerKind, Duration)> {
        let timers = self.timers.lock().unwrap();
        timers
            .armed
            .iter()
            .filter(|(id, _, _)| !timers.cancelled.contains(id) && !timers.fired.contains(id))
            .cloned()
            .collect()
    }

    pub fn pending_of(&self, kind: TimerKind) -> Option<(TimerId, Duration)> {
        self.pending()
            .into_iter()
            .rev()
            .find(|(_, k, _)| *k == kind)
            .map(|(id, _, after)| (id, after))
    }

    /// Marks the newest pending timer of `kind` as fired and returns it.
    pub fn fire(&self, kind: TimerKind) -> Option<TimerFired> {
        let (id, _) = self.pending_of(kind)?;
        self.timers.lock().unwrap().fired.insert(id);
        Some(TimerFired { id, kind })
    }

    pub fn is_cancelled(&self, id: TimerId) -> bool {
        self.timers.lock().unwrap().cancelled.contains(&id)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, kind: TimerKind, after: Duration) -> TimerId {
        let id = TimerId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.timers.lock().unwrap().armed.push((id, kind, after));
        id
    }

    fn cancel(&self, id: TimerId) {
        self.timers.lock().unwrap().cancelled.insert(id);
    }
}

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, secs: i64) {
        *self.now.lock().unwrap() += chrono::Duration::seconds(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---- rooms ----

/// Room registry with the same capacity rule as the real service.
pub struct InMemoryRoomService {
    capacity: usize,
    next_id: AtomicU64,
    rooms: Mutex<HashMap<ConferenceId, Vec<PeerId>>>,
    fail: AtomicBool,
}

impl InMemoryRoomService {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            next_id: AtomicU64::new(0),
            rooms: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Registers `count` placeholder members directly.
    pub fn fill(&self, room: &ConferenceId, count: usize) {
        let mut rooms = self.rooms.lock().unwrap();
        let members = rooms.entry(room.clone()).or_default();
        for n in 0..count {
            members.push(PeerId::new(format!("member-{n}")));
        }
    }

    pub fn members(&self, room: &ConferenceId) -> Vec<PeerId> {
        self.rooms
            .lock()
            .unwrap()
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), CallError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::Service(anyhow::anyhow!("room service offline")));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomService for InMemoryRoomService {
    async fn create_room(&self, _owner: &PeerId) -> Result<ConferenceId, CallError> {
        self.check()?;
        let id = ConferenceId::new(format!(
            "room-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.rooms.lock().unwrap().insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn join_room(&self, room: &ConferenceId, member: &PeerId) -> Result<(), CallError> {
        self.check()?;
        let mut rooms = self.rooms.lock().unwrap();
        let members = rooms.entry(room.clone()).or_default();
        if members.contains(member) {
            return Ok(());
        }
        if members.len() >= self.capacity {
            return Err(CallError::RoomFull);
        }
        members.push(member.clone());
        Ok(())
    }

    async fn leave_room(&self, room: &ConferenceId, member: &PeerId) -> Result<(), CallError> {
        self.check()?;
        if let Some(members) = self.rooms.lock().unwrap().get_mut(room) {
            members.retain(|m| m != member);
        }
        Ok(())
    }
}

// ---- wiring ----

/// A full set of fake collaborators for one local identity.
pub struct TestRig {
    pub config: CoreConfig,
    pub transport: Arc<RecordingTransport>,
    pub factory: Arc<FakePeerFactory>,
    pub media: Arc<ScriptedMedia>,
    pub scheduler: Arc<ManualScheduler>,
    pub clock: Arc<FixedClock>,
    pub peer_events: PeerEventSender,
    /// Everything the fake connections emitted, tagged by connection.
    pub peer_rx: tokio::sync::mpsc::UnboundedReceiver<TaggedPeerEvent>,
    self_id: PeerId,
}

impl TestRig {
    pub fn new(self_id: &str) -> Self {
        let (peer_events, peer_rx) = PeerEventSender::channel();
        Self {
            config: CoreConfig::default(),
            transport: RecordingTransport::new(),
            factory: FakePeerFactory::new(),
            media: ScriptedMedia::new(),
            scheduler: ManualScheduler::new(),
            clock: FixedClock::new(),
            peer_events,
            peer_rx,
            self_id: PeerId::new(self_id),
        }
    }

    pub fn context(&self) -> SessionContext {
        let ice = IceConfigProvider::new(
            Arc::new(StaticIceServers(vec![IceServer::stun("stun:stun.test:3478")])),
            &self.config,
        );
        SessionContext {
            config: self.config.clone(),
            signaler: Signaler::new(
                self.self_id.clone(),
                SignalingCodec::default(),
                self.transport.clone(),
            ),
            ice: Arc::new(ice),
            media: self.media.clone(),
            connections: self.factory.clone(),
            peer_events: self.peer_events.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
        }
    }
}

pub fn drain<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
