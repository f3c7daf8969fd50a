//! Local and remote media handles.
//!
//! Device access is a host concern; the core only asks for streams through
//! [`MediaAcquisition`] and toggles, attaches and releases the tracks it gets.

use crate::error::MediaError;
use crate::types::MediaKind;
use async_trait::async_trait;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track that can be attached to peer connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// What to ask the device layer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const fn for_kind(kind: MediaKind) -> Self {
        Self {
            audio: true,
            video: kind.has_video(),
        }
    }

    pub const fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// An acquired capture stream. Dropping it without `stop` may leave devices open.
pub trait MediaStream: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;

    fn set_enabled(&self, kind: TrackKind, enabled: bool);

    /// Releases the underlying devices.
    fn stop(&mut self);
}

/// Asks the platform for camera/microphone access.
#[async_trait]
pub trait MediaAcquisition: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn MediaStream>, MediaError>;
}

/// A stream surfaced by a peer connection once its first remote track arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub kinds: Vec<TrackKind>,
}

impl RemoteStream {
    pub fn has_video(&self) -> bool {
        self.kinds.contains(&TrackKind::Video)
    }
}

/// Local media exclusively owned by one session.
#[derive(Default)]
pub struct LocalMedia {
    streams: Vec<Box<dyn MediaStream>>,
}

impl LocalMedia {
    pub fn new(stream: Box<dyn MediaStream>) -> Self {
        Self {
            streams: vec![stream],
        }
    }

    /// Adopts another stream (e.g. a camera added mid-call) and returns its tracks.
    pub fn attach(&mut self, stream: Box<dyn MediaStream>) -> Vec<LocalTrack> {
        let tracks = stream.tracks();
        self.streams.push(stream);
        tracks
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.streams.iter().flat_map(|s| s.tracks()).collect()
    }

    pub fn has_video(&self) -> bool {
        self.tracks().iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for stream in &self.streams {
            stream.set_enabled(kind, enabled);
        }
    }

    pub fn release(&mut self) {
        for mut stream in self.streams.drain(..) {
            stream.stop();
        }
        debug!("Released local media");
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        for stream in self.streams.iter_mut() {
            stream.stop();
        }
    }
}
