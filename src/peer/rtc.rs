//! [`PeerConnectionFactory`] backed by the `webrtc` crate.

use super::{
    ConnectionState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerConnectionOptions,
    PeerEvent, PeerEvents, SdpKind, SessionDescription,
};
use crate::ice::IceServer;
use crate::media::{LocalTrack, RemoteStream, TrackKind};
use crate::types::PeerId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub struct RtcPeerConnectionFactory {
    api: API,
}

impl RtcPeerConnectionFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

/// Adds a `b=AS` line to every video section that lacks one.
pub(crate) fn cap_video_bitrate(sdp: &str, kbps: u32) -> String {
    let mut out = Vec::new();
    let mut in_video = false;
    let mut capped = false;
    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
            capped = false;
        } else if in_video && line.starts_with("b=") {
            capped = true;
        }
        out.push(line.to_string());
        if in_video && !capped && line.starts_with("c=") {
            out.push(format!("b=AS:{kbps}"));
            capped = true;
        }
    }
    let mut joined = out.join("\r\n");
    joined.push_str("\r\n");
    joined
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        peer: &PeerId,
        options: &PeerConnectionOptions,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: options.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .with_context(|| format!("new peer connection for {peer}"))?,
        );
        let closed = Arc::new(AtomicBool::new(false));

        let (ev, gone) = (events.clone(), closed.clone());
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let (ev, gone) = (ev.clone(), gone.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                if gone.load(Ordering::Acquire) {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => ev.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Dropping local candidate for {}: {e}", ev.peer()),
                }
            })
        }));

        let (ev, gone) = (events.clone(), closed.clone());
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let (ev, gone) = (ev.clone(), gone.clone());
            Box::pin(async move {
                if gone.load(Ordering::Acquire) {
                    return;
                }
                debug!("Connection to {} is {state}", ev.peer());
                if let Some(state) = connection_state(state) {
                    ev.emit(PeerEvent::StateChanged(state));
                }
            })
        }));

        let (ev, gone) = (events, closed.clone());
        let first_track = Arc::new(AtomicBool::new(true));
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                let (ev, gone, first) = (ev.clone(), gone.clone(), first_track.clone());
                Box::pin(async move {
                    if gone.load(Ordering::Acquire) || !first.swap(false, Ordering::AcqRel) {
                        return;
                    }
                    let mut kinds = vec![TrackKind::Audio];
                    if track.kind() == RTPCodecType::Video
                        || transceiver.kind() == RTPCodecType::Video
                    {
                        kinds.push(TrackKind::Video);
                    }
                    ev.emit(PeerEvent::RemoteTrack(RemoteStream {
                        id: track.stream_id(),
                        kinds,
                    }));
                })
            },
        ));

        info!("Opened peer connection to {peer}");
        Ok(Box::new(RtcPeerConnection {
            pc,
            closed,
            max_bitrate_kbps: options.max_bitrate_kbps,
        }))
    }
}

struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
    max_bitrate_kbps: u32,
}

impl RtcPeerConnection {
    async fn apply_local(&self, mut description: RTCSessionDescription) -> Result<String> {
        if self.max_bitrate_kbps > 0 {
            description.sdp = cap_video_bitrate(&description.sdp, self.max_bitrate_kbps);
        }
        let sdp = description.sdp.clone();
        self.pc
            .set_local_description(description)
            .await
            .context("set local description")?;
        Ok(sdp)
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        Ok(SessionDescription::offer(self.apply_local(offer).await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        Ok(SessionDescription::answer(self.apply_local(answer).await?))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc
            .set_remote_description(remote)
            .await
            .context("set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .context("add ice candidate")
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            "local".to_owned(),
        ));
        self.pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("add track")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pc.close().await.context("close peer connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_cap_only_touches_video_sections() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=mid:1\r\n";

        let capped = cap_video_bitrate(sdp, 1500);

        let lines: Vec<&str> = capped.lines().collect();
        assert_eq!(lines.iter().filter(|l| l.starts_with("b=AS")).count(), 1);
        let video = lines.iter().position(|l| l.starts_with("m=video")).unwrap();
        assert_eq!(lines[video + 2], "b=AS:1500");
    }

    #[test]
    fn test_existing_bandwidth_line_is_kept() {
        let sdp = "m=video 9 RTP 96\r\nb=AS:300\r\nc=IN IP4 0.0.0.0\r\n";
        let capped = cap_video_bitrate(sdp, 1500);
        assert!(capped.contains("b=AS:300"));
        assert!(!capped.contains("b=AS:1500"));
    }

    #[test]
    fn test_unspecified_state_is_not_reported() {
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
    }
}
