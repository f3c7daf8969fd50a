//! JSON wire format for signaling messages.
//!
//! ```json
//! {"type":"CONF_OFFER","sender":"carol","target":"alice",
//!  "extra":{"conferenceId":"r1","callType":"audio","sdp":"v=0..."}}
//! ```
//!
//! `sdp` and `candidate` bodies pass through the configured [`PayloadFilter`].
//! With a passthrough filter they stay plain text; otherwise the filtered
//! bytes are base64 encoded.

use super::filter::{NoopFilter, PayloadFilter};
use super::message::{Envelope, Signal, SignalingType};
use crate::error::CallError;
use crate::peer::IceCandidate;
use crate::types::{ConferenceId, MediaKind, PeerId};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    sender: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<PeerId>,
    #[serde(default)]
    extra: WireExtra,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call_type: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    renegotiate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conference_id: Option<ConferenceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peers: Option<String>,
}

/// Serializes envelopes to text frames and back.
#[derive(Clone)]
pub struct SignalingCodec {
    filter: Arc<dyn PayloadFilter>,
}

impl Default for SignalingCodec {
    fn default() -> Self {
        Self::new(Arc::new(NoopFilter))
    }
}

impl SignalingCodec {
    pub fn new(filter: Arc<dyn PayloadFilter>) -> Self {
        Self { filter }
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<String, CallError> {
        let mut extra = WireExtra::default();

        match &envelope.signal {
            Signal::CallOffer {
                call_type,
                sdp,
                renegotiate,
            } => {
                extra.call_type = Some(*call_type);
                extra.sdp = Some(self.seal(sdp)?);
                extra.renegotiate = *renegotiate;
            }
            Signal::CallAnswer { sdp, renegotiate } => {
                extra.sdp = Some(self.seal(sdp)?);
                extra.renegotiate = *renegotiate;
            }
            Signal::IceCandidate(candidate) => {
                extra.candidate = Some(self.seal_candidate(candidate)?);
            }
            Signal::CallReject { reason }
            | Signal::CallEnd { reason }
            | Signal::CallBusy { reason } => {
                extra.reason.clone_from(reason);
            }
            Signal::ConfJoin { conference_id } => {
                extra.conference_id = Some(conference_id.clone());
            }
            Signal::ConfPeers {
                conference_id,
                peers,
            } => {
                extra.conference_id = Some(conference_id.clone());
                extra.peers = Some(
                    peers
                        .iter()
                        .map(PeerId::as_str)
                        .collect::<Vec<_>>()
                        .join(","),
                );
            }
            Signal::ConfOffer {
                conference_id,
                call_type,
                sdp,
                renegotiate,
            } => {
                extra.conference_id = Some(conference_id.clone());
                extra.call_type = Some(*call_type);
                extra.sdp = Some(self.seal(sdp)?);
                extra.renegotiate = *renegotiate;
            }
            Signal::ConfAnswer {
                conference_id,
                sdp,
                renegotiate,
            } => {
                extra.conference_id = Some(conference_id.clone());
                extra.sdp = Some(self.seal(sdp)?);
                extra.renegotiate = *renegotiate;
            }
            Signal::ConfIce {
                conference_id,
                candidate,
            } => {
                extra.conference_id = Some(conference_id.clone());
                extra.candidate = Some(self.seal_candidate(candidate)?);
            }
            Signal::ConfLeave {
                conference_id,
                reason,
            } => {
                extra.conference_id = Some(conference_id.clone());
                extra.reason.clone_from(reason);
            }
        }

        let wire = WireMessage {
            kind: envelope.signaling_type().tag_name().to_string(),
            sender: envelope.sender.clone(),
            target: envelope.target.clone(),
            extra,
        };
        serde_json::to_string(&wire).map_err(|e| CallError::Parse(e.to_string()))
    }

    pub fn decode(&self, frame: &str) -> Result<Envelope, CallError> {
        let wire: WireMessage =
            serde_json::from_str(frame).map_err(|e| CallError::Parse(e.to_string()))?;
        let kind = SignalingType::from_tag(&wire.kind)
            .ok_or_else(|| CallError::Parse(format!("unknown signaling type: {}", wire.kind)))?;
        let mut extra = wire.extra;

        let signal = match kind {
            SignalingType::CallOffer => Signal::CallOffer {
                call_type: extra.call_type.unwrap_or_default(),
                sdp: self.open(required(extra.sdp.take(), "sdp")?)?,
                renegotiate: extra.renegotiate,
            },
            SignalingType::CallAnswer => Signal::CallAnswer {
                sdp: self.open(required(extra.sdp.take(), "sdp")?)?,
                renegotiate: extra.renegotiate,
            },
            SignalingType::IceCandidate => Signal::IceCandidate(
                self.open_candidate(required(extra.candidate.take(), "candidate")?)?,
            ),
            SignalingType::CallReject => Signal::CallReject {
                reason: extra.reason,
            },
            SignalingType::CallEnd => Signal::CallEnd {
                reason: extra.reason,
            },
            SignalingType::CallBusy => Signal::CallBusy {
                reason: extra.reason,
            },
            SignalingType::ConfJoin => Signal::ConfJoin {
                conference_id: required(extra.conference_id, "conferenceId")?,
            },
            SignalingType::ConfPeers => Signal::ConfPeers {
                conference_id: required(extra.conference_id, "conferenceId")?,
                peers: parse_roster(extra.peers.as_deref().unwrap_or_default()),
            },
            SignalingType::ConfOffer => Signal::ConfOffer {
                conference_id: required(extra.conference_id, "conferenceId")?,
                call_type: extra.call_type.unwrap_or_default(),
                sdp: self.open(required(extra.sdp.take(), "sdp")?)?,
                renegotiate: extra.renegotiate,
            },
            SignalingType::ConfAnswer => Signal::ConfAnswer {
                conference_id: required(extra.conference_id, "conferenceId")?,
                sdp: self.open(required(extra.sdp.take(), "sdp")?)?,
                renegotiate: extra.renegotiate,
            },
            SignalingType::ConfIce => Signal::ConfIce {
                conference_id: required(extra.conference_id, "conferenceId")?,
                candidate: self
                    .open_candidate(required(extra.candidate.take(), "candidate")?)?,
            },
            SignalingType::ConfLeave => Signal::ConfLeave {
                conference_id: required(extra.conference_id, "conferenceId")?,
                reason: extra.reason,
            },
        };

        Ok(Envelope {
            sender: wire.sender,
            target: wire.target,
            signal,
        })
    }

    fn seal(&self, body: &str) -> Result<String, CallError> {
        let encoded = self.filter.encode(body.as_bytes())?;
        if self.filter.is_passthrough() {
            String::from_utf8(encoded).map_err(|e| CallError::Encryption(e.to_string()))
        } else {
            Ok(STANDARD.encode(encoded))
        }
    }

    fn open(&self, body: String) -> Result<String, CallError> {
        let raw = if self.filter.is_passthrough() {
            body.into_bytes()
        } else {
            STANDARD
                .decode(body.as_bytes())
                .map_err(|e| CallError::Parse(format!("body is not base64: {e}")))?
        };
        let decoded = self.filter.decode(&raw)?;
        String::from_utf8(decoded).map_err(|e| CallError::Parse(e.to_string()))
    }

    fn seal_candidate(&self, candidate: &IceCandidate) -> Result<String, CallError> {
        let json = serde_json::to_string(candidate).map_err(|e| CallError::Parse(e.to_string()))?;
        self.seal(&json)
    }

    fn open_candidate(&self, body: String) -> Result<IceCandidate, CallError> {
        let json = self.open(body)?;
        serde_json::from_str(&json).map_err(|e| CallError::Parse(format!("candidate: {e}")))
    }
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, CallError> {
    value.ok_or_else(|| CallError::Parse(format!("missing required field: {field}")))
}

fn parse_roster(raw: &str) -> Vec<PeerId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PeerId::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::filter::AesGcmFilter;

    fn offer() -> Envelope {
        Envelope::new(
            PeerId::new("alice"),
            Some(PeerId::new("bob")),
            Signal::CallOffer {
                call_type: MediaKind::Video,
                sdp: "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".into(),
                renegotiate: false,
            },
        )
    }

    #[test]
    fn test_plain_offer_wire_shape() {
        let frame = SignalingCodec::default().encode(&offer()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(json["type"], "CALL_OFFER");
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["target"], "bob");
        assert_eq!(json["extra"]["callType"], "video");
        assert!(json["extra"]["sdp"].as_str().unwrap().starts_with("v=0"));
        assert!(json["extra"].get("renegotiate").is_none());
    }

    #[test]
    fn test_renegotiation_flag_survives() {
        let codec = SignalingCodec::default();
        let envelope = Envelope::new(
            PeerId::new("bob"),
            Some(PeerId::new("alice")),
            Signal::CallAnswer {
                sdp: "v=0".into(),
                renegotiate: true,
            },
        );
        let decoded = codec.decode(&codec.encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_roster_is_comma_separated() {
        let codec = SignalingCodec::default();
        let envelope = Envelope::new(
            PeerId::new("system"),
            Some(PeerId::new("carol")),
            Signal::ConfPeers {
                conference_id: ConferenceId::new("r1"),
                peers: vec![PeerId::new("alice"), PeerId::new("bob")],
            },
        );
        let frame = codec.encode(&envelope).unwrap();
        assert!(frame.contains(r#""peers":"alice,bob""#));

        let decoded = codec
            .decode(r#"{"type":"CONF_PEERS","sender":"system","target":"carol","extra":{"conferenceId":"r1","peers":" alice, ,bob "}}"#)
            .unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_filtered_bodies_are_opaque_on_the_wire() {
        let codec = SignalingCodec::new(Arc::new(
            AesGcmFilter::from_shared_secret(b"room secret").unwrap(),
        ));
        let envelope = Envelope::new(
            PeerId::new("alice"),
            Some(PeerId::new("bob")),
            Signal::IceCandidate(IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 9 typ host")),
        );

        let frame = codec.encode(&envelope).unwrap();
        assert!(!frame.contains("10.0.0.1"));
        assert_eq!(codec.decode(&frame).unwrap(), envelope);

        let plain = SignalingCodec::default();
        assert!(plain.decode(&frame).is_err());
    }

    #[test]
    fn test_decode_errors() {
        let codec = SignalingCodec::default();
        assert!(matches!(codec.decode("nope"), Err(CallError::Parse(_))));
        assert!(matches!(
            codec.decode(r#"{"type":"CALL_HOLD","sender":"a"}"#),
            Err(CallError::Parse(_))
        ));
        assert!(matches!(
            codec.decode(r#"{"type":"CALL_OFFER","sender":"a","target":"b","extra":{}}"#),
            Err(CallError::Parse(_))
        ));
        assert!(matches!(
            codec.decode(r#"{"type":"CONF_JOIN","sender":"a"}"#),
            Err(CallError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_extra_is_fine_for_control_messages() {
        let decoded = SignalingCodec::default()
            .decode(r#"{"type":"CALL_END","sender":"bob","target":"alice"}"#)
            .unwrap();
        assert_eq!(decoded.signal, Signal::CallEnd { reason: None });
    }
}
