use peercall::peer::IceCandidate;
use peercall::signaling::{AesGcmFilter, Envelope, Signal, SignalingCodec, SignalingType};
use peercall::{CallError, ConferenceId, MediaKind, PeerId};
use std::sync::Arc;

fn encrypted(secret: &str) -> SignalingCodec {
    SignalingCodec::new(Arc::new(
        AesGcmFilter::from_shared_secret(secret.as_bytes()).unwrap(),
    ))
}

#[test]
fn test_decodes_browser_frames() {
    let codec = SignalingCodec::default();
    let frame = r#"{
        "type": "ICE_CANDIDATE",
        "sender": "bob",
        "target": "alice",
        "extra": {
            "candidate": "{\"candidate\":\"candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host\",\"sdpMid\":\"0\",\"sdpMLineIndex\":0}"
        }
    }"#;

    let envelope = codec.decode(frame).unwrap();

    assert_eq!(envelope.sender, PeerId::new("bob"));
    assert_eq!(envelope.target, Some(PeerId::new("alice")));
    let Signal::IceCandidate(candidate) = envelope.signal else {
        panic!("expected a candidate");
    };
    assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    assert_eq!(candidate.sdp_m_line_index, Some(0));
}

#[test]
fn test_system_roster_lists_existing_members() {
    let codec = SignalingCodec::default();
    let frame = r#"{"type":"CONF_PEERS","sender":"system","target":"carol",
                    "extra":{"conferenceId":"standup","peers":"alice, bob,"}}"#;

    let envelope = codec.decode(frame).unwrap();

    assert!(envelope.is_from_system());
    assert_eq!(envelope.signaling_type(), SignalingType::ConfPeers);
    assert_eq!(
        envelope.signal,
        Signal::ConfPeers {
            conference_id: ConferenceId::new("standup"),
            peers: vec![PeerId::new("alice"), PeerId::new("bob")],
        }
    );
}

#[test]
fn test_peers_sharing_a_secret_interoperate() {
    let alice = encrypted("room-secret");
    let bob = encrypted("room-secret");
    let offer = Envelope::new(
        PeerId::new("alice"),
        Some(PeerId::new("bob")),
        Signal::CallOffer {
            call_type: MediaKind::Video,
            sdp: "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".into(),
            renegotiate: false,
        },
    );

    let frame = alice.encode(&offer).unwrap();

    assert!(!frame.contains("IN IP4"));
    assert_eq!(bob.decode(&frame).unwrap(), offer);
}

#[test]
fn test_wrong_secret_is_rejected() {
    let frame = encrypted("one")
        .encode(&Envelope::new(
            PeerId::new("alice"),
            Some(PeerId::new("bob")),
            Signal::IceCandidate(IceCandidate::new("candidate:2 1 UDP 1 10.0.0.1 9 typ host")),
        ))
        .unwrap();

    assert!(encrypted("two").decode(&frame).is_err());
}

#[test]
fn test_control_messages_need_no_body() {
    let codec = encrypted("s");
    let end = Envelope::new(
        PeerId::new("bob"),
        Some(PeerId::new("alice")),
        Signal::CallEnd { reason: None },
    );

    let frame = codec.encode(&end).unwrap();

    assert_eq!(codec.decode(&frame).unwrap(), end);
    assert!(matches!(
        codec.decode(r#"{"type":"CALL_OFFER","sender":"x","extra":{}}"#),
        Err(CallError::Parse(_))
    ));
}
