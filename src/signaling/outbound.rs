use super::codec::SignalingCodec;
use super::message::{Envelope, Signal};
use crate::error::CallError;
use crate::net::SignalingTransport;
use crate::types::PeerId;
use log::{debug, warn};
use std::sync::Arc;

/// Addresses, encodes and sends signals on behalf of one local identity.
#[derive(Clone)]
pub struct Signaler {
    self_id: PeerId,
    codec: SignalingCodec,
    transport: Arc<dyn SignalingTransport>,
}

impl Signaler {
    pub fn new(
        self_id: PeerId,
        codec: SignalingCodec,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        Self {
            self_id,
            codec,
            transport,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn codec(&self) -> &SignalingCodec {
        &self.codec
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Sends a signal, failing if the channel is closed or the write errors.
    pub async fn try_send(&self, target: Option<&PeerId>, signal: Signal) -> Result<(), CallError> {
        if !self.transport.is_open() {
            return Err(CallError::SignalingUnavailable);
        }
        let envelope = Envelope::new(self.self_id.clone(), target.cloned(), signal);
        let frame = self.codec.encode(&envelope)?;
        self.transport.send(frame).await.map_err(|e| {
            debug!("Signaling write failed: {e}");
            CallError::SignalingUnavailable
        })
    }

    /// Sends a signal, logging and dropping it when the channel is unavailable.
    pub async fn send(&self, target: Option<&PeerId>, signal: Signal) {
        let kind = signal.signaling_type();
        match self.try_send(target, signal).await {
            Ok(()) => debug!(
                "-> {} to {}",
                kind,
                target.map(PeerId::as_str).unwrap_or("room")
            ),
            Err(CallError::SignalingUnavailable) => {
                debug!("Dropping {kind}: signaling channel unavailable")
            }
            Err(e) => warn!("Failed to send {kind}: {e}"),
        }
    }
}
