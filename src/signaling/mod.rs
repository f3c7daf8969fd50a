//! Signaling messages, their wire codec, and the outbound sender.

mod codec;
mod filter;
mod message;
mod outbound;

pub use codec::SignalingCodec;
pub use filter::{AesGcmFilter, NoopFilter, PayloadFilter};
pub use message::{Envelope, ROOM_FULL_REASON, SYSTEM_SENDER, Signal, SignalingType};
pub use outbound::Signaler;
