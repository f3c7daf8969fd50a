//! Call signaling and peer-connection orchestration.
//!
//! Two owned state machines sit on top of a shared plumbing layer:
//!
//! - [`call::CallSessionManager`]: one-to-one audio/video calls.
//! - [`conference::ConferenceSessionManager`]: full-mesh rooms of up to
//!   [`config::CoreConfig::max_participants`] members.
//!
//! Both are driven by the host through command methods, inbound signaling
//! (`handle_signal`), connection callbacks (`handle_peer_event`) and timer
//! firings (`on_timer`), and report back through an [`events::EventSink`].

pub mod call;
pub mod conference;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod ice;
pub mod media;
pub mod net;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod timer;
pub mod types;
pub mod ws;

#[cfg(test)]
pub mod test_utils;

pub use call::{CallSessionManager, CallState};
pub use conference::{ConferenceSessionManager, ConferenceState};
pub use config::CoreConfig;
pub use error::{CallError, MediaError};
pub use session::SessionContext;
pub use types::{ConferenceId, MediaKind, PeerId};
