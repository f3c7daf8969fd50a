//! One-to-one calls.
//!
//! [`CallSessionManager`] drives a single call through
//! `idle → outgoing|incoming → connecting → active → idle`. A second offer
//! while any call is in progress is answered with `CALL_BUSY`. Adding video
//! to a running call renegotiates on the existing connection and never
//! leaves `active`.

mod manager;
mod state;


pub use manager::{BUSY_REASON, CallSessionManager, TIMEOUT_REASON};
pub use state::{CallState, CallTransition, InvalidTransition};
