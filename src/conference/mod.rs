//! Full-mesh multi-party conferences.
//!
//! # Join protocol
//!
//! 1. The newcomer registers with the [`RoomService`] and broadcasts `CONF_JOIN`.
//! 2. The server answers the newcomer alone with `CONF_PEERS`, the roster of
//!    members already present, and relays `CONF_JOIN` to them.
//! 3. The newcomer opens one connection per listed member and sends each a
//!    targeted `CONF_OFFER`. Existing members only ever answer.
//! 4. `CONF_ICE` is relayed point to point and queued per entry until that
//!    entry has a remote description.
//! 5. `CONF_LEAVE` removes exactly one peer. An empty room stays open.

mod key;
mod manager;
mod room;
mod state;


pub use key::MediaKey;
pub use manager::ConferenceSessionManager;
pub use room::{HttpRoomService, RoomService};
pub use state::{ConferenceState, ConferenceTransition};
