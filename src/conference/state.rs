use crate::call::InvalidTransition;
use serde::Serialize;

/// Lifecycle of the local conference membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConferenceState {
    #[default]
    Idle,
    /// Acquiring media and registering with the room service.
    Joining,
    /// Registered and announced; peers may come and go.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConferenceTransition {
    /// `create_conference` or `join_conference`.
    Join,
    /// Room registration succeeded and `CONF_JOIN` went out.
    Joined,
    /// Local leave, failed join, or the room turned us away.
    Leave,
}

impl ConferenceState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn apply(
        self,
        transition: ConferenceTransition,
    ) -> Result<ConferenceState, InvalidTransition> {
        match (self, transition) {
            (Self::Idle, ConferenceTransition::Join) => Ok(Self::Joining),
            (Self::Joining, ConferenceTransition::Joined) => Ok(Self::Active),
            (Self::Joining | Self::Active, ConferenceTransition::Leave) => Ok(Self::Idle),
            (current, transition) => Err(InvalidTransition {
                current_state: format!("{:?}", current),
                attempted: format!("{:?}", transition),
            }),
        }
    }
}
