//! 1:1 call state machine.

use serde::Serialize;

/// Current state of a 1:1 call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    /// Offer sent, waiting for the callee.
    Outgoing,
    /// Offer received, ringing locally.
    Incoming,
    /// Descriptions exchanged, waiting for the connection.
    Connecting,
    /// Media flowing.
    Active,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming)
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Incoming)
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Incoming)
    }

    /// Returns the state reached by `transition`, or an error if the table
    /// has no such edge.
    pub fn apply(self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle, CallTransition::StartCall) => Self::Outgoing,
            (Self::Idle, CallTransition::OfferReceived) => Self::Incoming,
            (Self::Incoming, CallTransition::Accept) => Self::Connecting,
            (Self::Incoming, CallTransition::Reject) => Self::Idle,
            (Self::Outgoing | Self::Connecting, CallTransition::AnswerReceived) => {
                Self::Connecting
            }
            (Self::Connecting, CallTransition::Connected) => Self::Active,
            (
                Self::Outgoing | Self::Incoming | Self::Connecting | Self::Active,
                CallTransition::Hangup,
            ) => Self::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

/// State transitions for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    StartCall,
    OfferReceived,
    Accept,
    Reject,
    AnswerReceived,
    /// Connection reached "connected".
    Connected,
    /// Local or remote end, busy, timeout or connection loss.
    Hangup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
