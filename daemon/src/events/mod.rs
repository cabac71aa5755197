//! Events module for state machine transitions
//!
//! Structured notifications emitted alongside snapshot updates, for clients
//! that care about what happened rather than only the resulting state.

use serde::{Deserialize, Serialize};

use crate::state::{ActivationSource, SessionMode, TurnId};

/// Events emitted by the state machine during transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// The controller moved to a different mode
    ModeChanged {
        from: SessionMode,
        to: SessionMode,
        /// Time spent in the previous mode
        duration_ms: u64,
    },

    /// Request capture began (wake phrase, button, or follow-up)
    ListeningStarted { source: ActivationSource },

    /// An utterance was accepted and sent to the answer engine
    TurnStarted {
        turn: TurnId,
        transcript: String,
        with_image: bool,
    },

    /// The answer engine replied; speech begins
    ResponseReady {
        turn: TurnId,
        /// Time from request to reply
        duration_ms: u64,
    },

    /// The answer engine failed
    TurnFailed { turn: TurnId, message: String },

    /// The turn was dismissed or interrupted before it finished
    TurnCancelled { turn: TurnId },
}

impl std::fmt::Display for StateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateEvent::ModeChanged { from, to, .. } => write!(f, "MODE_CHANGED ({from} -> {to})"),
            StateEvent::ListeningStarted { source } => write!(f, "LISTENING_STARTED ({source:?})"),
            StateEvent::TurnStarted { turn, with_image, .. } => {
                write!(f, "TURN_STARTED (#{turn}, image={with_image})")
            }
            StateEvent::ResponseReady { turn, duration_ms } => {
                write!(f, "RESPONSE_READY (#{turn}, {duration_ms}ms)")
            }
            StateEvent::TurnFailed { turn, message } => write!(f, "TURN_FAILED (#{turn}: {message})"),
            StateEvent::TurnCancelled { turn } => write!(f, "TURN_CANCELLED (#{turn})"),
        }
    }
}
