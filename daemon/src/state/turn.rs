//! One question/answer cycle

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Identifies a turn; doubles as the utterance id of its spoken reply
pub type TurnId = u64;

/// How the current conversation was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    /// The user said the wake phrase; one turn, then back to passive
    VoiceTriggered,
    /// The user pressed the button; keep listening for follow-ups
    ManuallyTriggered,
}

/// A recognized request on its way to an answer
///
/// Created once per utterance and never mutated; a new utterance makes a new
/// turn.
#[derive(Debug, Clone)]
pub struct Turn {
    id: TurnId,
    transcript: String,
    source: ActivationSource,
    frame: Option<Frame>,
}

impl Turn {
    pub fn new(id: TurnId, transcript: String, source: ActivationSource, frame: Option<Frame>) -> Self {
        Self {
            id,
            transcript,
            source,
            frame,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn source(&self) -> ActivationSource {
        self.source
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn has_frame(&self) -> bool {
        self.frame.is_some()
    }
}
