//! Commands for the platform speech capability
//!
//! Recognition and synthesis run outside the daemon, on whatever device owns
//! the microphone and speaker. The daemon only issues commands; results come
//! back as listener events and speech completions.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::language::Language;

/// Identifies one single-shot recognition session
pub type SessionId = u64;

/// What a recognition session is listening for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    /// Watching partial hypotheses for a wake phrase
    Passive,
    /// Capturing the user's request
    Active,
}

impl std::fmt::Display for ListenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenMode::Passive => write!(f, "passive"),
            ListenMode::Active => write!(f, "active"),
        }
    }
}

/// A command for the platform speech capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SpeechCommand {
    /// Open a new recognition session
    StartRecognition {
        session: SessionId,
        mode: ListenMode,
        language: Language,
        /// Recognizer locale, e.g. `es-ES`
        locale: String,
        /// Partial hypotheses are only needed for wake phrase spotting
        partial_results: bool,
    },

    /// Cancel and release a recognition session
    StopRecognition { session: SessionId },

    /// Speak text; completion is reported back with the same utterance id
    Speak {
        utterance: u64,
        text: String,
        language: Language,
        /// Synthesizer voice locale
        locale: String,
    },

    /// Interrupt whatever is being spoken
    CancelSpeech,
}

/// Sink for speech commands
pub trait SpeechBackend: Send + Sync {
    fn dispatch(&self, command: SpeechCommand);
}

/// Publishes speech commands to subscribed IPC clients
pub struct BroadcastBackend {
    tx: broadcast::Sender<SpeechCommand>,
}

impl BroadcastBackend {
    pub fn new(tx: broadcast::Sender<SpeechCommand>) -> Self {
        Self { tx }
    }
}

impl SpeechBackend for BroadcastBackend {
    fn dispatch(&self, command: SpeechCommand) {
        debug!(?command, "dispatching speech command");
        if self.tx.send(command).is_err() {
            warn!("no speech client subscribed, command dropped");
        }
    }
}
