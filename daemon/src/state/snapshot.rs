//! Read-only view of the controller for UI clients

use serde::{Deserialize, Serialize};

/// The six controller modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Idle,
    PassiveListening,
    ActiveListening,
    Processing,
    Responding,
    Error,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Idle => write!(f, "Idle"),
            SessionMode::PassiveListening => write!(f, "PassiveListening"),
            SessionMode::ActiveListening => write!(f, "ActiveListening"),
            SessionMode::Processing => write!(f, "Processing"),
            SessionMode::Responding => write!(f, "Responding"),
            SessionMode::Error => write!(f, "Error"),
        }
    }
}

/// Everything a UI needs to render the assistant
///
/// Rebuilt from scratch on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub mode: SessionMode,
    pub transcript: Option<String>,
    pub response: Option<String>,
    pub sent_with_image: bool,
    pub error: Option<String>,
}
