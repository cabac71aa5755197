//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::StateEvent;
use crate::language::Language;
use crate::listener::{ListenerEvent, SpeechCommand};
use crate::state::{Snapshot, TurnId};

/// Largest accepted message; frames travel inline as base64
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Requests from clients to the daemon
///
/// UI commands, plus the platform side reporting recognizer results, speech
/// completions and camera frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    /// Receive snapshots, state events and speech commands
    Subscribe,

    /// Start the assistant; defaults to the configured language
    Initialize {
        #[serde(default)]
        language: Option<Language>,
    },

    StartListening,

    StopListening,

    ActivateManually,

    Dismiss,

    UpdateLanguage { language: Language },

    /// Recognizer output for an open session
    Recognition { event: ListenerEvent },

    /// An utterance from a `speak` command finished
    SpeechDone { utterance: TurnId },

    /// Latest camera frame, JPEG or PNG
    SubmitFrame { image_base64: String },

    /// The camera stopped streaming
    ClearFrame,
}

/// Responses from daemon to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Request accepted
    Ack,

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification from daemon to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum Notification {
    /// The controller's view changed
    Snapshot(Snapshot),
    /// State event occurred
    StateEvent(StateEvent),
    /// Something for the platform speech capability to do
    Speech(SpeechCommand),
}

/// Full daemon status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Current controller snapshot
    pub snapshot: Snapshot,

    /// Language requested by clients
    pub language: Language,

    /// Whether a camera frame is available
    pub frame_available: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenMode;
    use crate::state::SessionMode;

    #[test]
    fn test_request_serialization() {
        let req = Request::UpdateLanguage { language: Language::English };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("update_language"));
        assert!(json.contains("\"en\""));
    }

    #[test]
    fn test_platform_requests_parse() {
        let req: Request = serde_json::from_str(
            r#"{"type":"recognition","event":{"type":"partial_heard","session":2,"text":"hey nova"}}"#,
        )
        .unwrap();
        assert!(matches!(
            req,
            Request::Recognition { event: ListenerEvent::PartialHeard { session: 2, .. } }
        ));

        let req: Request = serde_json::from_str(r#"{"type":"initialize"}"#).unwrap();
        assert!(matches!(req, Request::Initialize { language: None }));
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Status(DaemonStatus {
            version: "0.1.0".into(),
            snapshot: Snapshot::default(),
            language: Language::Spanish,
            frame_available: false,
            uptime_secs: 3,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"mode\":\"idle\""));
    }

    #[test]
    fn test_notifications_keep_inner_tags() {
        let speech = Notification::Speech(SpeechCommand::StartRecognition {
            session: 1,
            mode: ListenMode::Active,
            language: Language::English,
            locale: "en-US".to_string(),
            partial_results: false,
        });
        let json = serde_json::to_string(&speech).unwrap();
        assert!(json.contains("\"notification\":\"speech\""));
        assert!(json.contains("\"command\":\"start_recognition\""));

        let event = Notification::StateEvent(StateEvent::ModeChanged {
            from: SessionMode::Idle,
            to: SessionMode::PassiveListening,
            duration_ms: 0,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"mode_changed\""));
    }
}
