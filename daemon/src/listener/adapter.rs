//! Recognition session management
//!
//! Platform recognition sessions are single-shot: each one ends with a final
//! hypothesis or an error. The state machine decides when to listen again;
//! this adapter turns that decision into a delayed restart and guarantees
//! that at most one session is ever open.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::language::Language;

use super::backend::{ListenMode, SessionId, SpeechBackend, SpeechCommand};

/// Normalized recognizer failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionErrorKind {
    /// Nothing matched what was heard
    NoSpeech,
    /// No speech before the recognizer gave up
    Timeout,
    /// The recognizer had not released its previous session yet
    Busy,
    Other,
}

impl RecognitionErrorKind {
    /// Map a platform recognizer error code
    pub fn from_platform_code(code: i32) -> Self {
        match code {
            6 => Self::Timeout,
            7 => Self::NoSpeech,
            8 => Self::Busy,
            _ => Self::Other,
        }
    }

    /// Silence rather than a recognizer fault
    pub fn is_silence(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::Timeout)
    }
}

impl std::fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSpeech => write!(f, "no speech detected"),
            Self::Timeout => write!(f, "timeout"),
            Self::Busy => write!(f, "recognizer busy"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Accepts either a kind name or a raw platform error code
impl<'de> Deserialize<'de> for RecognitionErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "snake_case")]
        enum Named {
            NoSpeech,
            Timeout,
            Busy,
            Other,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Code(i32),
            Named(Named),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Code(code) => Self::from_platform_code(code),
            Repr::Named(Named::NoSpeech) => Self::NoSpeech,
            Repr::Named(Named::Timeout) => Self::Timeout,
            Repr::Named(Named::Busy) => Self::Busy,
            Repr::Named(Named::Other) => Self::Other,
        })
    }
}

/// Events reported by the platform recognizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerEvent {
    /// In-progress hypothesis (passive sessions only)
    PartialHeard { session: SessionId, text: String },
    /// Completed utterance; ends the session
    FinalHeard { session: SessionId, text: String },
    /// Recognition failed; ends the session
    RecognitionError {
        session: SessionId,
        kind: RecognitionErrorKind,
    },
}

impl ListenerEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::PartialHeard { session, .. }
            | Self::FinalHeard { session, .. }
            | Self::RecognitionError { session, .. } => *session,
        }
    }

    /// Whether the platform closes the session after this event
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PartialHeard { .. })
    }
}

/// Delays applied before reopening a recognition session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Lets the platform release the previous session
    pub restart_delay: Duration,
    /// Extra wait after the recognizer reports itself busy
    pub busy_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(300),
            busy_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// No delays at all
    pub fn immediate() -> Self {
        Self {
            restart_delay: Duration::ZERO,
            busy_backoff: Duration::ZERO,
        }
    }

    /// Delay before retrying after a recognition error
    pub fn delay_after(&self, kind: RecognitionErrorKind) -> Duration {
        match kind {
            RecognitionErrorKind::Busy => self.busy_backoff + self.restart_delay,
            _ => self.restart_delay,
        }
    }
}

/// A scheduled session start, delivered back to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartTicket {
    generation: u64,
    pub mode: ListenMode,
}

/// Opens and closes recognition sessions on behalf of the state machine
pub struct Listener {
    backend: Arc<dyn SpeechBackend>,
    policy: RetryPolicy,
    restart_tx: mpsc::UnboundedSender<RestartTicket>,
    language: Language,
    /// Bumped on every start or stop; older tickets are void
    generation: u64,
    next_session: SessionId,
    open: Option<SessionId>,
}

impl Listener {
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        policy: RetryPolicy,
        restart_tx: mpsc::UnboundedSender<RestartTicket>,
    ) -> Self {
        Self {
            backend,
            policy,
            restart_tx,
            language: Language::default(),
            generation: 0,
            next_session: 1,
            open: None,
        }
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    /// Schedule a passive (wake phrase) session
    pub fn start_passive(&mut self) {
        self.schedule(ListenMode::Passive, self.policy.restart_delay);
    }

    /// Schedule an active (request capture) session
    pub fn start_active(&mut self) {
        self.schedule(ListenMode::Active, self.policy.restart_delay);
    }

    /// Schedule a new session after a recognition error
    pub fn retry(&mut self, mode: ListenMode, kind: RecognitionErrorKind) {
        let delay = self.policy.delay_after(kind);
        debug!(%mode, %kind, delay_ms = delay.as_millis() as u64, "retrying recognition");
        self.schedule(mode, delay);
    }

    /// Close any open session and void pending starts
    pub fn stop(&mut self) {
        self.generation += 1;
        self.teardown();
    }

    /// Open the session a ticket was issued for, unless it has been superseded
    pub fn fire(&mut self, ticket: RestartTicket) -> Option<SessionId> {
        if ticket.generation != self.generation {
            debug!(mode = %ticket.mode, "dropping superseded listener restart");
            return None;
        }

        self.teardown();

        let session = self.next_session;
        self.next_session += 1;
        self.open = Some(session);

        info!(session, mode = %ticket.mode, language = %self.language, "recognition session started");
        self.backend.dispatch(SpeechCommand::StartRecognition {
            session,
            mode: ticket.mode,
            language: self.language,
            locale: self.language.locale_tag().to_string(),
            partial_results: ticket.mode == ListenMode::Passive,
        });

        Some(session)
    }

    /// Whether an event belongs to the currently open session
    pub fn accepts(&self, event: &ListenerEvent) -> bool {
        self.open == Some(event.session())
    }

    /// Record that the platform closed the open session by itself
    pub fn session_ended(&mut self) {
        self.open = None;
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// The currently open session, if any
    pub fn session(&self) -> Option<SessionId> {
        self.open
    }

    fn schedule(&mut self, mode: ListenMode, delay: Duration) {
        self.generation += 1;
        self.teardown();

        let ticket = RestartTicket {
            generation: self.generation,
            mode,
        };

        if delay.is_zero() {
            let _ = self.restart_tx.send(ticket);
            return;
        }

        let tx = self.restart_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ticket);
        });
    }

    fn teardown(&mut self) {
        if let Some(session) = self.open.take() {
            debug!(session, "recognition session stopped");
            self.backend.dispatch(SpeechCommand::StopRecognition { session });
        }
    }
}
