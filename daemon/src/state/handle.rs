//! Command interface to the running state machine

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::frame::FrameProvider;
use crate::language::Language;
use crate::listener::ListenerEvent;

use super::machine::{Command, Input};
use super::snapshot::Snapshot;
use super::turn::TurnId;

#[derive(Debug, thiserror::Error)]
#[error("state machine is no longer running")]
pub struct ControllerClosed;

/// Cloneable handle for sending commands and reading the snapshot
#[derive(Clone)]
pub struct Controller {
    tx: mpsc::Sender<Input>,
    snapshot: watch::Receiver<Snapshot>,
}

impl Controller {
    pub fn new(tx: mpsc::Sender<Input>, snapshot: watch::Receiver<Snapshot>) -> Self {
        Self { tx, snapshot }
    }

    pub async fn initialize(
        &self,
        frames: Arc<dyn FrameProvider>,
        language: Language,
    ) -> Result<(), ControllerClosed> {
        self.command(Command::Initialize { frames, language }).await
    }

    pub async fn start_listening(&self) -> Result<(), ControllerClosed> {
        self.command(Command::StartListening).await
    }

    pub async fn stop_listening(&self) -> Result<(), ControllerClosed> {
        self.command(Command::StopListening).await
    }

    pub async fn activate_manually(&self) -> Result<(), ControllerClosed> {
        self.command(Command::ActivateManually).await
    }

    pub async fn dismiss(&self) -> Result<(), ControllerClosed> {
        self.command(Command::Dismiss).await
    }

    pub async fn update_language(&self, language: Language) -> Result<(), ControllerClosed> {
        self.command(Command::UpdateLanguage(language)).await
    }

    /// Forward a recognizer event
    pub async fn heard(&self, event: ListenerEvent) -> Result<(), ControllerClosed> {
        self.send(Input::Heard(event)).await
    }

    /// Report that an utterance finished playing
    pub async fn speech_done(&self, utterance: TurnId) -> Result<(), ControllerClosed> {
        self.send(Input::SpeechDone { utterance }).await
    }

    /// The latest snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that wakes on every snapshot change
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    async fn command(&self, command: Command) -> Result<(), ControllerClosed> {
        self.send(Input::Command(command)).await
    }

    async fn send(&self, input: Input) -> Result<(), ControllerClosed> {
        self.tx.send(input).await.map_err(|_| ControllerClosed)
    }
}
