//! nova-daemon: turn-taking voice assistant for smart glasses
//!
//! This daemon owns the conversation state and provides:
//! - Wake phrase detection over streamed speech recognition results
//! - Explicit state machine for the listen, think, speak cycle
//! - Multimodal answers from a hosted model, with the camera frame when asked
//! - IPC server for the glasses UI and the platform speech/camera bridge
//!
//! Recognition, text-to-speech and the camera live on the device; the daemon
//! drives them through IPC notifications and receives their results back as
//! requests.

mod answer;
mod config;
mod events;
mod frame;
mod intent;
mod ipc;
mod language;
mod lifecycle;
mod listener;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::answer::HttpAnswerEngine;
use crate::config::Config;
use crate::events::StateEvent;
use crate::frame::FrameStore;
use crate::ipc::{Endpoints, Server};
use crate::lifecycle::ShutdownSignal;
use crate::listener::{BroadcastBackend, SpeechCommand};
use crate::state::{Controller, SessionMode, Snapshot, StateMachine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "nova-daemon starting");

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, language = %config.language, "configuration loaded");

    if config.answer.api_key.is_none() {
        warn!("no API key configured, every turn will fail until ANTHROPIC_API_KEY is set");
    }

    let mut shutdown = ShutdownSignal::new()?;

    // State machine -> IPC subscribers
    let (event_tx, _) = broadcast::channel::<StateEvent>(64);
    let (speech_tx, _) = broadcast::channel::<SpeechCommand>(64);
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
    // IPC -> state machine
    let (input_tx, input_rx) = mpsc::channel(64);

    let backend = Arc::new(BroadcastBackend::new(speech_tx.clone()));
    let engine = Arc::new(HttpAnswerEngine::new(config.answer.clone())?);
    let frames = FrameStore::new();

    let mut state_machine = StateMachine::new(
        backend,
        engine,
        config.listener,
        config.answer.timeout,
        event_tx.clone(),
        snapshot_tx,
    );
    let machine_task = tokio::spawn(async move { state_machine.run(input_rx).await });

    let controller = Controller::new(input_tx, snapshot_rx);

    let server = Server::new(
        &config.socket_path,
        Endpoints {
            controller: controller.clone(),
            frames,
            events: event_tx,
            speech: speech_tx,
            language: config.language,
        },
    )?;

    info!("daemon initialized, waiting for clients");

    tokio::select! {
        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    if controller.stop_listening().await.is_ok() {
        let mut snapshots = controller.watch();
        let stopped = tokio::time::timeout(
            Duration::from_secs(1),
            snapshots.wait_for(|snapshot| snapshot.mode == SessionMode::Idle),
        )
        .await;
        if !matches!(stopped, Ok(Ok(_))) {
            warn!("state machine did not reach Idle before exit");
        }
    }

    server.shutdown().await;
    machine_task.abort();

    info!("nova-daemon stopped");

    Ok(())
}
