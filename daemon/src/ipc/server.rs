//! Unix domain socket server for IPC
//!
//! Provides request-response communication and, for subscribed clients, push
//! notifications of snapshots, state events and speech commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::StateEvent;
use crate::frame::{Frame, FrameProvider, FrameStore};
use crate::language::Language;
use crate::listener::SpeechCommand;
use crate::state::{Controller, ControllerClosed, Snapshot};

use super::protocol::{DaemonStatus, Notification, Request, Response, MAX_MESSAGE_BYTES};

/// What the server needs from the rest of the daemon
pub struct Endpoints {
    pub controller: Controller,
    pub frames: FrameStore,
    pub events: broadcast::Sender<StateEvent>,
    pub speech: broadcast::Sender<SpeechCommand>,
    pub language: Language,
}

/// Receivers feeding one subscribed client
struct Feeds {
    snapshots: watch::Receiver<Snapshot>,
    events: broadcast::Receiver<StateEvent>,
    speech: broadcast::Receiver<SpeechCommand>,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Shared server state
struct Shared {
    controller: Controller,
    frames: FrameStore,
    events: broadcast::Sender<StateEvent>,
    speech: broadcast::Sender<SpeechCommand>,
    /// Last language requested by a client
    language: RwLock<Language>,
    start_time: Instant,
}

impl Server {
    /// Create a new IPC server
    pub fn new(socket_path: &Path, endpoints: Endpoints) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            controller: endpoints.controller,
            frames: endpoints.frames,
            events: endpoints.events,
            speech: endpoints.speech,
            language: RwLock::new(endpoints.language),
            start_time: Instant::now(),
        });

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            shared,
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
        let (mut reader, writer) = stream.into_split();

        // Responses and notifications share one ordered writer
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer_task = tokio::spawn(Self::write_loop(writer, out_rx));
        let mut forwarder = None;

        let result = async {
            while let Some(body) = Self::read_message(&mut reader).await? {
                let response = match serde_json::from_slice::<Request>(&body) {
                    Ok(request) => {
                        debug!(?request, "received request");
                        let subscribe = matches!(request, Request::Subscribe);
                        let response = Self::process_request(request, &shared).await;

                        if subscribe && forwarder.is_none() {
                            debug!("client subscribed to notifications");
                            // Subscribe before acknowledging so nothing published afterwards is missed
                            let feeds = Feeds {
                                snapshots: shared.controller.watch(),
                                events: shared.events.subscribe(),
                                speech: shared.speech.subscribe(),
                            };
                            forwarder = Some(tokio::spawn(Self::forward_notifications(
                                feeds,
                                out_tx.clone(),
                            )));
                        }
                        response
                    }
                    Err(e) => {
                        warn!(?e, "malformed request");
                        Response::error("bad_request", e.to_string())
                    }
                };

                if out_tx.send(encode(&response)?).await.is_err() {
                    break;
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        drop(out_tx);
        let _ = writer_task.await;

        debug!("client disconnected");
        result
    }

    /// Read one length-prefixed message; `None` on clean disconnect
    async fn read_message(reader: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_BYTES {
            warn!(len, "message too large, disconnecting");
            return Ok(None);
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    async fn write_loop(mut writer: OwnedWriteHalf, mut out_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(?e, "client write failed");
                break;
            }
        }
    }

    /// Push snapshots, state events and speech commands until the client leaves
    async fn forward_notifications(feeds: Feeds, out_tx: mpsc::Sender<Vec<u8>>) {
        let Feeds {
            mut snapshots,
            mut events,
            mut speech,
        } = feeds;

        let mut next = Some(Notification::Snapshot(snapshots.borrow_and_update().clone()));

        loop {
            if let Some(notification) = next.take() {
                let frame = match encode(&notification) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(?e, "failed to encode notification");
                        continue;
                    }
                };
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }

            next = tokio::select! {
                changed = snapshots.changed() => match changed {
                    Ok(()) => Some(Notification::Snapshot(snapshots.borrow_and_update().clone())),
                    Err(_) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => Some(Notification::StateEvent(event)),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "state event subscriber lagged");
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
                command = speech.recv() => match command {
                    Ok(command) => Some(Notification::Speech(command)),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "speech subscriber lagged");
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
            };
        }
    }

    /// Process a request and return a response
    async fn process_request(request: Request, shared: &Shared) -> Response {
        let result = match request {
            Request::Ping => return Response::Pong,

            Request::Subscribe => return Response::Subscribed,

            Request::GetStatus => {
                return Response::Status(DaemonStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    snapshot: shared.controller.snapshot(),
                    language: *shared.language.read().await,
                    frame_available: shared.frames.current_frame().is_some(),
                    uptime_secs: shared.start_time.elapsed().as_secs(),
                });
            }

            Request::Initialize { language } => {
                let language = match language {
                    Some(language) => {
                        *shared.language.write().await = language;
                        language
                    }
                    None => *shared.language.read().await,
                };
                info!(%language, "initialize requested");
                shared
                    .controller
                    .initialize(Arc::new(shared.frames.clone()), language)
                    .await
            }

            Request::StartListening => shared.controller.start_listening().await,
            Request::StopListening => shared.controller.stop_listening().await,
            Request::ActivateManually => shared.controller.activate_manually().await,
            Request::Dismiss => shared.controller.dismiss().await,

            Request::UpdateLanguage { language } => {
                *shared.language.write().await = language;
                shared.controller.update_language(language).await
            }

            Request::Recognition { event } => shared.controller.heard(event).await,
            Request::SpeechDone { utterance } => shared.controller.speech_done(utterance).await,

            Request::SubmitFrame { image_base64 } => match BASE64_STANDARD.decode(image_base64) {
                Ok(bytes) if !bytes.is_empty() => {
                    shared.frames.submit(Frame::new(bytes));
                    Ok(())
                }
                Ok(_) => return Response::error("bad_frame", "empty frame"),
                Err(e) => return Response::error("bad_frame", e.to_string()),
            },

            Request::ClearFrame => {
                shared.frames.clear();
                Ok(())
            }
        };

        match result {
            Ok(()) => Response::Ack,
            Err(ControllerClosed) => Response::error("unavailable", ControllerClosed.to_string()),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Length-prefixed JSON encoding
fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}
