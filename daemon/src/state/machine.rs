//! Core state machine implementation
//!
//! Decides when to listen, when to ask the answer engine and when to listen
//! again. Every transition runs on the single task that owns the machine;
//! listener restarts and answer completions come back to it as messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::answer::{system_prompt, AnswerEngine, AnswerError};
use crate::events::StateEvent;
use crate::frame::FrameProvider;
use crate::intent::needs_image;
use crate::language::Language;
use crate::listener::{
    contains_wake_phrase, strip_wake_phrases, ListenMode, Listener, ListenerEvent, RestartTicket,
    RetryPolicy, SpeechBackend, SpeechCommand,
};

use super::snapshot::{SessionMode, Snapshot};
use super::turn::{ActivationSource, Turn, TurnId};

/// Commands from the UI
pub enum Command {
    /// Attach the frame source, pick a language, start watching for the wake phrase
    Initialize {
        frames: Arc<dyn FrameProvider>,
        language: Language,
    },
    StartListening,
    StopListening,
    /// Button press: capture a request without the wake phrase
    ActivateManually,
    /// Drop the current turn and go back to passive listening
    Dismiss,
    UpdateLanguage(Language),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Initialize { language, .. } => {
                f.debug_struct("Initialize").field("language", language).finish()
            }
            Command::StartListening => write!(f, "StartListening"),
            Command::StopListening => write!(f, "StopListening"),
            Command::ActivateManually => write!(f, "ActivateManually"),
            Command::Dismiss => write!(f, "Dismiss"),
            Command::UpdateLanguage(language) => write!(f, "UpdateLanguage({language})"),
        }
    }
}

/// Everything the machine reacts to from outside
#[derive(Debug)]
pub enum Input {
    Command(Command),
    /// Recognizer output
    Heard(ListenerEvent),
    /// The speech capability finished (or gave up on) an utterance
    SpeechDone { utterance: TurnId },
}

/// Result of an answer engine call, tagged with the turn that asked
#[derive(Debug)]
struct AnswerOutcome {
    turn: TurnId,
    result: Result<String, AnswerError>,
}

/// Current mode plus whatever data that mode owns
enum Phase {
    Idle,
    PassiveListening,
    ActiveListening {
        source: ActivationSource,
    },
    Processing {
        turn: Turn,
        task: AbortHandle,
        started: Instant,
    },
    Responding {
        turn: Turn,
        response: String,
    },
    /// The failed turn is gone; only what the UI shows is kept
    Error {
        transcript: String,
        with_image: bool,
        message: String,
    },
}

impl Phase {
    fn mode(&self) -> SessionMode {
        match self {
            Phase::Idle => SessionMode::Idle,
            Phase::PassiveListening => SessionMode::PassiveListening,
            Phase::ActiveListening { .. } => SessionMode::ActiveListening,
            Phase::Processing { .. } => SessionMode::Processing,
            Phase::Responding { .. } => SessionMode::Responding,
            Phase::Error { .. } => SessionMode::Error,
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mode = self.mode();
        match self {
            Phase::Idle | Phase::PassiveListening | Phase::ActiveListening { .. } => Snapshot {
                mode,
                ..Snapshot::default()
            },
            Phase::Processing { turn, .. } => Snapshot {
                mode,
                transcript: Some(turn.transcript().to_string()),
                sent_with_image: turn.has_frame(),
                ..Snapshot::default()
            },
            Phase::Responding { turn, response } => Snapshot {
                mode,
                transcript: Some(turn.transcript().to_string()),
                response: Some(response.clone()),
                sent_with_image: turn.has_frame(),
                error: None,
            },
            Phase::Error {
                transcript,
                with_image,
                message,
            } => Snapshot {
                mode,
                transcript: Some(transcript.clone()),
                response: None,
                sent_with_image: *with_image,
                error: Some(message.clone()),
            },
        }
    }
}

enum Step {
    Input(Input),
    Restart(RestartTicket),
    Answer(AnswerOutcome),
}

/// The turn-taking state machine
pub struct StateMachine {
    phase: Phase,
    /// Time when the current mode was entered
    phase_entered_at: Instant,
    language: Language,
    /// Set by `Initialize`; nothing listens before that
    frames: Option<Arc<dyn FrameProvider>>,
    listener: Listener,
    backend: Arc<dyn SpeechBackend>,
    engine: Arc<dyn AnswerEngine>,
    answer_timeout: Duration,
    next_turn: TurnId,
    restart_rx: mpsc::UnboundedReceiver<RestartTicket>,
    answer_tx: mpsc::UnboundedSender<AnswerOutcome>,
    answer_rx: mpsc::UnboundedReceiver<AnswerOutcome>,
    event_tx: broadcast::Sender<StateEvent>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl StateMachine {
    /// Create a new state machine in Idle
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        engine: Arc<dyn AnswerEngine>,
        policy: RetryPolicy,
        answer_timeout: Duration,
        event_tx: broadcast::Sender<StateEvent>,
        snapshot_tx: watch::Sender<Snapshot>,
    ) -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let (answer_tx, answer_rx) = mpsc::unbounded_channel();

        Self {
            phase: Phase::Idle,
            phase_entered_at: Instant::now(),
            language: Language::default(),
            frames: None,
            listener: Listener::new(Arc::clone(&backend), policy, restart_tx),
            backend,
            engine,
            answer_timeout,
            next_turn: 1,
            restart_rx,
            answer_tx,
            answer_rx,
            event_tx,
            snapshot_tx,
        }
    }

    /// Get the current mode
    pub fn mode(&self) -> SessionMode {
        self.phase.mode()
    }

    /// Run the state machine until the input channel closes
    pub async fn run(&mut self, mut input_rx: mpsc::Receiver<Input>) {
        info!("state machine started in Idle state");

        loop {
            let step = tokio::select! {
                input = input_rx.recv() => match input {
                    Some(input) => Step::Input(input),
                    None => break,
                },
                Some(ticket) = self.restart_rx.recv() => Step::Restart(ticket),
                Some(outcome) = self.answer_rx.recv() => Step::Answer(outcome),
            };

            match step {
                Step::Input(input) => self.handle_input(input),
                Step::Restart(ticket) => self.handle_restart(ticket),
                Step::Answer(outcome) => self.handle_answer(outcome),
            }
        }

        self.stop();
        info!("state machine stopped");
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command),
            Input::Heard(event) => self.handle_heard(event),
            Input::SpeechDone { utterance } => self.handle_speech_done(utterance),
        }
    }

    fn handle_command(&mut self, command: Command) {
        debug!(?command, "command received");

        match command {
            Command::Initialize { frames, language } => {
                self.frames = Some(frames);
                self.set_language(language);
                if matches!(self.phase, Phase::Idle) {
                    self.enter_passive();
                } else {
                    // A reconnecting bridge needs a fresh session in the new locale
                    self.reopen_listener();
                }
            }
            Command::StartListening => {
                if self.frames.is_none() {
                    warn!("start requested before initialize, ignoring");
                } else if matches!(self.phase, Phase::Idle) {
                    self.enter_passive();
                }
            }
            Command::StopListening => self.stop(),
            Command::ActivateManually => {
                if self.frames.is_none() {
                    warn!("activation requested before initialize, ignoring");
                } else {
                    self.activate(ActivationSource::ManuallyTriggered);
                }
            }
            Command::Dismiss => {
                if !matches!(self.phase, Phase::Idle) {
                    self.cancel_turn();
                    self.enter_passive();
                }
            }
            Command::UpdateLanguage(language) => {
                self.set_language(language);
                // Reopen so the recognizer picks up the new locale
                if self.listener.is_open() {
                    self.reopen_listener();
                }
            }
        }
    }

    fn handle_heard(&mut self, event: ListenerEvent) {
        if !self.listener.accepts(&event) {
            debug!(session = event.session(), "ignoring event from closed session");
            return;
        }
        if event.is_terminal() {
            self.listener.session_ended();
        }

        match event {
            ListenerEvent::PartialHeard { text, .. } => {
                if matches!(self.phase, Phase::PassiveListening) && contains_wake_phrase(&text) {
                    info!(%text, "wake phrase heard");
                    self.activate(ActivationSource::VoiceTriggered);
                } else {
                    trace!(%text, "partial hypothesis");
                }
            }
            ListenerEvent::FinalHeard { text, .. } => match self.phase {
                Phase::PassiveListening => {
                    if contains_wake_phrase(&text) {
                        info!(%text, "wake phrase heard");
                        self.activate(ActivationSource::VoiceTriggered);
                    } else {
                        self.listener.start_passive();
                    }
                }
                Phase::ActiveListening { source } => {
                    let request = strip_wake_phrases(&text);
                    if request.is_empty() {
                        debug!("empty request, listening again");
                        self.listener.start_active();
                    } else {
                        self.begin_turn(request, source);
                    }
                }
                _ => debug!(%text, "final hypothesis outside listening"),
            },
            ListenerEvent::RecognitionError { kind, .. } => {
                debug!(%kind, mode = %self.mode(), "recognition error");
                match self.phase {
                    Phase::PassiveListening => self.listener.retry(ListenMode::Passive, kind),
                    Phase::ActiveListening {
                        source: ActivationSource::VoiceTriggered,
                    } if kind.is_silence() => {
                        // Nothing followed the wake phrase
                        self.enter_passive();
                    }
                    Phase::ActiveListening { .. } => self.listener.retry(ListenMode::Active, kind),
                    _ => {}
                }
            }
        }
    }

    fn handle_restart(&mut self, ticket: RestartTicket) {
        if self.listener.fire(ticket).is_some() && matches!(self.phase, Phase::Error { .. }) {
            // The error has been on screen for one restart delay
            self.transition(Phase::PassiveListening);
        }
    }

    fn handle_answer(&mut self, outcome: AnswerOutcome) {
        let (turn, started) = match &self.phase {
            Phase::Processing { turn, started, .. } if turn.id() == outcome.turn => {
                (turn.clone(), *started)
            }
            _ => {
                debug!(turn = outcome.turn, "discarding stale answer");
                return;
            }
        };

        match outcome.result {
            Ok(response) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.emit(StateEvent::ResponseReady {
                    turn: turn.id(),
                    duration_ms,
                });
                self.backend.dispatch(SpeechCommand::Speak {
                    utterance: turn.id(),
                    text: response.clone(),
                    language: self.language,
                    locale: self.language.locale_tag().to_string(),
                });
                self.transition(Phase::Responding { turn, response });
            }
            Err(e) => {
                let message = e.to_string();
                warn!(turn = turn.id(), error = %message, "answer engine failed");
                self.emit(StateEvent::TurnFailed {
                    turn: turn.id(),
                    message: message.clone(),
                });
                self.transition(Phase::Error {
                    transcript: turn.transcript().to_string(),
                    with_image: turn.has_frame(),
                    message,
                });
                self.listener.start_passive();
            }
        }
    }

    fn handle_speech_done(&mut self, utterance: TurnId) {
        let source = match &self.phase {
            Phase::Responding { turn, .. } if turn.id() == utterance => turn.source(),
            _ => {
                debug!(utterance, "discarding stale speech completion");
                return;
            }
        };

        match source {
            ActivationSource::VoiceTriggered => self.enter_passive(),
            ActivationSource::ManuallyTriggered => {
                // Follow-up without the wake phrase
                self.emit(StateEvent::ListeningStarted { source });
                self.transition(Phase::ActiveListening { source });
                self.listener.start_active();
            }
        }
    }

    fn begin_turn(&mut self, transcript: String, source: ActivationSource) {
        self.listener.stop();

        let frame = if needs_image(&transcript) {
            self.frames.as_ref().and_then(|frames| frames.current_frame())
        } else {
            None
        };

        let id = self.next_turn;
        self.next_turn += 1;
        let turn = Turn::new(id, transcript, source, frame);

        info!(turn = id, transcript = turn.transcript(), with_image = turn.has_frame(), "turn started");
        self.emit(StateEvent::TurnStarted {
            turn: id,
            transcript: turn.transcript().to_string(),
            with_image: turn.has_frame(),
        });

        let task = self.spawn_answer(&turn);
        self.transition(Phase::Processing {
            turn,
            task,
            started: Instant::now(),
        });
    }

    fn spawn_answer(&self, turn: &Turn) -> AbortHandle {
        let engine = Arc::clone(&self.engine);
        let tx = self.answer_tx.clone();
        let timeout = self.answer_timeout;
        let language = self.language;
        let id = turn.id();
        let transcript = turn.transcript().to_string();
        let frame = turn.frame().cloned();

        let handle = tokio::spawn(async move {
            let prompt = system_prompt(language);
            let result =
                match tokio::time::timeout(timeout, engine.ask(&transcript, frame.as_ref(), &prompt)).await {
                    Ok(result) => result,
                    Err(_) => Err(AnswerError::Timeout(timeout)),
                };
            let _ = tx.send(AnswerOutcome { turn: id, result });
        });

        handle.abort_handle()
    }

    /// Start a new session for the current listening mode, if any
    fn reopen_listener(&mut self) {
        match self.phase {
            Phase::PassiveListening => self.listener.start_passive(),
            Phase::ActiveListening { .. } => self.listener.start_active(),
            _ => {}
        }
    }

    fn activate(&mut self, source: ActivationSource) {
        self.cancel_turn();
        self.emit(StateEvent::ListeningStarted { source });
        self.transition(Phase::ActiveListening { source });
        self.listener.start_active();
    }

    fn enter_passive(&mut self) {
        self.transition(Phase::PassiveListening);
        self.listener.start_passive();
    }

    fn stop(&mut self) {
        self.cancel_turn();
        self.listener.stop();
        self.transition(Phase::Idle);
    }

    /// Abandon an in-flight turn; a late answer is discarded by turn id
    fn cancel_turn(&mut self) {
        match &self.phase {
            Phase::Processing { turn, task, .. } => {
                task.abort();
                info!(turn = turn.id(), "turn cancelled while processing");
                self.emit(StateEvent::TurnCancelled { turn: turn.id() });
            }
            Phase::Responding { turn, .. } => {
                self.backend.dispatch(SpeechCommand::CancelSpeech);
                info!(turn = turn.id(), "turn cancelled while responding");
                self.emit(StateEvent::TurnCancelled { turn: turn.id() });
            }
            _ => {}
        }
    }

    fn set_language(&mut self, language: Language) {
        if language != self.language {
            info!(from = %self.language, to = %language, "language changed");
        }
        self.language = language;
        self.listener.set_language(language);
    }

    /// Replace the phase and publish the new snapshot
    fn transition(&mut self, next: Phase) {
        let from = self.phase.mode();
        let to = next.mode();
        self.phase = next;

        if from != to {
            let duration_ms = self.phase_entered_at.elapsed().as_millis() as u64;
            info!(from = %from, to = %to, duration_ms, "state transition");
            self.phase_entered_at = Instant::now();
            self.emit(StateEvent::ModeChanged {
                from,
                to,
                duration_ms,
            });
        }

        self.snapshot_tx.send_replace(self.phase.snapshot());
    }

    fn emit(&self, event: StateEvent) {
        debug!(%event, "emitting state event");
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::frame::{Frame, FrameStore};
    use crate::listener::testing::RecordingBackend;
    use crate::listener::RecognitionErrorKind;

    enum Behavior {
        Reply(&'static str),
        Fail(&'static str),
        Hang,
    }

    struct TestEngine {
        behavior: Behavior,
        calls: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl AnswerEngine for TestEngine {
        async fn ask(
            &self,
            transcript: &str,
            image: Option<&Frame>,
            _system_prompt: &str,
        ) -> Result<String, AnswerError> {
            self.calls
                .lock()
                .unwrap()
                .push((transcript.to_string(), image.is_some()));
            match self.behavior {
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::Fail(message) => Err(AnswerError::Api {
                    status: 500,
                    message: message.to_string(),
                }),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    struct Harness {
        sm: StateMachine,
        backend: Arc<RecordingBackend>,
        engine: Arc<TestEngine>,
        frames: FrameStore,
        events: broadcast::Receiver<StateEvent>,
        snapshots: watch::Receiver<Snapshot>,
    }

    impl Harness {
        fn new(behavior: Behavior) -> Self {
            Self::with_timeout(behavior, Duration::from_secs(5))
        }

        fn with_timeout(behavior: Behavior, answer_timeout: Duration) -> Self {
            let backend = Arc::new(RecordingBackend::default());
            let engine = Arc::new(TestEngine {
                behavior,
                calls: Mutex::new(Vec::new()),
            });
            let (event_tx, events) = broadcast::channel(64);
            let (snapshot_tx, snapshots) = watch::channel(Snapshot::default());
            let sm = StateMachine::new(
                backend.clone(),
                engine.clone(),
                RetryPolicy::immediate(),
                answer_timeout,
                event_tx,
                snapshot_tx,
            );
            Self {
                sm,
                backend,
                engine,
                frames: FrameStore::new(),
                events,
                snapshots,
            }
        }

        /// Initialize in English and open the first passive session
        fn initialized(behavior: Behavior) -> Self {
            let mut h = Self::new(behavior);
            h.command(Command::Initialize {
                frames: Arc::new(h.frames.clone()),
                language: Language::English,
            });
            h.pump_restarts();
            h.backend.take();
            h.drain_events();
            h
        }

        fn command(&mut self, command: Command) {
            self.sm.handle_input(Input::Command(command));
        }

        /// Deliver every due listener restart
        fn pump_restarts(&mut self) {
            while let Ok(ticket) = self.sm.restart_rx.try_recv() {
                self.sm.handle_restart(ticket);
            }
        }

        async fn pump_answer(&mut self) {
            let outcome = self.sm.answer_rx.recv().await.unwrap();
            self.sm.handle_answer(outcome);
        }

        fn session(&self) -> u64 {
            self.sm.listener.session().expect("no open session")
        }

        fn partial(&mut self, text: &str) {
            let session = self.session();
            self.sm.handle_input(Input::Heard(ListenerEvent::PartialHeard {
                session,
                text: text.to_string(),
            }));
        }

        fn final_(&mut self, text: &str) {
            let session = self.session();
            self.sm.handle_input(Input::Heard(ListenerEvent::FinalHeard {
                session,
                text: text.to_string(),
            }));
        }

        fn error(&mut self, kind: RecognitionErrorKind) {
            let session = self.session();
            self.sm
                .handle_input(Input::Heard(ListenerEvent::RecognitionError { session, kind }));
        }

        fn speech_done(&mut self, utterance: TurnId) {
            self.sm.handle_input(Input::SpeechDone { utterance });
        }

        fn snapshot(&self) -> Snapshot {
            self.snapshots.borrow().clone()
        }

        fn mode(&self) -> SessionMode {
            self.snapshot().mode
        }

        fn drain_events(&mut self) -> Vec<StateEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Wake with "hey nova" and open the active session
        fn wake(&mut self) {
            self.partial("hey nova");
            self.pump_restarts();
        }

        fn spoken_utterance(&self, commands: &[SpeechCommand]) -> TurnId {
            commands
                .iter()
                .find_map(|cmd| match cmd {
                    SpeechCommand::Speak { utterance, .. } => Some(*utterance),
                    _ => None,
                })
                .expect("nothing spoken")
        }
    }

    fn started_sessions(commands: &[SpeechCommand]) -> Vec<ListenMode> {
        commands
            .iter()
            .filter_map(|cmd| match cmd {
                SpeechCommand::StartRecognition { mode, .. } => Some(*mode),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_initial_state() {
        let h = Harness::new(Behavior::Hang);
        assert_eq!(h.sm.mode(), SessionMode::Idle);
        assert_eq!(h.snapshot(), Snapshot::default());
    }

    #[test]
    fn test_initialize_starts_passive() {
        let mut h = Harness::new(Behavior::Hang);
        h.command(Command::Initialize {
            frames: Arc::new(h.frames.clone()),
            language: Language::Spanish,
        });
        assert_eq!(h.mode(), SessionMode::PassiveListening);

        h.pump_restarts();
        let commands = h.backend.take();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0],
            SpeechCommand::StartRecognition {
                mode: ListenMode::Passive,
                language: Language::Spanish,
                partial_results: true,
                ..
            }
        ));
    }

    #[test]
    fn test_commands_before_initialize_are_ignored() {
        let mut h = Harness::new(Behavior::Hang);
        h.command(Command::StartListening);
        h.command(Command::ActivateManually);
        h.pump_restarts();
        assert_eq!(h.mode(), SessionMode::Idle);
        assert!(h.backend.take().is_empty());
    }

    #[tokio::test]
    async fn test_wake_then_visual_question_attaches_frame() {
        let mut h = Harness::initialized(Behavior::Reply("A red mug."));
        h.frames.submit(Frame::new(vec![1u8, 2, 3]));

        h.wake();
        assert_eq!(h.mode(), SessionMode::ActiveListening);
        let events = h.drain_events();
        let started = events
            .iter()
            .filter(|e| matches!(e, StateEvent::ListeningStarted { .. }))
            .count();
        assert_eq!(started, 1);

        // Passive session torn down before the active one opens
        let commands = h.backend.take();
        assert!(matches!(commands[0], SpeechCommand::StopRecognition { .. }));
        assert_eq!(started_sessions(&commands), vec![ListenMode::Active]);

        h.final_("hey nova what is this");
        let snapshot = h.snapshot();
        assert_eq!(snapshot.mode, SessionMode::Processing);
        assert_eq!(snapshot.transcript.as_deref(), Some("what is this"));
        assert!(snapshot.sent_with_image);

        h.pump_answer().await;
        assert_eq!(h.mode(), SessionMode::Responding);
        assert_eq!(h.snapshot().response.as_deref(), Some("A red mug."));
        assert_eq!(
            h.engine.calls.lock().unwrap().clone(),
            vec![("what is this".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_visual_question_without_frame_goes_text_only() {
        let mut h = Harness::initialized(Behavior::Reply("I can't see anything."));
        h.wake();
        h.final_("what do you see");

        let snapshot = h.snapshot();
        assert_eq!(snapshot.mode, SessionMode::Processing);
        assert!(!snapshot.sent_with_image);

        h.pump_answer().await;
        assert_eq!(
            h.engine.calls.lock().unwrap().clone(),
            vec![("what do you see".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_non_visual_question_skips_frame() {
        let mut h = Harness::initialized(Behavior::Reply("Noon."));
        h.frames.submit(Frame::new(vec![9u8]));
        h.wake();
        h.final_("what time is it");
        assert!(!h.snapshot().sent_with_image);
    }

    #[tokio::test]
    async fn test_voice_turn_returns_to_passive() {
        let mut h = Harness::initialized(Behavior::Reply("Noon."));
        h.wake();
        h.final_("what time is it");
        h.pump_answer().await;

        let commands = h.backend.take();
        let utterance = h.spoken_utterance(&commands);
        h.speech_done(utterance);

        assert_eq!(h.snapshot(), Snapshot {
            mode: SessionMode::PassiveListening,
            ..Snapshot::default()
        });
        h.pump_restarts();
        assert_eq!(started_sessions(&h.backend.take()), vec![ListenMode::Passive]);
    }

    #[tokio::test]
    async fn test_manual_turn_keeps_listening_active() {
        let mut h = Harness::initialized(Behavior::Reply("Noon."));
        h.command(Command::ActivateManually);
        h.pump_restarts();
        assert_eq!(h.mode(), SessionMode::ActiveListening);

        h.final_("what time is it");
        h.pump_answer().await;
        let utterance = h.spoken_utterance(&h.backend.take());
        h.drain_events();
        h.speech_done(utterance);

        let snapshot = h.snapshot();
        assert_eq!(snapshot.mode, SessionMode::ActiveListening);
        assert!(snapshot.response.is_none());
        assert!(snapshot.transcript.is_none());
        assert!(h.drain_events().contains(&StateEvent::ListeningStarted {
            source: ActivationSource::ManuallyTriggered
        }));

        h.pump_restarts();
        assert_eq!(started_sessions(&h.backend.take()), vec![ListenMode::Active]);

        // Follow-up needs no wake phrase
        h.final_("and tomorrow?");
        assert_eq!(h.mode(), SessionMode::Processing);
    }

    #[test]
    fn test_partial_ignored_outside_passive() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.command(Command::ActivateManually);
        h.pump_restarts();
        h.drain_events();
        h.backend.take();

        h.partial("hey nova");
        assert_eq!(h.mode(), SessionMode::ActiveListening);
        assert!(h.drain_events().is_empty());
        assert!(h.backend.take().is_empty());
    }

    #[test]
    fn test_passive_partial_without_wake_phrase_is_noop() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.partial("hello there");
        assert_eq!(h.mode(), SessionMode::PassiveListening);
        assert!(h.backend.take().is_empty());
    }

    #[test]
    fn test_passive_final_with_wake_phrase_activates() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.final_("Oye Nova");
        assert_eq!(h.mode(), SessionMode::ActiveListening);

        let mut h = Harness::initialized(Behavior::Hang);
        h.final_("just chatting");
        assert_eq!(h.mode(), SessionMode::PassiveListening);
        h.pump_restarts();
        assert_eq!(started_sessions(&h.backend.take()), vec![ListenMode::Passive]);
    }

    #[test]
    fn test_blank_request_reprompts() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.wake();
        h.backend.take();

        h.final_("hey nova");
        assert_eq!(h.mode(), SessionMode::ActiveListening);
        h.pump_restarts();
        assert_eq!(started_sessions(&h.backend.take()), vec![ListenMode::Active]);
    }

    #[tokio::test]
    async fn test_answer_failure_surfaces_error_then_recovers() {
        let mut h = Harness::initialized(Behavior::Fail("Overloaded"));
        h.wake();
        h.final_("what time is it");

        // Hold the restart back so the error state is observable
        h.pump_answer().await;
        let snapshot = h.snapshot();
        assert_eq!(snapshot.mode, SessionMode::Error);
        assert_eq!(snapshot.transcript.as_deref(), Some("what time is it"));
        assert_eq!(snapshot.error.as_deref(), Some("model returned 500: Overloaded"));

        h.pump_restarts();
        assert_eq!(h.snapshot(), Snapshot {
            mode: SessionMode::PassiveListening,
            ..Snapshot::default()
        });
    }

    #[tokio::test]
    async fn test_hung_answer_times_out() {
        let mut h = Harness::with_timeout(Behavior::Hang, Duration::from_millis(10));
        h.command(Command::Initialize {
            frames: Arc::new(h.frames.clone()),
            language: Language::English,
        });
        h.pump_restarts();
        h.wake();
        h.final_("what time is it");

        h.pump_answer().await;
        assert_eq!(h.mode(), SessionMode::Error);
        assert!(h.snapshot().error.unwrap().contains("no answer after"));
    }

    #[tokio::test]
    async fn test_dismiss_discards_late_completion() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.wake();
        h.final_("what is this");
        let turn = match &h.sm.phase {
            Phase::Processing { turn, .. } => turn.id(),
            _ => panic!("expected processing"),
        };
        h.drain_events();

        h.command(Command::Dismiss);
        assert_eq!(h.mode(), SessionMode::PassiveListening);
        assert!(h.drain_events().contains(&StateEvent::TurnCancelled { turn }));

        // A completion that slipped past the abort
        h.sm.answer_tx
            .send(AnswerOutcome {
                turn,
                result: Ok("too late".to_string()),
            })
            .unwrap();
        let before = h.snapshot();
        h.pump_answer().await;
        assert_eq!(h.snapshot(), before);
        assert!(!h.backend.take().iter().any(|c| matches!(c, SpeechCommand::Speak { .. })));
    }

    #[tokio::test]
    async fn test_stop_discards_late_completion() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.wake();
        h.final_("what is this");
        let turn = match &h.sm.phase {
            Phase::Processing { turn, .. } => turn.id(),
            _ => panic!("expected processing"),
        };

        h.command(Command::StopListening);
        assert_eq!(h.snapshot(), Snapshot::default());
        assert!(h.drain_events().contains(&StateEvent::TurnCancelled { turn }));
        h.backend.take();

        h.sm.answer_tx
            .send(AnswerOutcome {
                turn,
                result: Ok("too late".to_string()),
            })
            .unwrap();
        h.pump_answer().await;
        assert_eq!(h.snapshot(), Snapshot::default());
        assert!(h.backend.take().is_empty());
    }

    #[test]
    fn test_reinitialize_reopens_session_in_new_language() {
        let mut h = Harness::initialized(Behavior::Hang);
        let before = h.session();

        h.command(Command::Initialize {
            frames: Arc::new(h.frames.clone()),
            language: Language::Spanish,
        });
        h.pump_restarts();

        assert_eq!(h.mode(), SessionMode::PassiveListening);
        assert_ne!(h.session(), before);
        let commands = h.backend.take();
        assert!(commands.contains(&SpeechCommand::StopRecognition { session: before }));
        assert!(commands.iter().any(|cmd| matches!(
            cmd,
            SpeechCommand::StartRecognition {
                mode: ListenMode::Passive,
                language: Language::Spanish,
                locale,
                ..
            } if locale == "es-ES"
        )));
    }

    #[tokio::test]
    async fn test_dismiss_while_responding_cancels_speech() {
        let mut h = Harness::initialized(Behavior::Reply("Noon."));
        h.wake();
        h.final_("what time is it");
        h.pump_answer().await;
        let utterance = h.spoken_utterance(&h.backend.take());

        h.command(Command::Dismiss);
        assert!(h.backend.take().contains(&SpeechCommand::CancelSpeech));
        assert_eq!(h.mode(), SessionMode::PassiveListening);

        // The cancelled utterance reports done afterwards
        h.speech_done(utterance);
        assert_eq!(h.mode(), SessionMode::PassiveListening);
    }

    #[test]
    fn test_dismiss_in_idle_is_noop() {
        let mut h = Harness::new(Behavior::Hang);
        h.command(Command::Dismiss);
        assert_eq!(h.mode(), SessionMode::Idle);
    }

    #[test]
    fn test_busy_errors_keep_retrying() {
        let mut h = Harness::initialized(Behavior::Hang);
        for _ in 0..5 {
            h.error(RecognitionErrorKind::Busy);
            h.pump_restarts();
            assert_eq!(h.mode(), SessionMode::PassiveListening);
            assert_eq!(started_sessions(&h.backend.take()), vec![ListenMode::Passive]);
        }
    }

    #[test]
    fn test_silence_after_wake_returns_to_passive() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.wake();
        h.error(RecognitionErrorKind::NoSpeech);
        assert_eq!(h.mode(), SessionMode::PassiveListening);
    }

    #[test]
    fn test_silence_after_manual_activation_keeps_listening() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.command(Command::ActivateManually);
        h.pump_restarts();
        h.backend.take();

        h.error(RecognitionErrorKind::Timeout);
        assert_eq!(h.mode(), SessionMode::ActiveListening);
        h.pump_restarts();
        assert_eq!(started_sessions(&h.backend.take()), vec![ListenMode::Active]);
    }

    #[test]
    fn test_events_from_closed_session_ignored() {
        let mut h = Harness::initialized(Behavior::Hang);
        let old = h.session();
        h.wake();

        h.sm.handle_input(Input::Heard(ListenerEvent::FinalHeard {
            session: old,
            text: "what time is it".to_string(),
        }));
        assert_eq!(h.mode(), SessionMode::ActiveListening);
    }

    #[tokio::test]
    async fn test_stop_goes_idle_and_closes_session() {
        let mut h = Harness::initialized(Behavior::Hang);
        let session = h.session();

        h.command(Command::StopListening);
        assert_eq!(h.snapshot(), Snapshot::default());
        assert_eq!(h.backend.take(), vec![SpeechCommand::StopRecognition { session }]);

        h.command(Command::StartListening);
        assert_eq!(h.mode(), SessionMode::PassiveListening);
    }

    #[test]
    fn test_update_language_reopens_session() {
        let mut h = Harness::initialized(Behavior::Hang);
        h.command(Command::UpdateLanguage(Language::Spanish));
        h.pump_restarts();

        let commands = h.backend.take();
        assert!(matches!(commands[0], SpeechCommand::StopRecognition { .. }));
        assert!(matches!(
            commands[1],
            SpeechCommand::StartRecognition {
                mode: ListenMode::Passive,
                language: Language::Spanish,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_mode_changes_are_announced() {
        let mut h = Harness::initialized(Behavior::Reply("ok"));
        h.wake();
        h.final_("what time is it");
        h.pump_answer().await;

        let modes: Vec<SessionMode> = h
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                StateEvent::ModeChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            modes,
            vec![
                SessionMode::ActiveListening,
                SessionMode::Processing,
                SessionMode::Responding
            ]
        );
    }
}
