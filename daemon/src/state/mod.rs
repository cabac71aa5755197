//! Turn-taking state machine
//!
//! Provides an explicit state machine with six modes:
//! - Idle: nothing is listening
//! - PassiveListening: watching for the wake phrase
//! - ActiveListening: capturing the user's request
//! - Processing: waiting for the answer engine
//! - Responding: speaking the answer
//! - Error: showing an answer engine failure before listening again

mod handle;
mod machine;
mod snapshot;
mod turn;

pub use handle::{Controller, ControllerClosed};
pub use machine::{Input, StateMachine};
pub use snapshot::{SessionMode, Snapshot};
pub use turn::{ActivationSource, TurnId};
