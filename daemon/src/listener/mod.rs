//! Speech recognition listener
//!
//! Wraps the external, single-shot recognition capability: normalized events
//! in, session start/stop commands out, with a restart policy that absorbs
//! platform flakiness.

mod adapter;
mod backend;
mod wake;

pub use adapter::{Listener, ListenerEvent, RecognitionErrorKind, RestartTicket, RetryPolicy};
pub use backend::{BroadcastBackend, ListenMode, SpeechBackend, SpeechCommand};
pub use wake::{contains_wake_phrase, strip_wake_phrases};

#[cfg(test)]
pub(crate) use adapter::testing;
