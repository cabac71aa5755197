//! Answer engine: the hosted model that replies to each turn

mod encode;
mod engine;
mod http;
mod prompts;

pub use engine::{AnswerEngine, AnswerError};
pub use http::HttpAnswerEngine;
pub use prompts::system_prompt;
