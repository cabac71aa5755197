//! Answer engine contract

use std::time::Duration;

use async_trait::async_trait;

use crate::frame::Frame;

/// Errors from an answer engine call
///
/// The rendered message is shown to the user as-is.
#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("model returned no text")]
    EmptyResponse,

    #[error("could not prepare image: {0}")]
    Image(#[from] image::ImageError),

    #[error("image preparation was interrupted")]
    Interrupted,

    #[error("answer engine is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("no answer after {} seconds", .0.as_secs())]
    Timeout(Duration),
}

/// A multimodal request/response service that produces the assistant's reply
#[async_trait]
pub trait AnswerEngine: Send + Sync {
    /// Answer a transcript, optionally with a camera frame for context
    async fn ask(
        &self,
        transcript: &str,
        image: Option<&Frame>,
        system_prompt: &str,
    ) -> Result<String, AnswerError>;

    async fn ask_text_only(&self, transcript: &str, system_prompt: &str) -> Result<String, AnswerError> {
        self.ask(transcript, None, system_prompt).await
    }

    async fn ask_with_image(
        &self,
        transcript: &str,
        image: &Frame,
        system_prompt: &str,
    ) -> Result<String, AnswerError> {
        self.ask(transcript, Some(image), system_prompt).await
    }
}
