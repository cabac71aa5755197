//! Answer engine backed by the Anthropic Messages API

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnswerConfig;
use crate::frame::Frame;

use super::engine::{AnswerEngine, AnswerError};
use super::encode::prepare_image;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Image { source: ImageSource },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Sends each turn to a hosted multimodal model
pub struct HttpAnswerEngine {
    client: reqwest::Client,
    config: AnswerConfig,
}

impl HttpAnswerEngine {
    pub fn new(config: AnswerConfig) -> Result<Self, AnswerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    fn build_request<'a>(
        &'a self,
        transcript: &'a str,
        jpeg: Option<Vec<u8>>,
        system_prompt: &'a str,
    ) -> MessagesRequest<'a> {
        let mut content = Vec::with_capacity(2);
        if let Some(jpeg) = jpeg {
            content.push(ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: "image/jpeg",
                    data: BASE64_STANDARD.encode(jpeg),
                },
            });
        }
        content.push(ContentBlock::Text { text: transcript });

        MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system: system_prompt,
            messages: vec![Message {
                role: "user",
                content,
            }],
        }
    }

    async fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>, AnswerError> {
        let frame = frame.clone();
        let max_width = self.config.max_image_width;
        let quality = self.config.jpeg_quality;

        let jpeg = tokio::task::spawn_blocking(move || prepare_image(frame.bytes(), max_width, quality))
            .await
            .map_err(|_| AnswerError::Interrupted)??;

        debug!(bytes = jpeg.len(), "frame prepared for upload");
        Ok(jpeg)
    }
}

#[async_trait]
impl AnswerEngine for HttpAnswerEngine {
    async fn ask(
        &self,
        transcript: &str,
        image: Option<&Frame>,
        system_prompt: &str,
    ) -> Result<String, AnswerError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(AnswerError::NotConfigured("ANTHROPIC_API_KEY is not set"))?;

        let started = Instant::now();
        let jpeg = match image {
            Some(frame) => Some(self.encode_frame(frame).await?),
            None => None,
        };
        let with_image = jpeg.is_some();
        let request = self.build_request(transcript, jpeg, system_prompt);

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = first_text(parsed)?;

        info!(
            with_image,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.len(),
            "answer received"
        );
        Ok(text)
    }
}

fn first_text(response: MessagesResponse) -> Result<String, AnswerError> {
    response
        .content
        .into_iter()
        .find_map(|block| match block {
            ResponseBlock::Text { text } if !text.trim().is_empty() => Some(text),
            _ => None,
        })
        .ok_or(AnswerError::EmptyResponse)
}

fn api_error(status: u16, body: &str) -> AnswerError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    AnswerError::Api { status, message }
}
