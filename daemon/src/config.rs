//! Configuration loading and management
//!
//! Defaults, overlaid by an optional `config.toml` in the data directory,
//! overlaid by environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::language::Language;
use crate::listener::RetryPolicy;

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Language used until a client selects another
    pub language: Language,

    /// Recognition restart timing
    pub listener: RetryPolicy,

    /// Answer engine settings
    pub answer: AnswerConfig,
}

/// Settings for the hosted answer engine
#[derive(Clone)]
pub struct AnswerConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound on a single answer; the turn fails once it elapses
    pub timeout: Duration,
    pub max_image_width: u32,
    pub jpeg_quality: u8,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            max_tokens: 300,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
            max_image_width: 512,
            jpeg_quality: 60,
        }
    }
}

impl std::fmt::Debug for AnswerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .field("max_image_width", &self.max_image_width)
            .field("jpeg_quality", &self.jpeg_quality)
            .finish()
    }
}

/// `config.toml` schema; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    socket_path: Option<PathBuf>,
    language: Option<String>,
    #[serde(default)]
    listener: ListenerFile,
    #[serde(default)]
    answer: AnswerFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListenerFile {
    restart_delay_ms: Option<u64>,
    busy_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnswerFile {
    endpoint: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    max_image_width: Option<u32>,
    jpeg_quality: Option<u8>,
}

impl Config {
    /// Load configuration from defaults, the config file and the environment
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("nova");

        let file = read_file(&data_dir.join("config.toml"))?;
        Self::resolve(data_dir, file, |key| std::env::var(key).ok())
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    fn resolve(
        data_dir: PathBuf,
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let socket_path = file
            .socket_path
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let language = match env("NOVA_LANGUAGE").or(file.language) {
            Some(code) => code.parse().context("invalid language")?,
            None => Language::default(),
        };

        let defaults = RetryPolicy::default();
        let listener = RetryPolicy {
            restart_delay: file
                .listener
                .restart_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.restart_delay),
            busy_backoff: file
                .listener
                .busy_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_backoff),
        };

        let defaults = AnswerConfig::default();
        let answer = AnswerConfig {
            endpoint: env("NOVA_ANSWER_ENDPOINT")
                .or(file.answer.endpoint)
                .unwrap_or(defaults.endpoint),
            model: env("NOVA_MODEL")
                .or(file.answer.model)
                .unwrap_or(defaults.model),
            api_key: env("ANTHROPIC_API_KEY")
                .or(file.answer.api_key)
                .filter(|key| !key.trim().is_empty()),
            max_tokens: file.answer.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: file.answer.temperature.unwrap_or(defaults.temperature),
            timeout: file
                .answer
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_image_width: file.answer.max_image_width.unwrap_or(defaults.max_image_width),
            jpeg_quality: file.answer.jpeg_quality.unwrap_or(defaults.jpeg_quality),
        };

        Ok(Self {
            socket_path,
            data_dir,
            language,
            listener,
            answer,
        })
    }
}

fn read_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_file(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn parse_file(raw: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(raw)?)
}
