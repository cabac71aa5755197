//! Assistant language selection

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Language the assistant listens, speaks and answers in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "es")]
    Spanish,
}

impl Default for Language {
    fn default() -> Self {
        Self::Spanish
    }
}

impl Language {
    /// ISO 639-1 code
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }

    /// BCP 47 tag handed to the recognizer and the speech synthesizer
    pub fn locale_tag(&self) -> &'static str {
        match self {
            Language::English => "en-US",
            Language::Spanish => "es-ES",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" | "en-us" | "english" => Ok(Language::English),
            "es" | "es-es" | "spanish" | "español" | "espanol" => Ok(Language::Spanish),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}
