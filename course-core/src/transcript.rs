//! The interview transcript that seeds a run.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("could not read transcript: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcript is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transcript has no entries")]
    Empty,
}

/// One turn of the interview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(alias = "source")]
    pub role: String,

    #[serde(alias = "content")]
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// An ordered, read-only interview transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(alias = "conversation")]
    pub entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new(entries: Vec<TranscriptEntry>) -> Result<Self, TranscriptError> {
        if entries.is_empty() {
            return Err(TranscriptError::Empty);
        }
        Ok(Self { entries })
    }

    /// Parse a transcript document.
    ///
    /// Accepts `{"conversation": [{"source", "content"}]}` as written by the
    /// interview service, or a bare array of entries.
    pub fn from_json(json: &str) -> Result<Self, TranscriptError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Document {
            Wrapped(Transcript),
            Bare(Vec<TranscriptEntry>),
        }

        let entries = match serde_json::from_str::<Document>(json) {
            Ok(Document::Wrapped(t)) => t.entries,
            Ok(Document::Bare(entries)) => entries,
            // Re-parse strictly for a useful error message.
            Err(_) => serde_json::from_str::<Transcript>(json)?.entries,
        };
        Self::new(entries)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TranscriptError> {
        let json = fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }

    /// `role: text` lines, in order.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.role, e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
