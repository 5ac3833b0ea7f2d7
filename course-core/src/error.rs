//! Error taxonomy for a pipeline run.
//!
//! Every stage reports a `PipelineError`. The assembler decides, per level,
//! whether an error is isolated (page, chapter, module) or fatal to the run.

use crate::checkpoint::CheckpointError;
use crate::extract::ExtractionError;
use crate::generation::RemoteError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The fixed set of stages in a run, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    CoursePlan,
    PagePlan,
    PageContent,
    ModuleSummary,
    ModuleQuiz,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::CoursePlan => "course_plan",
            StageKind::PagePlan => "page_plan",
            StageKind::PageContent => "page_content",
            StageKind::ModuleSummary => "module_summary",
            StageKind::ModuleQuiz => "module_quiz",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a pipeline run or any of its stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("remote generation failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("could not extract structured output: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("negotiation produced a malformed outline: {reason}")]
    MalformedOutline { reason: String },

    #[error("{stage} exhausted {attempts} attempts: {last}")]
    ResourceExhausted {
        stage: StageKind,
        attempts: u32,
        last: Box<PipelineError>,
    },

    #[error("run aborted by operator")]
    Aborted,

    #[error("no content produced: every module failed")]
    NoContent,

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether a fresh attempt of the same stage may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Remote(e) => e.is_retryable(),
            PipelineError::Extraction(_) => true,
            _ => false,
        }
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Remote(_) => "remote_error",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::MalformedOutline { .. } => "malformed_outline",
            PipelineError::ResourceExhausted { .. } => "resource_exhausted",
            PipelineError::Aborted => "aborted",
            PipelineError::NoContent => "no_content",
            PipelineError::Checkpoint(_) => "checkpoint_error",
            PipelineError::Config(_) => "config_error",
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        PipelineError::MalformedOutline {
            reason: reason.into(),
        }
    }
}

impl From<claude::Error> for PipelineError {
    fn from(err: claude::Error) -> Self {
        PipelineError::Remote(RemoteError::from(err))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Checkpoint(CheckpointError::Io(err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Checkpoint(CheckpointError::Json(err))
    }
}

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let remote = PipelineError::Remote(RemoteError::Unavailable("down".into()));
        assert!(remote.is_retryable());

        let extraction = PipelineError::Extraction(ExtractionError::NotFound { expected: "json" });
        assert!(extraction.is_retryable());

        assert!(!PipelineError::malformed("no modules").is_retryable());
        assert!(!PipelineError::Aborted.is_retryable());
        assert!(!PipelineError::NoContent.is_retryable());
    }

    #[test]
    fn test_claude_error_becomes_remote() {
        let err: PipelineError = claude::Error::Network("connection reset".into()).into();
        assert!(matches!(err, PipelineError::Remote(_)));
        assert_eq!(err.kind(), "remote_error");
    }

    #[test]
    fn test_exhausted_display_names_stage() {
        let err = PipelineError::ResourceExhausted {
            stage: StageKind::PagePlan,
            attempts: 3,
            last: Box::new(PipelineError::Remote(RemoteError::Unavailable("503".into()))),
        };
        let text = err.to_string();
        assert!(text.starts_with("page_plan exhausted 3 attempts"));
        assert!(text.contains("503"));
    }
}
