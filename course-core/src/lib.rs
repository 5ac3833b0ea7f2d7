//! Checkpointed course generation driven by Claude.
//!
//! This crate provides:
//! - A planner/reviewer negotiation that turns an interview transcript into
//!   an approved course outline
//! - Per-chapter page planning, per-page content, per-module summary and quiz
//!   stages, each checkpointed and retried
//! - Bounded fan-out over modules, chapters and pages with failure isolation
//! - Resumable runs: re-running a run id reuses every stored checkpoint
//!
//! # Quick Start
//!
//! ```ignore
//! use course_core::{
//!     ClaudeGenerator, CourseAssembler, FileCheckpointStore, FileCourseSink,
//!     PipelineConfig, RunProgress, Transcript,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let generator = ClaudeGenerator::new(claude::Claude::from_env()?);
//!     let assembler = CourseAssembler::new(
//!         Arc::new(generator),
//!         Arc::new(FileCheckpointStore::new(&config.runs_dir)),
//!         Arc::new(FileCourseSink::new(&config.runs_dir)),
//!         config,
//!     );
//!
//!     let transcript = Transcript::load("interview.json").await?;
//!     let outcome = assembler
//!         .run("run-1", &transcript, &CancellationToken::new(), &RunProgress::new())
//!         .await?;
//!     println!("course written to {}", outcome.course_path.display());
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod generation;
pub mod limiter;
pub mod model;
pub mod negotiation;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod stages;
pub mod testing;
pub mod transcript;

// Primary public API
pub use assembler::{CourseAssembler, RunOutcome};
pub use checkpoint::{
    CheckpointError, CheckpointStore, Checkpoints, CourseSink, FileCheckpointStore,
    FileCourseSink, StageKey,
};
pub use config::{ConfigError, PipelineConfig, StageRetry};
pub use error::{PipelineError, PipelineResult, StageKind};
pub use extract::ExtractionError;
pub use generation::{ClaudeGenerator, Generator, RemoteError};
pub use limiter::ConcurrencyLimiter;
pub use model::{
    Chapter, ChapterOutline, Course, Module, ModuleOutline, Outline, Page, PagePlan, PlannedPage,
    QuizItem, RunFailureReport,
};
pub use negotiation::{Negotiation, NegotiationOutcome, NegotiationState, APPROVAL_TOKEN};
pub use progress::{ProgressSnapshot, RunProgress, RunStatus, UnitCounts};
pub use prompts::AgentRole;
pub use retry::RetryPolicy;
pub use testing::{MemoryCheckpointStore, MemoryCourseSink, PipelineHarness, ScriptedGenerator};
pub use transcript::{Transcript, TranscriptEntry, TranscriptError};
