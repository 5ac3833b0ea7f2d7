//! Read-only progress reporting for a run.

use crate::error::{PipelineError, StageKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Started,
    InProgress,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

/// The unit levels counted during fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Module,
    Chapter,
    Page,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub attempted: usize,
    pub succeeded: usize,
}

/// A point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: RunStatus,
    pub stage: Option<StageKind>,
    pub modules: UnitCounts,
    pub chapters: UnitCounts,
    pub pages: UnitCounts,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counter {
    attempted: AtomicUsize,
    succeeded: AtomicUsize,
}

impl Counter {
    fn load(&self) -> UnitCounts {
        UnitCounts {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.attempted.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct State {
    status: RunStatus,
    stage: Option<StageKind>,
    last_error: Option<String>,
}

#[derive(Debug)]
struct Inner {
    modules: Counter,
    chapters: Counter,
    pages: Counter,
    state: Mutex<State>,
}

/// Shared progress handle. Clone it to poll from elsewhere.
#[derive(Debug, Clone)]
pub struct RunProgress {
    inner: Arc<Inner>,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                modules: Counter::default(),
                chapters: Counter::default(),
                pages: Counter::default(),
                state: Mutex::new(State {
                    status: RunStatus::NotStarted,
                    stage: None,
                    last_error: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic elsewhere does not invalidate plain status fields.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counter(&self, unit: Unit) -> &Counter {
        match unit {
            Unit::Module => &self.inner.modules,
            Unit::Chapter => &self.inner.chapters,
            Unit::Page => &self.inner.pages,
        }
    }

    /// Begin a run. Counters from any earlier run on this handle are cleared.
    pub fn start(&self) {
        let mut state = self.state();
        self.inner.modules.reset();
        self.inner.chapters.reset();
        self.inner.pages.reset();
        state.status = RunStatus::Started;
        state.stage = None;
        state.last_error = None;
    }

    /// Record that work has reached `stage`.
    pub fn enter(&self, stage: StageKind) {
        let mut state = self.state();
        if state.status == RunStatus::Started && stage != StageKind::CoursePlan {
            state.status = RunStatus::InProgress;
        }
        if !state.status.is_terminal() {
            state.stage = Some(stage);
        }
    }

    pub fn attempt(&self, unit: Unit) {
        self.counter(unit).attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn succeed(&self, unit: Unit) {
        self.counter(unit).succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn complete(&self) {
        let mut state = self.state();
        state.status = RunStatus::Completed;
        state.stage = None;
    }

    pub fn fail(&self, err: &PipelineError) {
        let mut state = self.state();
        state.status = RunStatus::Error;
        state.last_error = Some(err.to_string());
    }

    pub fn status(&self) -> RunStatus {
        self.state().status
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state();
        ProgressSnapshot {
            status: state.status,
            stage: state.stage,
            modules: self.inner.modules.load(),
            chapters: self.inner.chapters.load(),
            pages: self.inner.pages.load(),
            last_error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let progress = RunProgress::new();
        assert_eq!(progress.status(), RunStatus::NotStarted);

        progress.start();
        progress.enter(StageKind::CoursePlan);
        assert_eq!(progress.status(), RunStatus::Started);

        progress.enter(StageKind::PagePlan);
        assert_eq!(progress.status(), RunStatus::InProgress);

        progress.complete();
        let snap = progress.snapshot();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.stage, None);
    }

    #[test]
    fn test_counts_are_shared_between_clones() {
        let progress = RunProgress::new();
        let poller = progress.clone();

        progress.attempt(Unit::Page);
        progress.attempt(Unit::Page);
        progress.succeed(Unit::Page);
        progress.attempt(Unit::Chapter);

        let snap = poller.snapshot();
        assert_eq!(snap.pages.attempted, 2);
        assert_eq!(snap.pages.succeeded, 1);
        assert_eq!(snap.chapters.attempted, 1);
        assert_eq!(snap.modules, UnitCounts::default());
    }

    #[test]
    fn test_start_clears_previous_run() {
        let progress = RunProgress::new();
        progress.start();
        progress.attempt(Unit::Module);
        progress.succeed(Unit::Module);
        progress.attempt(Unit::Page);
        progress.fail(&PipelineError::NoContent);

        progress.start();
        let snap = progress.snapshot();
        assert_eq!(snap.status, RunStatus::Started);
        assert_eq!(snap.modules, UnitCounts::default());
        assert_eq!(snap.pages, UnitCounts::default());
        assert_eq!(snap.last_error, None);
    }

    #[test]
    fn test_failure_records_message() {
        let progress = RunProgress::new();
        progress.start();
        progress.fail(&PipelineError::NoContent);
        progress.enter(StageKind::ModuleQuiz);

        let snap = progress.snapshot();
        assert_eq!(snap.status, RunStatus::Error);
        assert!(snap.last_error.unwrap().contains("no content"));
        assert_ne!(snap.stage, Some(StageKind::ModuleQuiz));
    }
}
