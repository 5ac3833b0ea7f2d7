//! Drives a whole run: outline, modules, chapters, pages, then the course.
//!
//! Failures below the outline are isolated. A page that exhausts its retries
//! is dropped from its chapter, a chapter without a page plan or without any
//! surviving page is dropped from its module, and a module without any
//! surviving chapter is dropped from the course. Children are always folded
//! in outline order, whatever order they finished in.

use crate::checkpoint::{validate_run_id, CheckpointStore, CourseSink, StageKey};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::generation::Generator;
use crate::limiter::ConcurrencyLimiter;
use crate::model::{
    Chapter, ChapterOutline, Course, Module, ModuleOutline, Page, RunFailureReport,
};
use crate::progress::{RunProgress, Unit};
use crate::stages::{self, StageContext};
use crate::transcript::Transcript;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub course: Course,
    /// Where the sink put the course.
    pub course_path: PathBuf,
    pub failures: RunFailureReport,
    /// The course was published by an earlier invocation of this run and
    /// returned as stored. `failures` is empty in that case since it is
    /// not persisted.
    pub already_published: bool,
}

/// Builds courses from transcripts.
pub struct CourseAssembler {
    generator: Arc<dyn Generator>,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn CourseSink>,
    config: PipelineConfig,
}

impl CourseAssembler {
    pub fn new(
        generator: Arc<dyn Generator>,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn CourseSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            store,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline for `run_id`.
    ///
    /// Re-running with the same id resumes from whatever checkpoints exist.
    /// `progress` is updated throughout and left in a terminal state.
    pub async fn run(
        &self,
        run_id: &str,
        transcript: &Transcript,
        cancel: &CancellationToken,
        progress: &RunProgress,
    ) -> PipelineResult<RunOutcome> {
        progress.start();
        let result = self.run_inner(run_id, transcript, cancel, progress).await;
        match &result {
            Ok(outcome) => {
                progress.complete();
                tracing::info!(
                    run_id,
                    path = %outcome.course_path.display(),
                    modules = outcome.course.modules.len(),
                    pages = outcome.course.page_count(),
                    dropped_modules = outcome.failures.modules.len(),
                    dropped_chapters = outcome.failures.chapters.len(),
                    dropped_pages = outcome.failures.pages.len(),
                    "run completed"
                );
            }
            Err(e) => {
                progress.fail(e);
                tracing::error!(run_id, error = %e, kind = e.kind(), "run failed");
            }
        }
        result
    }

    async fn run_inner(
        &self,
        run_id: &str,
        transcript: &Transcript,
        cancel: &CancellationToken,
        progress: &RunProgress,
    ) -> PipelineResult<RunOutcome> {
        validate_run_id(run_id)?;
        if let Some((course_path, course)) = self.sink.existing(run_id).await? {
            tracing::info!(
                run_id,
                path = %course_path.display(),
                "course already published, returning it as stored"
            );
            return Ok(RunOutcome {
                course,
                course_path,
                failures: RunFailureReport::default(),
                already_published: true,
            });
        }

        let ctx = StageContext::new(
            run_id,
            self.generator.clone(),
            self.store.clone(),
            self.config.clone(),
        )
        .with_cancel(cancel.clone())
        .with_progress(progress.clone());

        tracing::info!(run_id, entries = transcript.len(), "run starting");
        let outline = stages::course_plan(&ctx, transcript).await?;

        let modules = ConcurrencyLimiter::new(self.config.module_parallelism);
        let pages = ConcurrencyLimiter::new(self.config.page_parallelism);

        let built = modules
            .fan_out(&outline.modules, |module| {
                self.build_module(&ctx, module, &pages)
            })
            .await;

        let mut failures = RunFailureReport::default();
        let mut finished = Vec::new();
        for (module, report) in built {
            failures.merge(report);
            finished.extend(module);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Aborted);
        }
        if finished.is_empty() {
            return Err(PipelineError::NoContent);
        }

        let course = Course {
            name: outline.name,
            description: outline.description,
            created_at: Utc::now(),
            modules: finished,
        };
        let course_path = self.sink.publish(run_id, &course).await?;

        Ok(RunOutcome {
            course,
            course_path,
            failures,
            already_published: false,
        })
    }

    async fn build_module(
        &self,
        ctx: &StageContext,
        outline: &ModuleOutline,
        pages: &ConcurrencyLimiter,
    ) -> (Option<Module>, RunFailureReport) {
        ctx.progress.attempt(Unit::Module);
        let mut failures = RunFailureReport::default();

        let chapter_limiter = ConcurrencyLimiter::new(self.config.chapter_parallelism);
        let built = chapter_limiter
            .fan_out(&outline.chapters, |chapter| {
                self.build_chapter(ctx, outline, chapter, pages)
            })
            .await;

        let mut chapters = Vec::new();
        for (chapter_outline, (chapter, failed_pages)) in outline.chapters.iter().zip(built) {
            failures.pages.extend(failed_pages);
            match chapter {
                Some(chapter) => chapters.push(chapter),
                None => failures.chapters.push(RunFailureReport::chapter_id(
                    &outline.name,
                    &chapter_outline.title,
                )),
            }
        }

        if chapters.is_empty() {
            tracing::warn!(
                run_id = ctx.run_id(),
                module = %outline.name,
                "module dropped, no chapter survived"
            );
            failures.modules.push(outline.name.clone());
            return (None, failures);
        }

        let titles: Vec<&str> = chapters.iter().map(|c| c.title.as_str()).collect();
        let (summary, quiz) = tokio::join!(
            stages::module_summary(ctx, outline, &titles),
            stages::module_quiz(ctx, outline, &titles),
        );
        let summary = summary.unwrap_or_else(|e| {
            tracing::warn!(
                run_id = ctx.run_id(),
                module = %outline.name,
                error = %e,
                "summary failed, leaving it empty"
            );
            String::new()
        });
        let quiz = quiz.unwrap_or_else(|e| {
            tracing::warn!(
                run_id = ctx.run_id(),
                module = %outline.name,
                error = %e,
                "quiz failed, leaving it empty"
            );
            Vec::new()
        });

        let module = Module {
            name: outline.name.clone(),
            description: outline.description.clone(),
            chapters,
            summary,
            quiz,
        };
        let key = StageKey::ModuleSnapshot {
            module: module.name.clone(),
        };
        save_snapshot(ctx, key, &module).await;
        ctx.progress.succeed(Unit::Module);
        (Some(module), failures)
    }

    /// Returns the chapter, if any page survived, and the ids of dropped pages.
    async fn build_chapter(
        &self,
        ctx: &StageContext,
        module: &ModuleOutline,
        outline: &ChapterOutline,
        pages: &ConcurrencyLimiter,
    ) -> (Option<Chapter>, Vec<String>) {
        ctx.progress.attempt(Unit::Chapter);

        let plan = match stages::chapter_page_plan(ctx, module, outline).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(
                    run_id = ctx.run_id(),
                    module = %module.name,
                    chapter = %outline.title,
                    error = %e,
                    "chapter dropped, no page plan"
                );
                return (None, Vec::new());
            }
        };

        let written: Vec<PipelineResult<Page>> = pages
            .fan_out(&plan.pages, |planned| async move {
                ctx.progress.attempt(Unit::Page);
                stages::page_content(ctx, module, outline, planned).await
            })
            .await;

        let mut kept = Vec::new();
        let mut dropped = Vec::new();
        for (planned, result) in plan.pages.iter().zip(written) {
            match result {
                Ok(page) => {
                    ctx.progress.succeed(Unit::Page);
                    kept.push(page);
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = ctx.run_id(),
                        module = %module.name,
                        chapter = %outline.title,
                        page = %planned.title,
                        error = %e,
                        "page dropped"
                    );
                    dropped.push(RunFailureReport::page_id(
                        &module.name,
                        &outline.title,
                        &planned.title,
                    ));
                }
            }
        }

        if kept.is_empty() {
            tracing::warn!(
                run_id = ctx.run_id(),
                module = %module.name,
                chapter = %outline.title,
                "chapter dropped, no page survived"
            );
            return (None, dropped);
        }

        let chapter = Chapter {
            title: outline.title.clone(),
            description: outline.description.clone(),
            pages: kept,
        };
        let key = StageKey::ChapterSnapshot {
            module: module.name.clone(),
            chapter: chapter.title.clone(),
        };
        save_snapshot(ctx, key, &chapter).await;
        ctx.progress.succeed(Unit::Chapter);
        (Some(chapter), dropped)
    }
}

/// Write an observability snapshot. Failures are logged, never propagated.
async fn save_snapshot<T: Serialize>(ctx: &StageContext, key: StageKey, value: &T) {
    if let Err(e) = ctx.checkpoints.save(&key, value).await {
        tracing::warn!(
            run_id = ctx.run_id(),
            file = %key.file_name(),
            error = %e,
            "could not write snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::UnitCounts;
    use crate::prompts::AgentRole;
    use crate::testing::{canned, PipelineHarness, ScriptedGenerator};

    #[tokio::test]
    async fn test_folds_in_outline_order_despite_latency() {
        // Later modules answer faster, so they finish first.
        let generator = ScriptedGenerator::happy_path_for(&[
            ("Alpha", &["A1"]),
            ("Beta", &["B1"]),
            ("Gamma", &["G1"]),
        ])
        .with_latency_by(|role, prompt| match role {
            AgentRole::ContentCreator if prompt.contains("'Alpha'") => 30,
            AgentRole::ContentCreator if prompt.contains("'Beta'") => 20,
            _ => 1,
        });
        let harness = PipelineHarness::new(generator);

        let outcome = harness.run("ordered").await.unwrap();
        let names: Vec<_> = outcome
            .course
            .modules
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[tokio::test]
    async fn test_summary_and_quiz_failures_degrade() {
        let generator = ScriptedGenerator::happy_path()
            .respond_with(AgentRole::SummaryCreator, |_| Ok("   ".into()))
            .respond_with(AgentRole::QuizCreator, |_| Ok("no quiz today".into()));
        let harness = PipelineHarness::new(generator);

        let outcome = harness.run("degraded").await.unwrap();
        assert!(outcome.failures.is_empty());
        for module in &outcome.course.modules {
            assert!(module.summary.is_empty());
            assert!(module.quiz.is_empty());
            assert!(!module.chapters.is_empty());
        }
    }

    #[tokio::test]
    async fn test_page_failure_is_isolated() {
        let generator = ScriptedGenerator::happy_path_for(&[("M", &["C"])])
            .with_pages(&["Good", "Bad"])
            .respond_with(AgentRole::ContentCreator, |prompt| {
                if prompt.contains("'Bad'") {
                    Err(crate::generation::RemoteError::Unavailable("boom".into()))
                } else {
                    Ok(canned::content_html("Good"))
                }
            });
        let harness = PipelineHarness::new(generator);

        let outcome = harness.run("pages").await.unwrap();
        let chapter = &outcome.course.modules[0].chapters[0];
        assert_eq!(chapter.pages.len(), 1);
        assert_eq!(chapter.pages[0].title, "Good");
        assert_eq!(outcome.failures.pages, vec!["M / C / Bad"]);
        assert!(outcome.failures.chapters.is_empty());

        let snap = harness.progress.snapshot();
        assert_eq!(snap.pages.attempted, 2);
        assert_eq!(snap.pages.succeeded, 1);
    }

    #[tokio::test]
    async fn test_progress_counts_only_the_latest_run() {
        let harness = PipelineHarness::new(ScriptedGenerator::happy_path_for(&[("M", &["C"])]));
        harness.run("first").await.unwrap();
        harness.run("second").await.unwrap();

        let snap = harness.progress.snapshot();
        let counts = |attempted, succeeded| UnitCounts {
            attempted,
            succeeded,
        };
        assert_eq!(snap.modules, counts(1, 1));
        assert_eq!(snap.chapters, counts(1, 1));
        assert_eq!(snap.pages, counts(2, 2));
    }

    #[tokio::test]
    async fn test_snapshots_are_written() {
        let harness = PipelineHarness::new(ScriptedGenerator::happy_path_for(&[("M", &["C"])]));
        harness.run("snap").await.unwrap();

        let module = StageKey::ModuleSnapshot {
            module: "M".into(),
        };
        let chapter = StageKey::ChapterSnapshot {
            module: "M".into(),
            chapter: "C".into(),
        };
        assert!(harness.store.get("snap", &module).is_some());
        assert!(harness.store.get("snap", &chapter).is_some());
    }

    #[tokio::test]
    async fn test_invalid_run_id_is_rejected() {
        let harness = PipelineHarness::new(ScriptedGenerator::happy_path());
        let err = harness.run("../escape").await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint(_)));
        assert_eq!(harness.generator.total_calls(), 0);
    }
}
