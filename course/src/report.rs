//! Terminal output for finished and failed runs.

use course_core::{PipelineError, ProgressSnapshot, RunOutcome};
use serde_json::json;
use std::fmt::Write;

pub fn outcome_text(run_id: &str, outcome: &RunOutcome) -> String {
    let course = &outcome.course;
    let chapters: usize = course.modules.iter().map(|m| m.chapters.len()).sum();
    let quiz_items: usize = course.modules.iter().map(|m| m.quiz.len()).sum();

    let mut out = String::new();
    if outcome.already_published {
        let _ = writeln!(
            out,
            "Run {run_id} was already complete; showing the published course"
        );
    } else {
        let _ = writeln!(out, "Run {run_id} complete");
    }
    let _ = writeln!(out, "  Course:   {}", course.name);
    let _ = writeln!(out, "  Written:  {}", outcome.course_path.display());
    let _ = writeln!(
        out,
        "  Contents: {} modules, {} chapters, {} pages, {} quiz questions",
        course.modules.len(),
        chapters,
        course.page_count(),
        quiz_items
    );

    if outcome.failures.is_empty() {
        return out;
    }

    let _ = writeln!(out, "\nDropped during generation:");
    for (label, ids) in [
        ("module", &outcome.failures.modules),
        ("chapter", &outcome.failures.chapters),
        ("page", &outcome.failures.pages),
    ] {
        for id in ids {
            let _ = writeln!(out, "  {label:<8} {id}");
        }
    }
    let _ = writeln!(
        out,
        "\nThe course for run {run_id} is final; start a new --run-id to generate it again."
    );
    out
}

pub fn outcome_json(run_id: &str, outcome: &RunOutcome) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&json!({
        "run_id": run_id,
        "course_path": outcome.course_path,
        "course": outcome.course.name,
        "modules": outcome.course.modules.len(),
        "pages": outcome.course.page_count(),
        "failures": outcome.failures,
        "already_published": outcome.already_published,
    }))
}

pub fn failure_text(run_id: &str, err: &PipelineError, progress: &ProgressSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run {run_id} failed: {err}");
    if let Some(stage) = progress.stage {
        let _ = writeln!(out, "  Last stage: {stage}");
    }
    let _ = writeln!(
        out,
        "  Finished: {}/{} modules, {}/{} chapters, {}/{} pages",
        progress.modules.succeeded,
        progress.modules.attempted,
        progress.chapters.succeeded,
        progress.chapters.attempted,
        progress.pages.succeeded,
        progress.pages.attempted
    );
    if matches!(err, PipelineError::Aborted) || err.is_retryable() {
        let _ = writeln!(out, "  Checkpoints were kept; re-run with --run-id {run_id} to resume.");
    }
    out
}
