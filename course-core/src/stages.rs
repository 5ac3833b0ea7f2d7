//! The five pipeline stages.
//!
//! Every stage reads its checkpoint first and only calls the generator on a
//! miss, through the stage's retry policy. A computed result is written back
//! before it is returned, so a second call with the same key is free.

use crate::checkpoint::{CheckpointError, CheckpointStore, Checkpoints, StageKey};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult, StageKind};
use crate::extract::{extract_content, extract_structured, extract_summary, ExtractionError};
use crate::generation::Generator;
use crate::model::{ChapterOutline, ModuleOutline, Outline, Page, PagePlan, PlannedPage, QuizItem};
use crate::negotiation::{Negotiation, NegotiationOutcome};
use crate::progress::RunProgress;
use crate::prompts::{self, AgentRole};
use crate::retry::RetryPolicy;
use crate::transcript::Transcript;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a stage needs besides its own inputs.
#[derive(Clone)]
pub struct StageContext {
    pub generator: Arc<dyn Generator>,
    pub checkpoints: Checkpoints,
    pub cancel: CancellationToken,
    pub config: PipelineConfig,
    pub progress: RunProgress,
}

impl StageContext {
    pub fn new(
        run_id: impl Into<String>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            checkpoints: Checkpoints::new(store, run_id),
            cancel: CancellationToken::new(),
            config,
            progress: RunProgress::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: RunProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn run_id(&self) -> &str {
        self.checkpoints.run_id()
    }

    /// Checkpoint-read, else compute with retries and checkpoint-write.
    async fn checkpointed<T, F, Fut>(
        &self,
        key: StageKey,
        stage: StageKind,
        policy: RetryPolicy,
        compute: F,
    ) -> PipelineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Aborted);
        }
        self.progress.enter(stage);

        match self.checkpoints.load::<T>(&key).await {
            Ok(Some(value)) => {
                tracing::debug!(run_id = self.run_id(), file = %key.file_name(), "checkpoint hit");
                return Ok(value);
            }
            Ok(None) => {}
            Err(CheckpointError::Json(e)) => {
                tracing::warn!(
                    run_id = self.run_id(),
                    file = %key.file_name(),
                    error = %e,
                    "unreadable checkpoint, recomputing"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let value = policy.run(stage, &self.cancel, compute).await?;
        self.checkpoints.save(&key, &value).await?;
        Ok(value)
    }

    async fn generate(&self, role: AgentRole, prompt: &str) -> PipelineResult<String> {
        Ok(self.generator.generate(role, prompt).await?)
    }
}

/// Negotiate the course outline. One checkpoint per run.
pub async fn course_plan(ctx: &StageContext, transcript: &Transcript) -> PipelineResult<Outline> {
    let task = prompts::plan_task(&transcript.render());
    let max_rounds = ctx.config.max_negotiation_rounds;

    ctx.checkpointed(
        StageKey::CoursePlan,
        StageKind::CoursePlan,
        ctx.config.retry.plan,
        |attempt| {
            let task = task.as_str();
            async move {
                tracing::info!(run_id = ctx.run_id(), attempt, "negotiating course plan");
                let mut negotiation = Negotiation::new(task, max_rounds);
                match negotiation.run(&*ctx.generator, &ctx.cancel).await? {
                    NegotiationOutcome::Approved { outline, rounds } => {
                        tracing::info!(
                            run_id = ctx.run_id(),
                            course = %outline.name,
                            modules = outline.modules.len(),
                            chapters = outline.chapter_count(),
                            rounds,
                            "course plan approved"
                        );
                        Ok(outline)
                    }
                    NegotiationOutcome::Aborted { .. } => Err(PipelineError::Aborted),
                }
            }
        },
    )
    .await
}

/// Break one chapter into pages.
pub async fn chapter_page_plan(
    ctx: &StageContext,
    module: &ModuleOutline,
    chapter: &ChapterOutline,
) -> PipelineResult<PagePlan> {
    let task = prompts::page_plan_task(module, chapter);

    ctx.checkpointed(
        StageKey::page_plan(&module.name, &chapter.title),
        StageKind::PagePlan,
        ctx.config.retry.page_plan,
        |_| {
            let task = task.as_str();
            async move {
                let reply = ctx.generate(AgentRole::ChapterPlanner, task).await?;
                let plan: PagePlan = extract_structured(&reply, "page plan")?;
                check_page_plan(&plan)?;
                Ok(plan)
            }
        },
    )
    .await
}

fn check_page_plan(plan: &PagePlan) -> Result<(), ExtractionError> {
    let schema = |reason: String| ExtractionError::Schema {
        expected: "page plan",
        reason,
    };
    if plan.pages.is_empty() {
        return Err(schema("no pages".into()));
    }
    let mut seen = HashSet::new();
    for page in &plan.pages {
        if page.title.trim().is_empty() {
            return Err(schema("a page has an empty title".into()));
        }
        if !seen.insert(page.title.as_str()) {
            return Err(schema(format!("duplicate page title '{}'", page.title)));
        }
    }
    Ok(())
}

/// Write one page. Unparseable output is kept as-is rather than failing.
pub async fn page_content(
    ctx: &StageContext,
    module: &ModuleOutline,
    chapter: &ChapterOutline,
    page: &PlannedPage,
) -> PipelineResult<Page> {
    let task = prompts::page_content_task(module, chapter, page);

    ctx.checkpointed(
        StageKey::page_content(&module.name, &chapter.title, &page.title),
        StageKind::PageContent,
        ctx.config.retry.page_content,
        |_| {
            let task = task.as_str();
            async move {
                let reply = ctx.generate(AgentRole::ContentCreator, task).await?;
                let (content, source) = extract_content(&reply);
                if content.is_empty() {
                    return Err(ExtractionError::NotFound {
                        expected: "page content",
                    }
                    .into());
                }
                tracing::debug!(
                    run_id = ctx.run_id(),
                    page = %page.title,
                    ?source,
                    "page content extracted"
                );
                let mut written = page.to_page();
                written.content = content;
                Ok(written)
            }
        },
    )
    .await
}

#[derive(Debug, Serialize, Deserialize)]
struct SummaryArtifact {
    summary: String,
}

/// Summarise a module over its surviving chapters.
pub async fn module_summary(
    ctx: &StageContext,
    module: &ModuleOutline,
    chapter_titles: &[&str],
) -> PipelineResult<String> {
    let task = prompts::summary_task(module, chapter_titles);

    let artifact = ctx
        .checkpointed(
            StageKey::module_summary(&module.name),
            StageKind::ModuleSummary,
            ctx.config.retry.summary,
            |_| {
                let task = task.as_str();
                async move {
                    let reply = ctx.generate(AgentRole::SummaryCreator, task).await?;
                    let summary = extract_summary(&reply);
                    if summary.is_empty() {
                        return Err(ExtractionError::NotFound { expected: "summary" }.into());
                    }
                    Ok(SummaryArtifact { summary })
                }
            },
        )
        .await?;
    Ok(artifact.summary)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuizDocument {
    Wrapped { questions: Vec<QuizItem> },
    Bare(Vec<QuizItem>),
}

/// Quiz a module over its surviving chapters.
pub async fn module_quiz(
    ctx: &StageContext,
    module: &ModuleOutline,
    chapter_titles: &[&str],
) -> PipelineResult<Vec<QuizItem>> {
    let task = prompts::quiz_task(module, chapter_titles);

    ctx.checkpointed(
        StageKey::module_quiz(&module.name),
        StageKind::ModuleQuiz,
        ctx.config.retry.quiz,
        |_| {
            let task = task.as_str();
            async move {
                let reply = ctx.generate(AgentRole::QuizCreator, task).await?;
                let questions = match extract_structured::<QuizDocument>(&reply, "quiz")? {
                    QuizDocument::Wrapped { questions } => questions,
                    QuizDocument::Bare(questions) => questions,
                };
                if questions.is_empty() {
                    return Err(ExtractionError::Schema {
                        expected: "quiz",
                        reason: "no questions".into(),
                    }
                    .into());
                }
                Ok(questions)
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{canned, fast_config, MemoryCheckpointStore, ScriptedGenerator};

    fn context(
        generator: ScriptedGenerator,
    ) -> (StageContext, Arc<ScriptedGenerator>, Arc<MemoryCheckpointStore>) {
        let generator = Arc::new(generator);
        let store = Arc::new(MemoryCheckpointStore::new());
        let ctx = StageContext::new("run", generator.clone(), store.clone(), fast_config());
        (ctx, generator, store)
    }

    fn module() -> ModuleOutline {
        ModuleOutline {
            name: "Verbs".into(),
            description: "Conjugation".into(),
            chapters: vec![chapter()],
        }
    }

    fn chapter() -> ChapterOutline {
        ChapterOutline {
            title: "Preterite".into(),
            description: "Past tense".into(),
        }
    }

    #[tokio::test]
    async fn test_page_plan_is_idempotent() {
        let plan = canned::page_plan_json(&["Intro", "Practice"]);
        let (ctx, generator, _) =
            context(ScriptedGenerator::new().reply(AgentRole::ChapterPlanner, plan));

        let first = chapter_page_plan(&ctx, &module(), &chapter()).await.unwrap();
        let second = chapter_page_plan(&ctx, &module(), &chapter()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.pages.len(), 2);
        assert_eq!(generator.call_count(AgentRole::ChapterPlanner), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_bytes_are_stable() {
        let (ctx, generator, store) = context(
            ScriptedGenerator::new()
                .reply(AgentRole::QuizCreator, canned::quiz_json(2)),
        );
        let key = StageKey::module_quiz("Verbs");

        let first = module_quiz(&ctx, &module(), &["Preterite"]).await.unwrap();
        let stored = store.get("run", &key).unwrap();
        let second = module_quiz(&ctx, &module(), &["Preterite"]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get("run", &key).unwrap(), stored);
        assert_eq!(serde_json::to_string_pretty(&second).unwrap(), stored);
        assert_eq!(generator.total_calls(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_page_plan_retries_unparseable_output() {
        let (ctx, generator, _) = context(
            ScriptedGenerator::new()
                .reply(AgentRole::ChapterPlanner, "Sorry, here is some prose.")
                .reply(AgentRole::ChapterPlanner, r#"{"pages": []}"#)
                .reply(AgentRole::ChapterPlanner, canned::page_plan_json(&["Only"])),
        );

        let plan = chapter_page_plan(&ctx, &module(), &chapter()).await.unwrap();
        assert_eq!(plan.pages[0].title, "Only");
        assert_eq!(generator.call_count(AgentRole::ChapterPlanner), 3);
    }

    #[test]
    fn test_page_plan_rejects_duplicate_titles() {
        let page = PlannedPage {
            title: "A".into(),
            description: String::new(),
            learning_objectives: vec![],
            key_concepts: vec![],
        };
        let plan = PagePlan {
            pages: vec![page.clone(), page],
        };
        assert!(check_page_plan(&plan).is_err());
    }

    #[tokio::test]
    async fn test_page_content_passes_raw_text_through() {
        let (ctx, _, _) = context(
            ScriptedGenerator::new()
                .reply(AgentRole::ContentCreator, "Just a paragraph of prose."),
        );
        let planned = PlannedPage {
            title: "Intro".into(),
            description: "d".into(),
            learning_objectives: vec![],
            key_concepts: vec![],
        };

        let page = page_content(&ctx, &module(), &chapter(), &planned).await.unwrap();
        assert_eq!(page.title, "Intro");
        assert_eq!(page.content, "Just a paragraph of prose.");
    }

    #[tokio::test]
    async fn test_summary_and_quiz_formats() {
        let (ctx, _, _) = context(
            ScriptedGenerator::new()
                .reply(AgentRole::SummaryCreator, "This module covers verbs.\nSUMMARY_COMPLETE")
                .reply(
                    AgentRole::QuizCreator,
                    format!("```json\n[{}]\n```", canned::quiz_item_json(1)),
                ),
        );

        let summary = module_summary(&ctx, &module(), &["Preterite"]).await.unwrap();
        assert_eq!(summary, "This module covers verbs.");

        let quiz = module_quiz(&ctx, &module(), &["Preterite"]).await.unwrap();
        assert_eq!(quiz.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_stage_does_no_work() {
        let (ctx, generator, _) = context(ScriptedGenerator::happy_path());
        ctx.cancel.cancel();

        let err = chapter_page_plan(&ctx, &module(), &chapter()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Aborted));
        assert_eq!(generator.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_course_plan_aborted_is_fatal_error() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (ctx, _, store) = context(
            ScriptedGenerator::happy_path().respond_with(AgentRole::PlanReviewer, move |_| {
                trigger.cancel();
                Ok("APPROVE".into())
            }),
        );
        let ctx = ctx.with_cancel(cancel);
        let transcript = canned::transcript();

        let err = course_plan(&ctx, &transcript).await.unwrap_err();
        assert!(matches!(err, PipelineError::Aborted));
        assert!(store.get("run", &StageKey::CoursePlan).is_none());
    }
}
