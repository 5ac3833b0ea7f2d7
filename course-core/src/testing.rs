//! Testing utilities for the course pipeline.
//!
//! This module provides tools for integration testing:
//! - `ScriptedGenerator` for deterministic runs without API calls
//! - `MemoryCheckpointStore` and `MemoryCourseSink` for in-memory persistence
//! - `PipelineHarness` for wiring a whole run together
//! - `canned` response builders in the formats the prompts ask for

use crate::assembler::{CourseAssembler, RunOutcome};
use crate::checkpoint::{course_slug, CheckpointError, CheckpointStore, CourseSink, StageKey};
use crate::config::{PipelineConfig, StageRetry};
use crate::error::PipelineResult;
use crate::generation::{Generator, RemoteError};
use crate::model::Course;
use crate::progress::RunProgress;
use crate::prompts::AgentRole;
use crate::retry::RetryPolicy;
use crate::transcript::Transcript;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Handler = Arc<dyn Fn(&str) -> Result<String, RemoteError> + Send + Sync>;
type LatencyFn = Arc<dyn Fn(AgentRole, &str) -> u64 + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A queued reply for one role.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Fails with `RemoteError::Unavailable`.
    Fail(String),
}

/// A call the generator received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub role: AgentRole,
    pub prompt: String,
}

/// A generator that answers from a script.
///
/// Each role has a queue of replies that is consumed first, then an optional
/// handler that answers every further call. A role with neither fails with
/// `RemoteError::Unavailable`.
pub struct ScriptedGenerator {
    queued: Mutex<HashMap<AgentRole, VecDeque<ScriptedReply>>>,
    handlers: HashMap<AgentRole, Handler>,
    latency: Option<LatencyFn>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    /// An empty script.
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(HashMap::new()),
            handlers: HashMap::new(),
            latency: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// A script where every stage succeeds for a two-module course.
    pub fn happy_path() -> Self {
        Self::happy_path_for(&[
            ("Foundations", &["Getting Started", "Core Ideas"]),
            ("Practice", &["Exercises"]),
        ])
    }

    /// A script where every stage succeeds for the given modules and chapters.
    pub fn happy_path_for(modules: &[(&str, &[&str])]) -> Self {
        let outline = canned::outline_json("Test Course", modules);
        Self::new()
            .respond_with(AgentRole::CoursePlanner, move |_| Ok(outline.clone()))
            .respond_with(AgentRole::PlanReviewer, |_| Ok("The plan is complete.\nAPPROVE".into()))
            .with_pages(&["Overview", "Details"])
            .respond_with(AgentRole::ContentCreator, |prompt| {
                Ok(canned::content_html(quoted(prompt).unwrap_or("page")))
            })
            .respond_with(AgentRole::SummaryCreator, |prompt| {
                Ok(format!(
                    "A summary of {}.\nSUMMARY_COMPLETE",
                    quoted(prompt).unwrap_or("the module")
                ))
            })
            .respond_with(AgentRole::QuizCreator, |_| Ok(canned::quiz_json(2)))
    }

    /// Queue a reply for `role`.
    pub fn reply(self, role: AgentRole, text: impl Into<String>) -> Self {
        self.queue(role, ScriptedReply::Text(text.into()))
    }

    /// Queue a failure for `role`.
    pub fn fail(self, role: AgentRole, message: impl Into<String>) -> Self {
        self.queue(role, ScriptedReply::Fail(message.into()))
    }

    fn queue(self, role: AgentRole, reply: ScriptedReply) -> Self {
        lock(&self.queued).entry(role).or_default().push_back(reply);
        self
    }

    /// Answer every unqueued call for `role` with `handler`.
    pub fn respond_with<F>(mut self, role: AgentRole, handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, RemoteError> + Send + Sync + 'static,
    {
        self.handlers.insert(role, Arc::new(handler));
        self
    }

    /// Plan every chapter with these page titles.
    pub fn with_pages(self, titles: &[&str]) -> Self {
        let plan = canned::page_plan_json(titles);
        self.respond_with(AgentRole::ChapterPlanner, move |_| Ok(plan.clone()))
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        let ms = latency.as_millis() as u64;
        self.with_latency_by(move |_, _| ms)
    }

    /// Delay each call by the returned number of milliseconds.
    pub fn with_latency_by<F>(mut self, latency: F) -> Self
    where
        F: Fn(AgentRole, &str) -> u64 + Send + Sync + 'static,
    {
        self.latency = Some(Arc::new(latency));
        self
    }

    fn next_reply(&self, role: AgentRole, prompt: &str) -> Result<String, RemoteError> {
        let queued = lock(&self.queued).get_mut(&role).and_then(VecDeque::pop_front);
        match queued {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(message)) => Err(RemoteError::Unavailable(message)),
            None => match self.handlers.get(&role) {
                Some(handler) => handler(prompt),
                None => Err(RemoteError::Unavailable(format!("no scripted reply for {role}"))),
            },
        }
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Prompts sent to `role`, in order.
    pub fn prompts_for(&self, role: AgentRole) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.prompt.clone())
            .collect()
    }

    pub fn call_count(&self, role: AgentRole) -> usize {
        lock(&self.calls).iter().filter(|c| c.role == role).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Most calls that were ever in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, role: AgentRole, prompt: &str) -> Result<String, RemoteError> {
        lock(&self.calls).push(RecordedCall {
            role,
            prompt: prompt.to_string(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = &self.latency {
            let ms = latency(role, prompt);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }

        let reply = self.next_reply(role, prompt);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// First single-quoted name in a task prompt.
pub fn quoted(prompt: &str) -> Option<&str> {
    let start = prompt.find('\'')? + 1;
    let len = prompt[start..].find('\'')?;
    Some(&prompt[start..start + len])
}

/// Checkpoints held in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, String), String>>,
    writes: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &str, key: &StageKey) -> Option<String> {
        lock(&self.entries)
            .get(&(run_id.to_string(), key.file_name()))
            .cloned()
    }

    /// Seed an artifact directly, bypassing the write count.
    pub fn insert(&self, run_id: &str, key: &StageKey, artifact: impl Into<String>) {
        lock(&self.entries).insert((run_id.to_string(), key.file_name()), artifact.into());
    }

    /// File names stored for `run_id`, sorted.
    pub fn keys(&self, run_id: &str) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.entries)
            .keys()
            .filter(|(run, _)| run == run_id)
            .map(|(_, name)| name.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn exists(&self, run_id: &str, key: &StageKey) -> Result<bool, CheckpointError> {
        Ok(self.get(run_id, key).is_some())
    }

    async fn read(&self, run_id: &str, key: &StageKey) -> Result<Option<String>, CheckpointError> {
        Ok(self.get(run_id, key))
    }

    async fn write(
        &self,
        run_id: &str,
        key: &StageKey,
        artifact: &str,
    ) -> Result<(), CheckpointError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(run_id, key, artifact);
        Ok(())
    }
}

/// Course sink held in memory. Write-once per run like the file sink.
#[derive(Debug, Default)]
pub struct MemoryCourseSink {
    courses: Mutex<HashMap<String, (PathBuf, Course)>>,
    publishes: AtomicUsize,
}

impl MemoryCourseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self, run_id: &str) -> Option<Course> {
        lock(&self.courses).get(run_id).map(|(_, course)| course.clone())
    }

    /// Number of courses actually stored.
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CourseSink for MemoryCourseSink {
    async fn publish(&self, run_id: &str, course: &Course) -> Result<PathBuf, CheckpointError> {
        let mut courses = lock(&self.courses);
        if let Some((path, _)) = courses.get(run_id) {
            return Ok(path.clone());
        }
        let path = PathBuf::from(run_id)
            .join("courses")
            .join(format!("{}.json", course_slug(&course.name)));
        courses.insert(run_id.to_string(), (path.clone(), course.clone()));
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }

    async fn existing(&self, run_id: &str) -> Result<Option<(PathBuf, Course)>, CheckpointError> {
        Ok(lock(&self.courses).get(run_id).cloned())
    }
}

/// Default configuration with millisecond backoff.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig::default().with_retry(StageRetry::uniform(RetryPolicy::new(
        3,
        Duration::from_millis(1),
    )))
}

/// A whole pipeline wired to in-memory collaborators.
pub struct PipelineHarness {
    pub generator: Arc<ScriptedGenerator>,
    pub store: Arc<MemoryCheckpointStore>,
    pub sink: Arc<MemoryCourseSink>,
    pub config: PipelineConfig,
    /// Shared by every run of this harness; each run starts from zero.
    pub progress: RunProgress,
    pub cancel: CancellationToken,
    pub transcript: Transcript,
}

impl PipelineHarness {
    pub fn new(generator: ScriptedGenerator) -> Self {
        Self {
            generator: Arc::new(generator),
            store: Arc::new(MemoryCheckpointStore::new()),
            sink: Arc::new(MemoryCourseSink::new()),
            config: fast_config(),
            progress: RunProgress::new(),
            cancel: CancellationToken::new(),
            transcript: canned::transcript(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the generator, keeping stored checkpoints. Used to resume a run.
    pub fn with_generator(mut self, generator: ScriptedGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn assembler(&self) -> CourseAssembler {
        CourseAssembler::new(
            self.generator.clone(),
            self.store.clone(),
            self.sink.clone(),
            self.config.clone(),
        )
    }

    pub async fn run(&self, run_id: &str) -> PipelineResult<RunOutcome> {
        self.assembler()
            .run(run_id, &self.transcript, &self.cancel, &self.progress)
            .await
    }
}

/// Builders for replies in the formats the prompts request.
pub mod canned {
    use crate::transcript::{Transcript, TranscriptEntry};
    use serde_json::json;

    /// A course plan reply wrapped in prose and a json fence.
    pub fn outline_json(name: &str, modules: &[(&str, &[&str])]) -> String {
        let modules: Vec<_> = modules
            .iter()
            .map(|(module, chapters)| {
                json!({
                    "name": module,
                    "description": format!("All about {module}"),
                    "chapters": chapters
                        .iter()
                        .map(|title| {
                            json!({"title": title, "description": format!("{title} in depth")})
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let plan = json!({
            "course_name": name,
            "course_description": format!("A course on {name}"),
            "modules": modules,
        });
        format!(
            "Here is the course plan.\n```json\n{}\n```",
            serde_json::to_string_pretty(&plan).unwrap_or_default()
        )
    }

    pub fn page_plan_json(titles: &[&str]) -> String {
        let pages: Vec<_> = titles
            .iter()
            .map(|title| {
                json!({
                    "title": title,
                    "description": format!("What {title} covers"),
                    "learning_objectives": [format!("Understand {title}")],
                    "key_concepts": [title],
                })
            })
            .collect();
        format!(
            "```json\n{}\n```",
            serde_json::to_string_pretty(&json!({ "pages": pages })).unwrap_or_default()
        )
    }

    pub fn content_html(title: &str) -> String {
        format!("```html\n<h1>{title}</h1>\n<p>Lesson body for {title}.</p>\n```\nCONTENT_COMPLETE")
    }

    /// One quiz question object.
    pub fn quiz_item_json(n: usize) -> String {
        json!({
            "question_type": "multiple_choice",
            "question": format!("Question {n}?"),
            "multiple_choice": ["Yes", "No"],
            "answer": "Yes",
        })
        .to_string()
    }

    pub fn quiz_json(count: usize) -> String {
        let items: Vec<_> = (1..=count).map(quiz_item_json).collect();
        format!(
            "```json\n{{\"questions\": [{}]}}\n```\nQUIZ_COMPLETE",
            items.join(", ")
        )
    }

    pub fn transcript() -> Transcript {
        Transcript {
            entries: vec![
                TranscriptEntry::new("assistant", "What would you like to learn?"),
                TranscriptEntry::new("user", "Rust. I have written some Python before."),
                TranscriptEntry::new("assistant", "What is a closure?"),
                TranscriptEntry::new("user", "A function that captures its environment."),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_before_handler() {
        let generator = ScriptedGenerator::new()
            .reply(AgentRole::SummaryCreator, "first")
            .fail(AgentRole::SummaryCreator, "down")
            .respond_with(AgentRole::SummaryCreator, |_| Ok("handler".into()));

        let role = AgentRole::SummaryCreator;
        assert_eq!(generator.generate(role, "a").await.unwrap(), "first");
        assert!(generator.generate(role, "b").await.is_err());
        assert_eq!(generator.generate(role, "c").await.unwrap(), "handler");
        assert!(generator.generate(AgentRole::QuizCreator, "d").await.is_err());
        assert_eq!(generator.call_count(AgentRole::SummaryCreator), 3);
        assert_eq!(generator.total_calls(), 4);
    }

    #[test]
    fn test_quoted() {
        assert_eq!(quoted("Create content for the page 'Intro' in chapter 'X'"), Some("Intro"));
        assert_eq!(quoted("nothing"), None);
    }

    #[tokio::test]
    async fn test_memory_sink_is_write_once() {
        let sink = MemoryCourseSink::new();
        let course = Course {
            name: "A".into(),
            description: String::new(),
            created_at: chrono::Utc::now(),
            modules: vec![],
        };
        let first = sink.publish("r", &course).await.unwrap();
        let second = sink.publish("r", &course).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sink.publish_count(), 1);
    }
}
