//! Checkpoint persistence.
//!
//! Every stage result is written under a `StageKey` before it is used, and
//! read back before any recomputation. The file store lays a run out as
//!
//! ```text
//! <runs_dir>/<run_id>/intermediate/<stage key>.json
//! <runs_dir>/<run_id>/courses/<course slug>.json
//! ```

use crate::model::Course;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

/// Errors from checkpoint and course storage.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),
}

/// Identifies one stage artifact within a run.
///
/// Names are used exactly as given: two keys are equal only if every
/// component matches byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StageKey {
    CoursePlan,
    PagePlan {
        module: String,
        chapter: String,
    },
    PageContent {
        module: String,
        chapter: String,
        page: String,
    },
    ModuleSummary {
        module: String,
    },
    ModuleQuiz {
        module: String,
    },
    ChapterSnapshot {
        module: String,
        chapter: String,
    },
    ModuleSnapshot {
        module: String,
    },
}

impl StageKey {
    pub fn page_plan(module: &str, chapter: &str) -> Self {
        StageKey::PagePlan {
            module: module.to_string(),
            chapter: chapter.to_string(),
        }
    }

    pub fn page_content(module: &str, chapter: &str, page: &str) -> Self {
        StageKey::PageContent {
            module: module.to_string(),
            chapter: chapter.to_string(),
            page: page.to_string(),
        }
    }

    pub fn module_summary(module: &str) -> Self {
        StageKey::ModuleSummary {
            module: module.to_string(),
        }
    }

    pub fn module_quiz(module: &str) -> Self {
        StageKey::ModuleQuiz {
            module: module.to_string(),
        }
    }

    /// File name for this key.
    ///
    /// Components are escaped so the mapping is injective and the result is
    /// always a single path segment: ASCII letters, digits and `-` pass
    /// through, every other byte becomes `%XX`, and `_` is only ever a
    /// separator.
    pub fn file_name(&self) -> String {
        let (prefix, parts): (&str, Vec<&String>) = match self {
            StageKey::CoursePlan => ("course_plan", vec![]),
            StageKey::PagePlan { module, chapter } => ("chapter_plan", vec![module, chapter]),
            StageKey::PageContent {
                module,
                chapter,
                page,
            } => ("page", vec![module, chapter, page]),
            StageKey::ModuleSummary { module } => ("summary", vec![module]),
            StageKey::ModuleQuiz { module } => ("quiz", vec![module]),
            StageKey::ChapterSnapshot { module, chapter } => ("chapter", vec![module, chapter]),
            StageKey::ModuleSnapshot { module } => ("module", vec![module]),
        };

        let mut name = prefix.to_string();
        for part in parts {
            name.push('_');
            name.push_str(&escape_component(part));
        }
        name.push_str(".json");
        name
    }
}

fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reject run ids that would escape or collapse the runs directory.
pub fn validate_run_id(run_id: &str) -> Result<(), CheckpointError> {
    let bad = run_id.trim().is_empty()
        || run_id == "."
        || run_id == ".."
        || run_id.contains(|c: char| c == '/' || c == '\\')
        || run_id.contains('\0');
    if bad {
        Err(CheckpointError::InvalidRunId(run_id.to_string()))
    } else {
        Ok(())
    }
}

/// Key/value persistence for stage artifacts.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn exists(&self, run_id: &str, key: &StageKey) -> Result<bool, CheckpointError>;

    /// `Ok(None)` when nothing has been written for `key`.
    async fn read(&self, run_id: &str, key: &StageKey) -> Result<Option<String>, CheckpointError>;

    /// Replace the artifact for `key`. Readers never see a partial write.
    async fn write(&self, run_id: &str, key: &StageKey, artifact: &str)
        -> Result<(), CheckpointError>;
}

/// Checkpoints as JSON files under a runs directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    runs_dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Directory holding a run's checkpoints.
    pub fn intermediate_dir(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.runs_dir.join(run_id).join("intermediate"))
    }

    pub fn path_for(&self, run_id: &str, key: &StageKey) -> Result<PathBuf, CheckpointError> {
        Ok(self.intermediate_dir(run_id)?.join(key.file_name()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn exists(&self, run_id: &str, key: &StageKey) -> Result<bool, CheckpointError> {
        let path = self.path_for(run_id, key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn read(&self, run_id: &str, key: &StageKey) -> Result<Option<String>, CheckpointError> {
        let path = self.path_for(run_id, key)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(
        &self,
        run_id: &str,
        key: &StageKey,
        artifact: &str,
    ) -> Result<(), CheckpointError> {
        let path = self.path_for(run_id, key)?;
        write_atomic(&path, artifact.as_bytes()).await
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Typed view of a store for a single run.
#[derive(Clone)]
pub struct Checkpoints {
    store: Arc<dyn CheckpointStore>,
    run_id: String,
}

impl Checkpoints {
    pub fn new(store: Arc<dyn CheckpointStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn exists(&self, key: &StageKey) -> Result<bool, CheckpointError> {
        self.store.exists(&self.run_id, key).await
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &StageKey,
    ) -> Result<Option<T>, CheckpointError> {
        match self.store.read(&self.run_id, key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save<T: Serialize + ?Sized>(
        &self,
        key: &StageKey,
        value: &T,
    ) -> Result<(), CheckpointError> {
        let raw = serde_json::to_string_pretty(value)?;
        self.store.write(&self.run_id, key, &raw).await
    }
}

/// Write-once destination for finished courses.
#[async_trait]
pub trait CourseSink: Send + Sync {
    /// Persist `course` for `run_id` and return where it lives. If the run
    /// already published a course, the existing location is returned and
    /// nothing is rewritten.
    async fn publish(&self, run_id: &str, course: &Course) -> Result<PathBuf, CheckpointError>;

    /// The course `run_id` already published, with its location.
    async fn existing(&self, run_id: &str) -> Result<Option<(PathBuf, Course)>, CheckpointError>;
}

/// Courses as JSON files in `<runs_dir>/<run_id>/courses/`.
#[derive(Debug, Clone)]
pub struct FileCourseSink {
    runs_dir: PathBuf,
}

impl FileCourseSink {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn courses_dir(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        Ok(self.runs_dir.join(run_id).join("courses"))
    }
}

#[async_trait]
impl CourseSink for FileCourseSink {
    async fn publish(&self, run_id: &str, course: &Course) -> Result<PathBuf, CheckpointError> {
        let dir = self.courses_dir(run_id)?;
        let path = dir.join(format!("{}.json", course_slug(&course.name)));

        if fs::try_exists(&path).await? {
            tracing::info!(path = %path.display(), "course already published for this run");
            return Ok(path);
        }

        let json = serde_json::to_string_pretty(course)?;
        write_atomic(&path, json.as_bytes()).await?;
        tracing::info!(path = %path.display(), "course written");
        Ok(path)
    }

    async fn existing(&self, run_id: &str) -> Result<Option<(PathBuf, Course)>, CheckpointError> {
        let dir = self.courses_dir(run_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut courses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                courses.push(path);
            }
        }
        courses.sort();

        let Some(path) = courses.into_iter().next() else {
            return Ok(None);
        };
        let raw = fs::read_to_string(&path).await?;
        let course = serde_json::from_str(&raw)?;
        Ok(Some((path, course)))
    }
}

/// Lowercase file-safe form of a course name.
pub fn course_slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if slug.chars().all(|c| c == '_') {
        "course".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_file_names() {
        assert_eq!(StageKey::CoursePlan.file_name(), "course_plan.json");
        assert_eq!(
            StageKey::page_plan("Basics", "Ownership").file_name(),
            "chapter_plan_Basics_Ownership.json"
        );
        assert_eq!(
            StageKey::page_content("M 1", "C/2", "p_3").file_name(),
            "page_M%201_C%2F2_p%5F3.json"
        );
        assert_eq!(StageKey::module_quiz("Q").file_name(), "quiz_Q.json");
    }

    #[test]
    fn test_file_names_do_not_collide() {
        let a = StageKey::page_content("a_b", "c", "d").file_name();
        let b = StageKey::page_content("a", "b_c", "d").file_name();
        assert_ne!(a, b);

        let upper = StageKey::module_summary("Intro").file_name();
        let lower = StageKey::module_summary("intro").file_name();
        assert_ne!(upper, lower);

        let dots = StageKey::module_summary("../../etc").file_name();
        assert!(!dots.contains('/'));
    }

    #[test]
    fn test_run_id_validation() {
        assert!(validate_run_id("run-2024-01").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("..").is_err());
        assert!(validate_run_id("a/b").is_err());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let key = StageKey::module_summary("Verbs");

        assert!(!store.exists("run1", &key).await.unwrap());
        assert_eq!(store.read("run1", &key).await.unwrap(), None);

        store.write("run1", &key, "{\"summary\":\"x\"}").await.unwrap();
        assert!(store.exists("run1", &key).await.unwrap());
        assert_eq!(
            store.read("run1", &key).await.unwrap().as_deref(),
            Some("{\"summary\":\"x\"}")
        );

        let path = store.path_for("run1", &key).unwrap();
        assert!(path.ends_with("run1/intermediate/summary_Verbs.json"));
        let tmp = path.with_file_name("summary_Verbs.json.tmp");
        assert!(!tmp.exists());

        // Other runs are separate namespaces.
        assert!(!store.exists("run2", &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_checkpoints() {
        let dir = TempDir::new().unwrap();
        let checkpoints = Checkpoints::new(Arc::new(FileCheckpointStore::new(dir.path())), "r");
        let key = StageKey::module_quiz("M");

        let missing: Option<Vec<String>> = checkpoints.load(&key).await.unwrap();
        assert!(missing.is_none());

        checkpoints.save(&key, &vec!["a".to_string()]).await.unwrap();
        let loaded: Option<Vec<String>> = checkpoints.load(&key).await.unwrap();
        assert_eq!(loaded, Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_course_sink_is_write_once() {
        let dir = TempDir::new().unwrap();
        let sink = FileCourseSink::new(dir.path());
        let mut course = Course {
            name: "Rust for Beginners".into(),
            description: "d".into(),
            created_at: Utc::now(),
            modules: vec![],
        };

        let path = sink.publish("run", &course).await.unwrap();
        assert!(path.ends_with("run/courses/rust_for_beginners.json"));
        let first = std::fs::read_to_string(&path).unwrap();

        course.description = "changed".into();
        let again = sink.publish("run", &course).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[tokio::test]
    async fn test_course_sink_reads_back_published_course() {
        let dir = TempDir::new().unwrap();
        let sink = FileCourseSink::new(dir.path());
        assert!(sink.existing("run").await.unwrap().is_none());

        let course = Course {
            name: "Knots".into(),
            description: "d".into(),
            created_at: Utc::now(),
            modules: vec![],
        };
        let path = sink.publish("run", &course).await.unwrap();

        let (found, stored) = sink.existing("run").await.unwrap().unwrap();
        assert_eq!(found, path);
        assert_eq!(stored, course);
        assert!(sink.existing("other").await.unwrap().is_none());
    }

    #[test]
    fn test_course_slug() {
        assert_eq!(course_slug("Intro to Rust!"), "intro_to_rust_");
        assert_eq!(course_slug("日本語"), "course");
    }
}
