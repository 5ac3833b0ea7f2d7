//! Course data model.
//!
//! The outline types come out of the plan negotiation; the content types are
//! what the stages produce and the assembler folds into a `Course`. Field
//! aliases accept the snake_case names the generation prompts ask for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The approved course outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    #[serde(alias = "course_name")]
    pub name: String,

    #[serde(default, alias = "course_description")]
    pub description: String,

    #[serde(default)]
    pub modules: Vec<ModuleOutline>,
}

/// A planned module and its chapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleOutline {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub chapters: Vec<ChapterOutline>,
}

/// A planned chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterOutline {
    pub title: String,

    #[serde(default)]
    pub description: String,
}

impl Outline {
    /// Check the structural invariants every later stage relies on.
    ///
    /// Module names and chapter titles are checkpoint key components, so they
    /// must be non-empty and unique within their parent.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("course name is empty".to_string());
        }
        if self.modules.is_empty() {
            return Err("outline has no modules".to_string());
        }

        let mut module_names = std::collections::HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err("a module has an empty name".to_string());
            }
            if !module_names.insert(module.name.as_str()) {
                return Err(format!("duplicate module name '{}'", module.name));
            }
            if module.chapters.is_empty() {
                return Err(format!("module '{}' has no chapters", module.name));
            }

            let mut titles = std::collections::HashSet::new();
            for chapter in &module.chapters {
                if chapter.title.trim().is_empty() {
                    return Err(format!(
                        "module '{}' has a chapter with an empty title",
                        module.name
                    ));
                }
                if !titles.insert(chapter.title.as_str()) {
                    return Err(format!(
                        "module '{}' repeats chapter '{}'",
                        module.name, chapter.title
                    ));
                }
            }
        }
        Ok(())
    }

    /// Total number of chapters across all modules.
    pub fn chapter_count(&self) -> usize {
        self.modules.iter().map(|m| m.chapters.len()).sum()
    }
}

/// The page breakdown of one chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePlan {
    pub pages: Vec<PlannedPage>,
}

/// One planned page, before its content exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPage {
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, alias = "learningObjectives")]
    pub learning_objectives: Vec<String>,

    #[serde(default, alias = "keyConcepts")]
    pub key_concepts: Vec<String>,
}

impl PlannedPage {
    /// The empty page this plan entry describes.
    pub fn to_page(&self) -> Page {
        Page {
            title: self.title.clone(),
            description: self.description.clone(),
            content: String::new(),
        }
    }
}

/// A page with its rendered content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub title: String,
    pub description: String,
    /// Rendered HTML fragment.
    pub content: String,
}

/// A chapter with its surviving pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub description: String,
    pub pages: Vec<Page>,
}

/// A single quiz question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizItem {
    #[serde(alias = "question_type", default = "default_quiz_kind")]
    pub kind: String,

    #[serde(alias = "question")]
    pub prompt: String,

    #[serde(default, alias = "multiple_choice", alias = "options")]
    pub choices: Vec<String>,

    #[serde(alias = "answer", alias = "correctChoice")]
    pub correct_choice: String,
}

fn default_quiz_kind() -> String {
    "multiple_choice".to_string()
}

/// A finished module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub description: String,
    pub chapters: Vec<Chapter>,
    pub summary: String,
    pub quiz: Vec<QuizItem>,
}

/// The terminal artifact of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub modules: Vec<Module>,
}

impl Course {
    pub fn page_count(&self) -> usize {
        self.modules
            .iter()
            .flat_map(|m| &m.chapters)
            .map(|c| c.pages.len())
            .sum()
    }
}

/// Units dropped during a run, by level.
///
/// Chapters are identified as `module / chapter` and pages as
/// `module / chapter / page`, since titles only need to be unique within
/// their parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailureReport {
    pub modules: Vec<String>,
    pub chapters: Vec<String>,
    pub pages: Vec<String>,
}

impl RunFailureReport {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.chapters.is_empty() && self.pages.is_empty()
    }

    /// Append another report, keeping order.
    pub fn merge(&mut self, other: RunFailureReport) {
        self.modules.extend(other.modules);
        self.chapters.extend(other.chapters);
        self.pages.extend(other.pages);
    }

    pub(crate) fn chapter_id(module: &str, chapter: &str) -> String {
        format!("{module} / {chapter}")
    }

    pub(crate) fn page_id(module: &str, chapter: &str, page: &str) -> String {
        format!("{module} / {chapter} / {page}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline() -> Outline {
        Outline {
            name: "Rust".into(),
            description: "Learn Rust".into(),
            modules: vec![ModuleOutline {
                name: "Basics".into(),
                description: String::new(),
                chapters: vec![ChapterOutline {
                    title: "Ownership".into(),
                    description: String::new(),
                }],
            }],
        }
    }

    #[test]
    fn test_outline_accepts_prompt_field_names() {
        let json = r#"{
            "course_name": "Spanish",
            "course_description": "Intermediate grammar",
            "modules": [{
                "name": "Verbs",
                "description": "d",
                "chapters": [{"title": "Preterite", "description": "past"}]
            }]
        }"#;
        let outline: Outline = serde_json::from_str(json).unwrap();
        assert_eq!(outline.name, "Spanish");
        assert_eq!(outline.modules[0].chapters[0].title, "Preterite");
        assert!(outline.validate().is_ok());
    }

    #[test]
    fn test_outline_validation() {
        assert!(outline().validate().is_ok());

        let mut no_chapters = outline();
        no_chapters.modules[0].chapters.clear();
        assert!(no_chapters.validate().unwrap_err().contains("no chapters"));

        let mut blank_title = outline();
        blank_title.modules[0].chapters[0].title = "  ".into();
        assert!(blank_title.validate().unwrap_err().contains("empty title"));

        let mut duplicate = outline();
        let copy = duplicate.modules[0].clone();
        duplicate.modules.push(copy);
        assert!(duplicate.validate().unwrap_err().contains("duplicate"));

        let mut empty = outline();
        empty.modules.clear();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_quiz_item_aliases() {
        let json = r#"{
            "question_type": "multiple_choice",
            "question": "2+2?",
            "multiple_choice": ["3", "4"],
            "answer": "4"
        }"#;
        let item: QuizItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.prompt, "2+2?");
        assert_eq!(item.choices, vec!["3", "4"]);
        assert_eq!(item.correct_choice, "4");
    }

    #[test]
    fn test_planned_page_camel_case() {
        let json = r#"{
            "title": "Intro",
            "description": "d",
            "learningObjectives": ["a"],
            "keyConcepts": ["b"]
        }"#;
        let page: PlannedPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.learning_objectives, vec!["a"]);
        assert_eq!(page.key_concepts, vec!["b"]);
        assert!(page.to_page().content.is_empty());
    }

    #[test]
    fn test_failure_report_merge() {
        let mut report = RunFailureReport::default();
        assert!(report.is_empty());
        report.merge(RunFailureReport {
            modules: vec![],
            chapters: vec![RunFailureReport::chapter_id("M", "C")],
            pages: vec![RunFailureReport::page_id("M", "C", "P")],
        });
        assert_eq!(report.chapters, vec!["M / C"]);
        assert_eq!(report.pages, vec!["M / C / P"]);
        assert!(!report.is_empty());
    }
}
