//! Generation roles and the task prompts sent to them.
//!
//! Each stage talks to the model through a fixed `AgentRole`. The role picks
//! the system prompt; the functions below build the per-call task text.

use crate::model::{ChapterOutline, ModuleOutline, PlannedPage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminator the page-content task asks the model to end with.
pub const CONTENT_COMPLETE: &str = "CONTENT_COMPLETE";
/// Terminator the summary task asks the model to end with.
pub const SUMMARY_COMPLETE: &str = "SUMMARY_COMPLETE";
/// Terminator the quiz task asks the model to end with.
pub const QUIZ_COMPLETE: &str = "QUIZ_COMPLETE";

/// The roles a generation call can be made under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    CoursePlanner,
    PlanReviewer,
    ChapterPlanner,
    ContentCreator,
    SummaryCreator,
    QuizCreator,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::CoursePlanner,
        AgentRole::PlanReviewer,
        AgentRole::ChapterPlanner,
        AgentRole::ContentCreator,
        AgentRole::SummaryCreator,
        AgentRole::QuizCreator,
    ];

    /// Name used for this role in negotiation transcripts and logs.
    pub fn name(self) -> &'static str {
        match self {
            AgentRole::CoursePlanner => "course_planner",
            AgentRole::PlanReviewer => "course_plan_reviewer",
            AgentRole::ChapterPlanner => "chapter_planner",
            AgentRole::ContentCreator => "content_creator",
            AgentRole::SummaryCreator => "summary_creator",
            AgentRole::QuizCreator => "quiz_creator",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            AgentRole::CoursePlanner => include_str!("prompts/course_planner.txt"),
            AgentRole::PlanReviewer => include_str!("prompts/plan_reviewer.txt"),
            AgentRole::ChapterPlanner => include_str!("prompts/chapter_planner.txt"),
            AgentRole::ContentCreator => include_str!("prompts/content_creator.txt"),
            AgentRole::SummaryCreator => include_str!("prompts/summary_creator.txt"),
            AgentRole::QuizCreator => include_str!("prompts/quiz_creator.txt"),
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Seed task for the plan negotiation.
pub fn plan_task(transcript: &str) -> String {
    format!(
        "Create a course plan for the learner in this assessment conversation.\n\n\
         Assessment conversation:\n{transcript}\n\n\
         The course must cover the topic the learner asked about at the level they demonstrated."
    )
}

pub fn page_plan_task(module: &ModuleOutline, chapter: &ChapterOutline) -> String {
    format!(
        "Plan the pages for chapter '{}' of module '{}'.\n\
         Module description: {}\n\
         Chapter description: {}\n\n\
         Return the page plan in the specified JSON format.",
        chapter.title, module.name, module.description, chapter.description
    )
}

pub fn page_content_task(
    module: &ModuleOutline,
    chapter: &ChapterOutline,
    page: &PlannedPage,
) -> String {
    let mut task = format!(
        "Create content for the page '{}' in chapter '{}' of module '{}'.\n\
         Module description: {}\n\
         Chapter description: {}\n\
         Page description: {}\n",
        page.title, chapter.title, module.name, module.description, chapter.description,
        page.description
    );
    if !page.learning_objectives.is_empty() {
        task.push_str(&format!(
            "Learning objectives: {}\n",
            page.learning_objectives.join("; ")
        ));
    }
    if !page.key_concepts.is_empty() {
        task.push_str(&format!("Key concepts: {}\n", page.key_concepts.join("; ")));
    }
    task.push_str(&format!(
        "\nCreate engaging HTML content that fulfils the page description. \
         Include examples, explanations and practice exercises.\n\
         End with '{CONTENT_COMPLETE}'."
    ));
    task
}

pub fn summary_task(module: &ModuleOutline, chapter_titles: &[&str]) -> String {
    format!(
        "Create a summary for the module '{}'.\n\
         Module description: {}\n\
         Chapters: {}\n\n\
         Create a concise and informative summary.\n\
         End with '{SUMMARY_COMPLETE}'.",
        module.name,
        module.description,
        chapter_titles.join(", ")
    )
}

pub fn quiz_task(module: &ModuleOutline, chapter_titles: &[&str]) -> String {
    format!(
        "Create quiz questions for the module '{}'.\n\
         Module description: {}\n\
         Chapters: {}\n\n\
         Create comprehensive quiz questions in the specified JSON format.\n\
         End with '{QUIZ_COMPLETE}'.",
        module.name,
        module.description,
        chapter_titles.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> ModuleOutline {
        ModuleOutline {
            name: "Verbs".into(),
            description: "Conjugation".into(),
            chapters: vec![],
        }
    }

    #[test]
    fn test_every_role_has_a_prompt() {
        for role in AgentRole::ALL {
            assert!(!role.system_prompt().trim().is_empty(), "{role} has no prompt");
        }
        assert!(AgentRole::PlanReviewer.system_prompt().contains("APPROVE"));
    }

    #[test]
    fn test_page_content_task_mentions_terminator_and_objectives() {
        let chapter = ChapterOutline {
            title: "Preterite".into(),
            description: "Past tense".into(),
        };
        let page = PlannedPage {
            title: "Regular verbs".into(),
            description: "-ar, -er, -ir".into(),
            learning_objectives: vec!["conjugate hablar".into()],
            key_concepts: vec![],
        };
        let task = page_content_task(&module(), &chapter, &page);
        assert!(task.contains("'Regular verbs'"));
        assert!(task.contains("conjugate hablar"));
        assert!(!task.contains("Key concepts"));
        assert!(task.ends_with("End with 'CONTENT_COMPLETE'."));
    }

    #[test]
    fn test_module_tasks_list_chapters() {
        let summary = summary_task(&module(), &["A", "B"]);
        assert!(summary.contains("Chapters: A, B"));
        assert!(summary.contains(SUMMARY_COMPLETE));

        let quiz = quiz_task(&module(), &["A"]);
        assert!(quiz.contains(QUIZ_COMPLETE));
    }
}
