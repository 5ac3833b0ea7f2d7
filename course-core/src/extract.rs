//! Pulling structured data and content out of free-form model output.
//!
//! Structured stages are strict: if nothing deserializes, they fail with an
//! `ExtractionError` and the retry executor asks again. Page content is soft
//! and always yields something.

use crate::model::{ChapterOutline, ModuleOutline, Outline};
use crate::prompts::{CONTENT_COMPLETE, QUIZ_COMPLETE, SUMMARY_COMPLETE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Output that could not be turned into the expected structure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no {expected} found in response")]
    NotFound { expected: &'static str },

    #[error("{expected} did not match the expected shape: {reason}")]
    Schema {
        expected: &'static str,
        reason: String,
    },
}

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```").expect("valid fence regex")
});

static HTML_DOCUMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<html\b.*?</html\s*>").expect("valid html regex"));

static HTML_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<body\b.*?</body\s*>").expect("valid body regex"));

const JSON_STRING: &str = r#""((?:[^"\\]|\\.)*)""#;

static COURSE_NAME_FIELD: Lazy<Regex> = Lazy::new(|| field_regex("course_name"));
static COURSE_DESCRIPTION_FIELD: Lazy<Regex> = Lazy::new(|| field_regex("course_description"));
static NAME_FIELD: Lazy<Regex> = Lazy::new(|| field_regex("name"));
static DESCRIPTION_FIELD: Lazy<Regex> = Lazy::new(|| field_regex("description"));
static CHAPTERS_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""chapters"\s*:"#).expect("valid chapters regex"));
static CHAPTER_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#""title"\s*:\s*{JSON_STRING}(?:\s*,\s*"description"\s*:\s*{JSON_STRING})?"#
    ))
    .expect("valid chapter regex")
});

fn field_regex(key: &str) -> Regex {
    Regex::new(&format!(r#""{key}"\s*:\s*{JSON_STRING}"#)).expect("valid field regex")
}

/// Deserialize the first structure in `text` that matches `T`.
///
/// Candidates are tried in order: fenced blocks labelled `json`, any other
/// fenced block, then every balanced `{...}` or `[...]` span in the text.
pub fn extract_structured<T: DeserializeOwned>(
    text: &str,
    expected: &'static str,
) -> Result<T, ExtractionError> {
    let mut schema_error = None;

    for candidate in json_candidates(text) {
        match serde_json::from_str::<serde_json::Value>(candidate) {
            Ok(value) => match serde_json::from_value::<T>(value) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    schema_error.get_or_insert_with(|| e.to_string());
                }
            },
            Err(_) => continue,
        }
    }

    Err(match schema_error {
        Some(reason) => ExtractionError::Schema { expected, reason },
        None => ExtractionError::NotFound { expected },
    })
}

fn json_candidates(text: &str) -> Vec<&str> {
    let mut labelled = Vec::new();
    let mut other = Vec::new();
    for caps in FENCE.captures_iter(text) {
        let (Some(label), Some(body)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if label.as_str().eq_ignore_ascii_case("json") {
            labelled.push(body.as_str().trim());
        } else {
            other.push(body.as_str().trim());
        }
    }
    labelled.extend(other);
    labelled.extend(balanced_spans(text));
    labelled
}

/// Every balanced `{...}` / `[...]` span, outermost first, string-aware.
fn balanced_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;

    while start < bytes.len() {
        if matches!(bytes[start], b'{' | b'[') {
            if let Some(end) = matching_close(bytes, start) {
                spans.push(&text[start..=end]);
            }
        }
        start += 1;
    }
    spans
}

fn matching_close(bytes: &[u8], open_at: usize) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open_at) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Last-resort outline recovery, one field at a time.
///
/// Used when a plan is almost JSON (trailing commas, truncated output).
/// Whatever modules and chapters can be recognised are kept; the caller
/// validates the result.
pub fn extract_outline_fields(text: &str) -> Option<Outline> {
    let name = first_string(&COURSE_NAME_FIELD, text)?;
    let description = first_string(&COURSE_DESCRIPTION_FIELD, text).unwrap_or_default();

    let module_starts: Vec<_> = NAME_FIELD
        .captures_iter(text)
        .filter_map(|caps| Some((caps.get(0)?.start(), caps.get(0)?.end(), caps.get(1)?)))
        .collect();

    let mut modules = Vec::new();
    for (i, (_, name_end, raw_name)) in module_starts.iter().enumerate() {
        let section_end = module_starts
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        let section = &text[*name_end..section_end];

        let (header, body) = match CHAPTERS_KEY.find(section) {
            Some(m) => (&section[..m.start()], &section[m.end()..]),
            None => (section, ""),
        };

        let chapters = CHAPTER_FIELD
            .captures_iter(body)
            .filter_map(|caps| {
                Some(ChapterOutline {
                    title: unescape(caps.get(1)?.as_str()),
                    description: caps
                        .get(2)
                        .map(|m| unescape(m.as_str()))
                        .unwrap_or_default(),
                })
            })
            .collect();

        modules.push(ModuleOutline {
            name: unescape(raw_name.as_str()),
            description: first_string(&DESCRIPTION_FIELD, header).unwrap_or_default(),
            chapters,
        });
    }

    Some(Outline {
        name,
        description,
        modules,
    })
}

fn first_string(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str()))
}

fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\""))
        .unwrap_or_else(|_| raw.to_string())
}

/// How a content fragment was recovered from a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    HtmlFence,
    HtmlDocument,
    HtmlBody,
    TagSpan,
    BeforeTerminator,
    Raw,
}

/// Recover the page content fragment. Never fails.
pub fn extract_content(text: &str) -> (String, ContentSource) {
    for caps in FENCE.captures_iter(text) {
        let (Some(label), Some(body)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if label.as_str().eq_ignore_ascii_case("html") && !body.as_str().trim().is_empty() {
            return (body.as_str().trim().to_string(), ContentSource::HtmlFence);
        }
    }

    if let Some(m) = HTML_DOCUMENT.find(text) {
        return (m.as_str().to_string(), ContentSource::HtmlDocument);
    }
    if let Some(m) = HTML_BODY.find(text) {
        return (m.as_str().to_string(), ContentSource::HtmlBody);
    }

    if let (Some(start), Some(end)) = (text.find('<'), text.rfind('>')) {
        if start < end {
            return (text[start..=end].to_string(), ContentSource::TagSpan);
        }
    }

    if let Some((before, _)) = text.split_once(CONTENT_COMPLETE) {
        let before = before.trim();
        if !before.is_empty() {
            return (before.to_string(), ContentSource::BeforeTerminator);
        }
    }

    (text.trim().to_string(), ContentSource::Raw)
}

/// Summary text with any completion marker and what follows it removed.
pub fn extract_summary(text: &str) -> String {
    let cut = text
        .split_once(SUMMARY_COMPLETE)
        .or_else(|| text.split_once(QUIZ_COMPLETE))
        .map(|(before, _)| before)
        .unwrap_or(text);
    cut.trim().to_string()
}
