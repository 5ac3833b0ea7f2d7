//! Pipeline configuration.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! runs_dir = "data/runs"
//! page_parallelism = 5
//!
//! [retry.page_content]
//! max_attempts = 2
//! base_delay_ms = 500
//! ```

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Retry policy for each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetry {
    pub plan: RetryPolicy,
    pub page_plan: RetryPolicy,
    pub page_content: RetryPolicy,
    pub summary: RetryPolicy,
    pub quiz: RetryPolicy,
}

impl Default for StageRetry {
    fn default() -> Self {
        let standard = RetryPolicy::new(3, Duration::from_secs(2));
        Self {
            plan: standard,
            page_plan: standard,
            page_content: RetryPolicy::new(3, Duration::from_secs(1)),
            summary: standard,
            quiz: standard,
        }
    }
}

impl StageRetry {
    /// The same policy for every stage.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            plan: policy,
            page_plan: policy,
            page_content: policy,
            summary: policy,
            quiz: policy,
        }
    }

    fn all(&self) -> [(&'static str, &RetryPolicy); 5] {
        [
            ("plan", &self.plan),
            ("page_plan", &self.page_plan),
            ("page_content", &self.page_content),
            ("summary", &self.summary),
            ("quiz", &self.quiz),
        ]
    }
}

/// Configuration for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root under which each run gets its own directory.
    pub runs_dir: PathBuf,

    /// Model to use (client default when unset).
    pub model: Option<String>,

    /// Maximum tokens per generation.
    pub max_tokens: usize,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Modules generated at once.
    pub module_parallelism: usize,

    /// Chapters generated at once within one module.
    pub chapter_parallelism: usize,

    /// Page-content calls in flight at once across the run.
    pub page_parallelism: usize,

    /// Planner/reviewer rounds before the plan negotiation gives up.
    pub max_negotiation_rounds: u32,

    pub retry: StageRetry,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("data/runs"),
            model: None,
            max_tokens: 8192,
            temperature: Some(0.7),
            module_parallelism: 3,
            chapter_parallelism: 3,
            page_parallelism: 3,
            max_negotiation_rounds: 10,
            retry: StageRetry::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let parallelism = [
            ("module_parallelism", self.module_parallelism),
            ("chapter_parallelism", self.chapter_parallelism),
            ("page_parallelism", self.page_parallelism),
        ];
        for (name, value) in parallelism {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.max_negotiation_rounds == 0 {
            return Err(ConfigError::Invalid(
                "max_negotiation_rounds must be at least 1".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be at least 1".into()));
        }
        for (stage, policy) in self.retry.all() {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retry.{stage}.max_attempts must be at least 1"
                )));
            }
        }
        Ok(())
    }

    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = dir.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set module, chapter and page parallelism in one go.
    pub fn with_parallelism(mut self, modules: usize, chapters: usize, pages: usize) -> Self {
        self.module_parallelism = modules;
        self.chapter_parallelism = chapters;
        self.page_parallelism = pages;
        self
    }

    pub fn with_max_negotiation_rounds(mut self, rounds: u32) -> Self {
        self.max_negotiation_rounds = rounds;
        self
    }

    pub fn with_retry(mut self, retry: StageRetry) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.module_parallelism, 3);
        assert_eq!(config.page_parallelism, 3);
        assert_eq!(config.max_negotiation_rounds, 10);
        assert_eq!(config.retry.plan, RetryPolicy::new(3, Duration::from_secs(2)));
        assert_eq!(config.retry.page_content.base_delay(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            runs_dir = "/tmp/runs"
            page_parallelism = 5

            [retry.page_content]
            max_attempts = 2
            base_delay_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.runs_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.page_parallelism, 5);
        assert_eq!(config.module_parallelism, 3);
        assert_eq!(config.retry.page_content.max_attempts, 2);
        assert_eq!(config.retry.quiz, RetryPolicy::new(3, Duration::from_secs(2)));
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let err = PipelineConfig::from_toml_str("module_parallelism = 0").unwrap_err();
        assert!(err.to_string().contains("module_parallelism"));

        let err = PipelineConfig::from_toml_str(
            "[retry.summary]\nmax_attempts = 0\nbase_delay_ms = 10",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry.summary"));

        assert!(PipelineConfig::new()
            .with_max_negotiation_rounds(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_unparseable_toml() {
        assert!(matches!(
            PipelineConfig::from_toml_str("page_parallelism = \"many\""),
            Err(ConfigError::Toml(_))
        ));
    }
}
