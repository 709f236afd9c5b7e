//! Configuration for the chronicle pipeline
//!
//! Loaded from a TOML file (default `chronicle.toml` in the working
//! directory). Command-line flags override individual fields after load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory containing snapshot zip files
    #[serde(default)]
    pub zip_directory: Option<String>,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,

    /// File extensions treated as binary and skipped while diffing.
    /// Empty means the built-in skiplist is used.
    #[serde(default)]
    pub binary_extensions: Vec<String>,

    /// Model registry: name -> provider configuration
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Default model name used when none is given on the command line
    #[serde(default)]
    pub current_engine: Option<String>,

    /// Retry and fallback policy
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Target directory for cache, progress files, logs, and reports
    #[serde(default = "default_output_directory")]
    pub directory: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

fn default_output_directory() -> String {
    "./output".to_string()
}

/// LLM provider platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    OpenAi,
}

/// Configuration for one model entry in the registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Which provider protocol this model speaks
    pub platform: Platform,
    /// Provider-side model identifier
    pub model: String,
    /// Default max-token budget for responses
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    8000
}

/// Retry policy. Task-specific fallback chains are nested tables, so
/// `retry.overview.fallback_models` overrides `retry.fallback_models`
/// for the `overview` task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Per-model attempt budget for malformed-response retries
    #[serde(default = "default_max_retries_per_model")]
    pub max_retries_per_model: u32,

    /// Global fallback model chain
    #[serde(default)]
    pub fallback_models: Vec<String>,

    /// Task-specific overrides
    #[serde(flatten)]
    pub tasks: HashMap<String, TaskRetryConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries_per_model: default_max_retries_per_model(),
            fallback_models: Vec::new(),
            tasks: HashMap::new(),
        }
    }
}

fn default_max_retries_per_model() -> u32 {
    3
}

/// Fallback chain override for a single task
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskRetryConfig {
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "cannot read configuration file {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("invalid configuration in {}: {e}", path.display())))
    }

    /// Apply command-line overrides on top of the file configuration.
    pub fn apply_overrides(
        &mut self,
        zip_dir: Option<&str>,
        output_dir: Option<&str>,
        model: Option<&str>,
    ) {
        if let Some(dir) = zip_dir {
            self.zip_directory = Some(dir.to_string());
        }
        if let Some(dir) = output_dir {
            self.output.directory = dir.to_string();
        }
        if let Some(model) = model {
            self.current_engine = Some(model.to_string());
        }
    }

    /// The configured zip directory, or an error if none was given.
    pub fn zip_directory(&self) -> Result<&str> {
        self.zip_directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "no zip_directory configured; use --zip-dir or set it in the config file"
                        .to_string(),
                )
            })
    }

    /// The output directory with `~` expanded, created if missing.
    pub fn output_directory(&self) -> Result<PathBuf> {
        let raw = &self.output.directory;
        let path = if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir()
                .ok_or_else(|| Error::Config("cannot resolve home directory".to_string()))?
                .join(rest)
        } else {
            PathBuf::from(raw)
        };
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// The default model name.
    pub fn current_engine(&self) -> Result<&str> {
        self.current_engine
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| {
                Error::Config("no current_engine configured and no --model given".to_string())
            })
    }

    /// Look up the registry entry for a model name.
    pub fn model_config(&self, name: &str) -> Result<&ModelConfig> {
        self.models.get(name).ok_or_else(|| {
            let mut available: Vec<&str> = self.models.keys().map(|k| k.as_str()).collect();
            available.sort_unstable();
            Error::Config(format!(
                "model '{name}' not found in configuration; available models: {available:?}"
            ))
        })
    }

    /// Fallback chain for a task: the task-specific list when present,
    /// otherwise the global list.
    pub fn fallback_models(&self, task: &str) -> &[String] {
        if let Some(task_cfg) = self.tasks_entry(task) {
            if !task_cfg.fallback_models.is_empty() {
                return &task_cfg.fallback_models;
            }
        }
        &self.retry.fallback_models
    }

    fn tasks_entry(&self, task: &str) -> Option<&TaskRetryConfig> {
        self.retry.tasks.get(task)
    }

    /// Per-model retry budget for malformed responses.
    pub fn max_retries_per_model(&self) -> u32 {
        self.retry.max_retries_per_model.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_config() -> Config {
        toml::from_str(
            r#"
            zip_directory = "/data/zips"
            current_engine = "sonnet"

            [output]
            directory = "./out"

            [models.sonnet]
            platform = "anthropic"
            model = "claude-sonnet-4-5"
            max_tokens = 8000

            [models.gpt]
            platform = "openai"
            model = "gpt-5-mini"

            [retry]
            max_retries_per_model = 2
            fallback_models = ["gpt"]

            [retry.overview]
            fallback_models = ["sonnet"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = sample_config();
        assert_eq!(cfg.zip_directory().unwrap(), "/data/zips");
        assert_eq!(cfg.current_engine().unwrap(), "sonnet");
        assert_eq!(cfg.output.directory, "./out");
        let sonnet = cfg.model_config("sonnet").unwrap();
        assert_eq!(sonnet.platform, Platform::Anthropic);
        assert_eq!(sonnet.max_tokens, 8000);
        let gpt = cfg.model_config("gpt").unwrap();
        assert_eq!(gpt.platform, Platform::OpenAi);
        assert_eq!(gpt.max_tokens, 8000, "max_tokens defaults to 8000");
    }

    #[test]
    fn test_unknown_model_lists_available() {
        let cfg = sample_config();
        let err = cfg.model_config("nope").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("'nope'"));
        assert!(msg.contains("sonnet"));
    }

    #[test]
    fn test_fallback_models_task_specific() {
        let cfg = sample_config();
        assert_eq!(cfg.fallback_models("overview"), ["sonnet".to_string()]);
        assert_eq!(cfg.fallback_models("unit"), ["gpt".to_string()]);
    }

    #[test]
    fn test_fallback_models_global_when_no_tasks() {
        let cfg: Config = toml::from_str(
            r#"
            [retry]
            fallback_models = ["a", "b"]
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.fallback_models("anything"),
            ["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.output.directory, "./output");
        assert_eq!(cfg.max_retries_per_model(), 3);
        assert!(cfg.fallback_models("x").is_empty());
        assert!(cfg.zip_directory().is_err());
        assert!(cfg.current_engine().is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut cfg = sample_config();
        cfg.apply_overrides(Some("/other"), Some("/tmp/out"), Some("gpt"));
        assert_eq!(cfg.zip_directory().unwrap(), "/other");
        assert_eq!(cfg.output.directory, "/tmp/out");
        assert_eq!(cfg.current_engine().unwrap(), "gpt");
    }

    #[test]
    fn test_apply_overrides_none_keeps_existing() {
        let mut cfg = sample_config();
        cfg.apply_overrides(None, None, None);
        assert_eq!(cfg.zip_directory().unwrap(), "/data/zips");
        assert_eq!(cfg.current_engine().unwrap(), "sonnet");
    }

    #[test]
    fn test_max_retries_floor_of_one() {
        let cfg: Config = toml::from_str(
            r#"
            [retry]
            max_retries_per_model = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_retries_per_model(), 1);
    }
}
