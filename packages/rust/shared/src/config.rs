//! Run configuration for a benchmark execution.
//!
//! The config lives in a single JSON file (conventionally
//! `benchmark-config.json`) next to the corpus it describes. Loading is
//! fail-fast: every invalid field produces a descriptive error naming the
//! field, and there are no silent fallbacks for invalid values. Serde
//! defaults exist only for *absent* optional tuning knobs.
//!
//! After validation, every relative path is resolved against the config
//! file's parent directory, producing a new immutable [`RunConfig`] — the
//! unresolved value is consumed, never mutated in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CcbenchError, Result};
use crate::types::{CANONICAL_CONDITION_ORDER, Condition};

/// Placeholder in the prompt template replaced with the question text.
pub const QUESTION_PLACEHOLDER: &str = "{question}";

/// Placeholder in the prompt template replaced with the assembled content.
pub const CONTENT_PLACEHOLDER: &str = "{content}";

// ---------------------------------------------------------------------------
// Config structs (matching benchmark-config.json schema)
// ---------------------------------------------------------------------------

/// Top-level run configuration, deserialized from JSON.
///
/// Immutable after [`RunConfig::load`]; revisions produce a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Config version string, recorded in the checkpoint for resume checks.
    pub version: String,

    /// Models to benchmark, in execution order.
    pub models: Vec<ModelConfig>,

    /// Sampling parameters shared by every inference request.
    pub inference: InferenceParams,

    /// The nine required path fields.
    pub paths: RunPaths,

    /// System prompt and user-message template.
    pub prompt: PromptConfig,

    /// Condition execution order. Must be exactly `["A", "B"]`.
    pub condition_order: Vec<Condition>,

    /// Content-assembly tuning knobs.
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Local inference endpoint descriptor.
    pub endpoint: EndpointConfig,
}

/// One benchmarked model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend model id, e.g. `qwen2.5:14b-instruct`.
    pub id: String,
    /// Tokenizer family key into the precomputed token-count table.
    pub family: String,
    /// Hard context-window limit the backend will honor for this model.
    pub max_context: u64,
}

/// Sampling parameters sent with every chat-completion request.
///
/// Deterministic by convention: a fixed seed and temperature 0 make retrying
/// a resolved request pointless, which is why the transport has no generic
/// retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceParams {
    pub temperature: f64,
    pub seed: i64,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    /// Output token budget per request.
    pub num_predict: u64,
    /// Fixed token allowance added on top of the measured input when sizing
    /// the per-request context window (prompt scaffolding, chat template).
    pub token_overhead: u64,
}

/// The nine required path fields. All relative paths are resolved against
/// the config file's directory by [`RunConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPaths {
    pub questions: PathBuf,
    pub site_list: PathBuf,
    pub archive_dir: PathBuf,
    pub archive_manifest: PathBuf,
    pub token_counts: PathBuf,
    pub results_csv: PathBuf,
    pub checkpoint: PathBuf,
    pub log_dir: PathBuf,
    pub scoring_dir: PathBuf,
}

/// System prompt and user-message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// System prompt sent verbatim with every request.
    pub system: String,
    /// User-message template. Must contain both `{question}` and `{content}`.
    pub template: String,
}

/// Content-assembly tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Extracted texts shorter than this are treated as "no renderable content".
    #[serde(default = "default_min_extract_chars")]
    pub min_extract_chars: usize,

    /// Maximum consecutive blank lines kept by Markdown preprocessing.
    #[serde(default = "default_max_blank_lines")]
    pub max_blank_lines: usize,

    /// Separator placed between extracted documents in Condition A.
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            min_extract_chars: default_min_extract_chars(),
            max_blank_lines: default_max_blank_lines(),
            separator: default_separator(),
        }
    }
}

fn default_min_extract_chars() -> usize {
    200
}
fn default_max_blank_lines() -> usize {
    2
}
fn default_separator() -> String {
    "\n\n---\n\n".into()
}

/// Which local-inference serving convention the endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    /// Ollama native API: `POST /api/chat`, health via `GET /api/tags`.
    Ollama,
    /// llama.cpp `llama-server`: OpenAI-compatible `POST /v1/chat/completions`.
    LlamaServer,
}

impl Engine {
    /// Stable tag written into the `inference_engine` result column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::LlamaServer => "llama-server",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local inference endpoint descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL, e.g. `http://localhost:11434`.
    pub base_url: String,

    /// Serving convention the endpoint speaks.
    pub engine: Engine,

    /// Hard per-request timeout, independent of cancellation.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Delay before the single connection-refused retry.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Throwaway prompts sent per model before real questions.
    #[serde(default = "default_warmup_prompts")]
    pub warmup_prompts: u32,
}

fn default_request_timeout_secs() -> u64 {
    300
}
fn default_retry_delay_secs() -> u64 {
    30
}
fn default_warmup_prompts() -> u32 {
    2
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl RunConfig {
    /// Load, validate, and path-resolve the run configuration.
    pub fn load(path: &Path) -> Result<RunConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| CcbenchError::io(path, e))?;

        let config: RunConfig = serde_json::from_str(&content).map_err(|e| {
            CcbenchError::config(format!("failed to parse {}: {e}", path.display()))
        })?;

        config.validate()?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        tracing::debug!(
            path = %path.display(),
            version = %config.version,
            models = config.models.len(),
            "run configuration loaded"
        );
        Ok(config.resolved_against(base))
    }

    /// Validate every field. Errors name the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(CcbenchError::config("version must be non-empty"));
        }

        if self.models.is_empty() {
            return Err(CcbenchError::config("models list is empty"));
        }
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.id.trim().is_empty() {
                return Err(CcbenchError::config("model id must be non-empty"));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(CcbenchError::config(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
            if model.family.trim().is_empty() {
                return Err(CcbenchError::config(format!(
                    "model '{}': family must be non-empty",
                    model.id
                )));
            }
            if model.max_context < 1024 {
                return Err(CcbenchError::config(format!(
                    "model '{}': max_context {} below the 1024 minimum",
                    model.id, model.max_context
                )));
            }
        }

        let p = &self.inference;
        if !(0.0..=2.0).contains(&p.temperature) {
            return Err(CcbenchError::config(format!(
                "inference.temperature {} outside [0, 2]",
                p.temperature
            )));
        }
        if !(p.top_p > 0.0 && p.top_p <= 1.0) {
            return Err(CcbenchError::config(format!(
                "inference.top_p {} outside (0, 1]",
                p.top_p
            )));
        }
        if p.top_k < 1 {
            return Err(CcbenchError::config("inference.top_k must be >= 1"));
        }
        if !(0.5..=2.0).contains(&p.repeat_penalty) {
            return Err(CcbenchError::config(format!(
                "inference.repeat_penalty {} outside [0.5, 2]",
                p.repeat_penalty
            )));
        }
        if p.num_predict < 1 {
            return Err(CcbenchError::config("inference.num_predict must be >= 1"));
        }

        for (name, path) in self.paths.iter() {
            if path.as_os_str().is_empty() {
                return Err(CcbenchError::config(format!(
                    "paths.{name} must be non-empty"
                )));
            }
        }

        if !self.prompt.template.contains(QUESTION_PLACEHOLDER) {
            return Err(CcbenchError::config(format!(
                "prompt.template missing the {QUESTION_PLACEHOLDER} placeholder"
            )));
        }
        if !self.prompt.template.contains(CONTENT_PLACEHOLDER) {
            return Err(CcbenchError::config(format!(
                "prompt.template missing the {CONTENT_PLACEHOLDER} placeholder"
            )));
        }

        if self.condition_order != CANONICAL_CONDITION_ORDER {
            return Err(CcbenchError::config(
                "condition_order must be exactly [\"A\", \"B\"]",
            ));
        }

        if self.endpoint.base_url.trim().is_empty() {
            return Err(CcbenchError::config("endpoint.base_url must be non-empty"));
        }

        Ok(())
    }

    /// Produce a new config with every relative path joined onto `base`.
    /// Consumes `self`: the unresolved value is discarded, never mutated.
    pub fn resolved_against(self, base: &Path) -> RunConfig {
        let resolve = |p: PathBuf| -> PathBuf {
            if p.is_absolute() { p } else { base.join(p) }
        };

        let RunConfig {
            version,
            models,
            inference,
            paths,
            prompt,
            condition_order,
            assembly,
            endpoint,
        } = self;

        RunConfig {
            version,
            models,
            inference,
            paths: RunPaths {
                questions: resolve(paths.questions),
                site_list: resolve(paths.site_list),
                archive_dir: resolve(paths.archive_dir),
                archive_manifest: resolve(paths.archive_manifest),
                token_counts: resolve(paths.token_counts),
                results_csv: resolve(paths.results_csv),
                checkpoint: resolve(paths.checkpoint),
                log_dir: resolve(paths.log_dir),
                scoring_dir: resolve(paths.scoring_dir),
            },
            prompt,
            condition_order,
            assembly,
            endpoint,
        }
    }

    /// Look up a model by id.
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }
}

impl RunPaths {
    /// Iterate (field name, path) pairs — used by validation and preflight.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &PathBuf)> {
        [
            ("questions", &self.questions),
            ("site_list", &self.site_list),
            ("archive_dir", &self.archive_dir),
            ("archive_manifest", &self.archive_manifest),
            ("token_counts", &self.token_counts),
            ("results_csv", &self.results_csv),
            ("checkpoint", &self.checkpoint),
            ("log_dir", &self.log_dir),
            ("scoring_dir", &self.scoring_dir),
        ]
        .into_iter()
    }

    /// The input paths that must already exist before a run starts.
    /// Output paths (results, checkpoint, logs, scoring) are created lazily.
    pub fn inputs(&self) -> impl Iterator<Item = (&'static str, &PathBuf)> {
        [
            ("questions", &self.questions),
            ("site_list", &self.site_list),
            ("archive_dir", &self.archive_dir),
            ("archive_manifest", &self.archive_manifest),
            ("token_counts", &self.token_counts),
        ]
        .into_iter()
    }
}

/// Render the user message for one request by substituting both placeholders.
pub fn render_prompt(template: &str, question_text: &str, content: &str) -> String {
    template
        .replace(QUESTION_PLACEHOLDER, question_text)
        .replace(CONTENT_PLACEHOLDER, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "version": "1.0",
            "models": [
                {"id": "qwen2.5:14b-instruct", "family": "qwen", "max_context": 32768}
            ],
            "inference": {
                "temperature": 0.0, "seed": 42, "top_p": 0.9, "top_k": 40,
                "repeat_penalty": 1.1, "num_predict": 2048, "token_overhead": 512
            },
            "paths": {
                "questions": "corpus/questions.json",
                "site_list": "corpus/site-list.csv",
                "archive_dir": "archive",
                "archive_manifest": "archive/manifest.json",
                "token_counts": "archive/token-counts.json",
                "results_csv": "results/results.csv",
                "checkpoint": "results/checkpoint.json",
                "log_dir": "logs",
                "scoring_dir": "scoring"
            },
            "prompt": {
                "system": "You answer questions from documentation.",
                "template": "Question: {question}\n\nDocumentation:\n{content}"
            },
            "condition_order": ["A", "B"],
            "endpoint": {"base_url": "http://localhost:11434", "engine": "ollama"}
        })
    }

    fn parse(v: serde_json::Value) -> RunConfig {
        serde_json::from_value(v).expect("deserialize config")
    }

    #[test]
    fn minimal_config_validates() {
        let config = parse(minimal_json());
        config.validate().expect("valid config");
        assert_eq!(config.endpoint.request_timeout_secs, 300);
        assert_eq!(config.endpoint.retry_delay_secs, 30);
        assert_eq!(config.assembly.min_extract_chars, 200);
    }

    #[test]
    fn empty_version_rejected() {
        let mut v = minimal_json();
        v["version"] = serde_json::json!("  ");
        let err = parse(v).validate().unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn duplicate_model_ids_rejected() {
        let mut v = minimal_json();
        v["models"] = serde_json::json!([
            {"id": "m1", "family": "qwen", "max_context": 8192},
            {"id": "m1", "family": "qwen", "max_context": 8192}
        ]);
        let err = parse(v).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate model id"));
    }

    #[test]
    fn out_of_range_temperature_rejected() {
        let mut v = minimal_json();
        v["inference"]["temperature"] = serde_json::json!(2.5);
        let err = parse(v).validate().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn top_p_zero_rejected() {
        let mut v = minimal_json();
        v["inference"]["top_p"] = serde_json::json!(0.0);
        assert!(parse(v).validate().is_err());
    }

    #[test]
    fn missing_placeholder_rejected() {
        let mut v = minimal_json();
        v["prompt"]["template"] = serde_json::json!("Question: {question}");
        let err = parse(v).validate().unwrap_err();
        assert!(err.to_string().contains("{content}"));
    }

    #[test]
    fn wrong_condition_order_rejected() {
        let mut v = minimal_json();
        v["condition_order"] = serde_json::json!(["B", "A"]);
        let err = parse(v).validate().unwrap_err();
        assert!(err.to_string().contains("condition_order"));
    }

    #[test]
    fn unknown_engine_fails_at_parse() {
        let mut v = minimal_json();
        v["endpoint"]["engine"] = serde_json::json!("vllm");
        let result: std::result::Result<RunConfig, _> = serde_json::from_value(v);
        assert!(result.is_err());
    }

    #[test]
    fn empty_path_field_rejected() {
        let mut v = minimal_json();
        v["paths"]["token_counts"] = serde_json::json!("");
        let err = parse(v).validate().unwrap_err();
        assert!(err.to_string().contains("token_counts"));
    }

    #[test]
    fn relative_paths_resolved_against_config_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("benchmark-config.json");
        std::fs::write(
            &config_path,
            serde_json::to_string_pretty(&minimal_json()).unwrap(),
        )
        .unwrap();

        let config = RunConfig::load(&config_path).expect("load");
        assert_eq!(
            config.paths.questions,
            dir.path().join("corpus/questions.json")
        );
        assert!(config.paths.archive_dir.is_absolute());
    }

    #[test]
    fn render_prompt_substitutes_both_placeholders() {
        let rendered = render_prompt("Q: {question}\nC: {content}", "why?", "because");
        assert_eq!(rendered, "Q: why?\nC: because");
    }
}
