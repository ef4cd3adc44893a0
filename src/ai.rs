//! AI collaborator interface.
//!
//! The core depends on one narrow seam: given a prompt and a task tag,
//! return a JSON string or fail. Implementations may wrap a real model or
//! the deterministic [`StubAiClient`]; nothing in the pipeline parses
//! partial output — responses are stripped of Markdown code fences and then
//! JSON-parsed, with at most one repair pass allowed (a template-subsystem
//! policy, see [`crate::templates`]). Raw output is persisted only after
//! secret redaction.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;

use crate::util::redact::redact_secrets;

#[derive(Debug, Error, Diagnostic)]
pub enum AiError {
    #[error("AI provider error ({task}): {message}")]
    #[diagnostic(code(siteline::ai::provider))]
    Provider { task: String, message: String },

    #[error("AI output was not valid JSON ({task}): {redacted_output}")]
    #[diagnostic(
        code(siteline::ai::parse),
        help("One repair pass is allowed; persistent failures fail the job.")
    )]
    Parse {
        task: String,
        /// Raw output after secret redaction, truncated for storage.
        redacted_output: String,
    },
}

/// Which task tags go to a real model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AiMode {
    /// Always answer from the deterministic stub.
    #[default]
    Disabled,
    /// Stub except for a whitelist of task tags.
    Basic(Vec<String>),
    /// Model for all task tags.
    Full,
}

impl AiMode {
    #[must_use]
    pub fn uses_model(&self, task: &str) -> bool {
        match self {
            AiMode::Disabled => false,
            AiMode::Basic(allowed) => allowed.iter().any(|t| t == task),
            AiMode::Full => true,
        }
    }
}

/// Prompt in, JSON string out. Implementations must be cheap to share.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, task: &str, prompt: &str) -> Result<String, AiError>;
}

/// Strip Markdown code fences and parse the remainder as JSON.
///
/// Returns [`AiError::Parse`] with the redacted raw output on failure.
pub fn parse_ai_json(task: &str, raw: &str) -> Result<Value, AiError> {
    let mut text = raw.trim();
    for fence in ["```json", "```"] {
        if let Some(rest) = text.strip_prefix(fence) {
            text = rest.trim();
        }
        if let Some(rest) = text.strip_suffix("```") {
            text = rest.trim();
        }
    }
    serde_json::from_str(text).map_err(|_| AiError::Parse {
        task: task.to_string(),
        redacted_output: {
            let redacted = redact_secrets(raw);
            redacted.chars().take(2000).collect()
        },
    })
}

/// Deterministic stub returning fixed, schema-conforming shapes per task tag.
///
/// Used in tests and whenever [`AiMode`] routes a task away from the model.
#[derive(Clone, Debug, Default)]
pub struct StubAiClient;

#[async_trait]
impl AiClient for StubAiClient {
    async fn complete(&self, task: &str, _prompt: &str) -> Result<String, AiError> {
        let value = match task {
            "blueprint.generate" => stub_blueprint(),
            "blueprint.critique" => json!({
                "scorecard": {
                    "conversion": 82,
                    "clarity": 80,
                    "accessibility_heuristics": 85,
                    "completeness": 84,
                    "consistency": 80,
                },
                "hard_checks": {},
                "issues": [],
                "summary": "Solid baseline blueprint; no blocking issues.",
            }),
            "blueprint.refine" => stub_blueprint(),
            "assignment.rerank" => json!({
                "ranked_user_ids": [],
                "reasoning": "Deterministic order preserved.",
            }),
            "seo.validate" => json!({"passed": true, "issues": []}),
            _ => json!({}),
        };
        Ok(value.to_string())
    }
}

fn stub_blueprint() -> Value {
    json!({
        "schema_version": 1,
        "meta": {"name": "Starter", "category": "general", "style": "modern"},
        "tokens": {"colors": {"primary": "#1a1a2e"}, "typography": {"base": "Inter"}, "spacing": {"unit": 8}},
        "navigation": {"style": "topbar", "items": [{"label": "Home", "href": "home"}]},
        "footer": {"columns": []},
        "pages": [
            {"slug": "home", "title": "Home", "sections": [
                {"type": "hero", "headline": "Welcome"},
                {"type": "contact_form"},
            ]},
        ],
        "forms": {"lead": {"enabled": true}},
        "constraints": {"mobile_first": true, "wcag_target": "AA", "seo_basics": true},
    })
}
