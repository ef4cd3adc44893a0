//! Template registry records and blueprint pipeline state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// A registered site template: blueprint, preview, validation, and
/// aggregated performance state all hang off this row.
#[derive(Clone, Debug)]
pub struct TemplateRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub category: Option<String>,
    pub style: Option<String>,
    pub version: i64,
    /// `draft` until the blueprint passes the rubric, then `validated`.
    pub status: String,
    pub is_active: bool,
    pub feature_tags: Vec<String>,
    pub default_config: Option<Value>,
    pub meta: Option<Value>,
    pub blueprint: Option<Value>,
    pub blueprint_hash: Option<String>,
    pub blueprint_quality: Option<Value>,
    pub prompt_log: Value,
    pub preview_url: Option<String>,
    pub preview_thumbnail_url: Option<String>,
    pub preview_status: String,
    pub preview_error: Option<String>,
    pub preview_last_generated_at: Option<DateTime<Utc>>,
    pub validation_status: String,
    pub validation_results: Option<Value>,
    /// Keyed by `(blueprint_hash, preview_url, thresholds)`; identical inputs
    /// skip a re-run.
    pub validation_hash: Option<String>,
    pub validation_last_run_at: Option<DateTime<Utc>>,
    pub performance_metrics: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlueprintRunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl BlueprintRunStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            BlueprintRunStatus::Queued => "queued",
            BlueprintRunStatus::Running => "running",
            BlueprintRunStatus::Success => "success",
            BlueprintRunStatus::Failed => "failed",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BlueprintRunStatus::Queued),
            "running" => Some(BlueprintRunStatus::Running),
            "success" => Some(BlueprintRunStatus::Success),
            "failed" => Some(BlueprintRunStatus::Failed),
            _ => None,
        }
    }
}

/// One generate→critique→refine execution for a template.
#[derive(Clone, Debug)]
pub struct BlueprintRun {
    pub id: Uuid,
    pub template_id: Uuid,
    pub status: BlueprintRunStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error_text: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
