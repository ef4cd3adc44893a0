//! Job records for the two queues.
//!
//! [`StageJob`] rows are scoped to `(project, stage)` and executed by the
//! stage worker; [`GenericJob`] rows carry a free-form `type` and drive the
//! template pipelines. Both are claimed under leases and retried with
//! exponential backoff; see [`crate::queue`] for the lifecycle functions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::stages::Stage;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageJobStatus {
    Queued,
    Running,
    Success,
    Failed,
    NeedsHuman,
    Canceled,
}

impl StageJobStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            StageJobStatus::Queued => "QUEUED",
            StageJobStatus::Running => "RUNNING",
            StageJobStatus::Success => "SUCCESS",
            StageJobStatus::Failed => "FAILED",
            StageJobStatus::NeedsHuman => "NEEDS_HUMAN",
            StageJobStatus::Canceled => "CANCELED",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(StageJobStatus::Queued),
            "RUNNING" => Some(StageJobStatus::Running),
            "SUCCESS" => Some(StageJobStatus::Success),
            "FAILED" => Some(StageJobStatus::Failed),
            "NEEDS_HUMAN" => Some(StageJobStatus::NeedsHuman),
            "CANCELED" => Some(StageJobStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageJobStatus::Success
                | StageJobStatus::Failed
                | StageJobStatus::NeedsHuman
                | StageJobStatus::Canceled
        )
    }
}

#[derive(Clone, Debug)]
pub struct StageJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub stage: Stage,
    pub status: StageJobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub payload: Value,
    pub error: Value,
    pub request_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenericJobStatus {
    Queued,
    Running,
    Retry,
    Success,
    Dead,
}

impl GenericJobStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            GenericJobStatus::Queued => "queued",
            GenericJobStatus::Running => "running",
            GenericJobStatus::Retry => "retry",
            GenericJobStatus::Success => "success",
            GenericJobStatus::Dead => "dead",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(GenericJobStatus::Queued),
            "running" => Some(GenericJobStatus::Running),
            "retry" => Some(GenericJobStatus::Retry),
            "success" => Some(GenericJobStatus::Success),
            "dead" => Some(GenericJobStatus::Dead),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, GenericJobStatus::Success | GenericJobStatus::Dead)
    }
}

#[derive(Clone, Debug)]
pub struct GenericJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub status: GenericJobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Unique across non-terminal statuses; duplicate enqueues return the
    /// existing job id.
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
