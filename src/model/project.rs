//! Project aggregate: lifecycle status, autopilot flags, and per-stage state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::stages::Stage;

/// Project lifecycle status. `Hold` and `NeedsReview` disable autopilot until
/// an operator intervenes; `Complete` is the happy-path terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectStatus {
    Draft,
    Active,
    Hold,
    NeedsReview,
    Complete,
    Archived,
    Paused,
    Cancelled,
}

impl ProjectStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            ProjectStatus::Draft => "DRAFT",
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::Hold => "HOLD",
            ProjectStatus::NeedsReview => "NEEDS_REVIEW",
            ProjectStatus::Complete => "COMPLETE",
            ProjectStatus::Archived => "ARCHIVED",
            ProjectStatus::Paused => "PAUSED",
            ProjectStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(ProjectStatus::Draft),
            "ACTIVE" => Some(ProjectStatus::Active),
            "HOLD" => Some(ProjectStatus::Hold),
            "NEEDS_REVIEW" => Some(ProjectStatus::NeedsReview),
            "COMPLETE" => Some(ProjectStatus::Complete),
            "ARCHIVED" => Some(ProjectStatus::Archived),
            "PAUSED" => Some(ProjectStatus::Paused),
            "CANCELLED" => Some(ProjectStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// How much the orchestrator may do without a human.
///
/// `Full` skips `conditional` gates (but still honors `always`);
/// `Conditional` is the default; `Off` disables autopilot entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutopilotMode {
    Off,
    #[default]
    Conditional,
    Full,
}

impl AutopilotMode {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            AutopilotMode::Off => "off",
            AutopilotMode::Conditional => "conditional",
            AutopilotMode::Full => "full",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "off" => Some(AutopilotMode::Off),
            "conditional" => Some(AutopilotMode::Conditional),
            "full" => Some(AutopilotMode::Full),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    pub client_name: String,
    /// Comma-separated client recipient list for reminder emails.
    pub client_emails: String,
    pub priority: String,
    pub status: ProjectStatus,
    pub current_stage: Stage,
    pub sales_user_id: Option<Uuid>,
    pub consultant_user_id: Option<Uuid>,
    pub builder_user_id: Option<Uuid>,
    pub tester_user_id: Option<Uuid>,
    pub manager_user_id: Option<Uuid>,
    pub autopilot_enabled: bool,
    pub autopilot_mode: AutopilotMode,
    pub autopilot_failure_count: i64,
    pub autopilot_lock_until: Option<DateTime<Utc>>,
    pub defect_cycle_count: i64,
    pub is_delayed: bool,
    pub features: Value,
    pub quality_overrides: Option<Value>,
    pub assignment_rationale: Option<Value>,
    /// Append-only transition log; the last entry's `to_stage` always equals
    /// `current_stage`.
    pub stage_history: Value,
    pub phase_start_dates: Value,
    pub hold_reason: Option<String>,
    pub needs_review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Whether this project is in a high-risk band for assignment purposes.
    #[must_use]
    pub fn is_high_priority(&self) -> bool {
        matches!(self.priority.to_ascii_uppercase().as_str(), "HIGH" | "CRITICAL")
    }

    /// Only ACTIVE/DRAFT projects auto-advance; HOLD and NEEDS_REVIEW are
    /// explicit operator territory.
    #[must_use]
    pub fn is_autopilot_eligible(&self, now: DateTime<Utc>) -> bool {
        if matches!(
            self.status,
            ProjectStatus::Hold | ProjectStatus::NeedsReview
        ) {
            return false;
        }
        if !matches!(self.status, ProjectStatus::Active | ProjectStatus::Draft) {
            return false;
        }
        if !self.autopilot_enabled || self.autopilot_mode == AutopilotMode::Off {
            return false;
        }
        match self.autopilot_lock_until {
            Some(until) if until > now => false,
            _ => true,
        }
    }
}

/// Per-(project, stage_key) progress row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageStateStatus {
    NotStarted,
    Ready,
    Running,
    AwaitingApproval,
    Complete,
    Blocked,
    Failed,
}

impl StageStateStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            StageStateStatus::NotStarted => "not_started",
            StageStateStatus::Ready => "ready",
            StageStateStatus::Running => "running",
            StageStateStatus::AwaitingApproval => "awaiting_approval",
            StageStateStatus::Complete => "complete",
            StageStateStatus::Blocked => "blocked",
            StageStateStatus::Failed => "failed",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(StageStateStatus::NotStarted),
            "ready" => Some(StageStateStatus::Ready),
            "running" => Some(StageStateStatus::Running),
            "awaiting_approval" => Some(StageStateStatus::AwaitingApproval),
            "complete" => Some(StageStateStatus::Complete),
            "blocked" => Some(StageStateStatus::Blocked),
            "failed" => Some(StageStateStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProjectStageState {
    pub id: Uuid,
    pub project_id: Uuid,
    pub stage_key: String,
    pub status: StageStateStatus,
    pub blocked_reasons: Vec<String>,
    pub required_actions: Vec<String>,
    pub last_job_id: Option<Uuid>,
    pub evidence: Value,
    pub updated_at: DateTime<Utc>,
}
