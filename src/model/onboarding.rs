//! Client onboarding data and confirmation requests.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// One row per project holding everything the client provides during
/// onboarding, plus the reminder bookkeeping driven by
/// [`crate::reminders`].
#[derive(Clone, Debug)]
pub struct OnboardingData {
    pub project_id: Uuid,
    pub contacts: Value,
    pub brand: Value,
    pub design_preferences: Value,
    pub compliance: Value,
    pub fundamentals: Value,
    pub feature_tags: Vec<String>,
    pub completion_percent: i64,
    /// Set when the client submits the form; readiness for the onboarding
    /// stage requires it.
    pub submitted_at: Option<DateTime<Utc>>,
    pub auto_reminder_enabled: bool,
    pub reminder_count: i64,
    pub last_reminder_sent_at: Option<DateTime<Utc>>,
    pub next_reminder_at: Option<DateTime<Utc>>,
    /// Per-project cadence override; policy default applies when `None`.
    pub reminder_interval_hours: Option<i64>,
    /// Fingerprint of the client-provided fields, folded into approval
    /// fingerprints so edits invalidate stale approvals.
    pub field_sentinels: String,
    pub selected_template_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Declined,
}

impl ConfirmationStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Confirmed => "confirmed",
            ConfirmationStatus::Declined => "declined",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConfirmationStatus::Pending),
            "confirmed" => Some(ConfirmationStatus::Confirmed),
            "declined" => Some(ConfirmationStatus::Declined),
            _ => None,
        }
    }
}

/// Client-visible request to approve a fallback template or substitute
/// artifact. The build readiness rule accepts a confirmed fallback in place
/// of a validated selected template.
#[derive(Clone, Debug)]
pub struct ConfirmationRequest {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub kind: String,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
