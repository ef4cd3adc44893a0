//! Stage approval records for HITL gates.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Approval lifecycle. At most one `Pending` row exists per
/// `(project, stage_key)`; `Approved` and `Rejected` are terminal, while
/// `Expired` and `Invalidated` allow a fresh pending row on the next
/// evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Invalidated,
}

impl ApprovalStatus {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Invalidated => "invalidated",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "expired" => Some(ApprovalStatus::Expired),
            "invalidated" => Some(ApprovalStatus::Invalidated),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StageApproval {
    pub id: Uuid,
    pub project_id: Uuid,
    pub stage_key: String,
    pub status: ApprovalStatus,
    pub approver_user_id: Option<Uuid>,
    pub comment: Option<String>,
    /// The gate rule as it looked when approval was requested.
    pub gate_snapshot: Value,
    /// Hash of the approval-relevant contract slice; a mismatch after a
    /// contract bump invalidates the pending row.
    pub inputs_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
