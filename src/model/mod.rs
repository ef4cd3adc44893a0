//! Domain entities persisted by the [`crate::store`] layer.
//!
//! These are semantic types, not row mirrors: JSON columns are surfaced as
//! `serde_json::Value`, timestamps as `chrono::DateTime<Utc>`, enums as
//! dedicated Rust enums with `encode`/`decode` helpers for their persisted
//! TEXT form.

mod approval;
mod job;
mod onboarding;
mod project;
mod template;
mod user;

pub use approval::{ApprovalStatus, StageApproval};
pub use job::{GenericJob, GenericJobStatus, StageJob, StageJobStatus};
pub use onboarding::{ConfirmationRequest, ConfirmationStatus, OnboardingData};
pub use project::{
    AutopilotMode, Project, ProjectStageState, ProjectStatus, StageStateStatus,
};
pub use template::{BlueprintRun, BlueprintRunStatus, TemplateRecord};
pub use user::{Availability, Role, User};
