//! # Siteline: Delivery-Pipeline Orchestrator
//!
//! Siteline moves website-build projects through a fixed linear sequence of
//! stages (Sales → Onboarding → Assignment → Build → Test → Defect Validation
//! → Complete), deciding at every step whether to advance autonomously, pause
//! for human review, or block on missing inputs.
//!
//! ## Core Concepts
//!
//! - **Stages**: The fixed stage order and its valid-transition map
//! - **Delivery contract**: A versioned per-project JSON snapshot that feeds
//!   every gate decision
//! - **HITL gates**: Data-driven rules deciding when a human must approve a
//!   stage before autopilot proceeds
//! - **Job queues**: Durable, leased, retryable queues for stage work and
//!   template pipelines
//! - **Autopilot**: The per-project "what next" loop that ties the above
//!   together
//!
//! ## Quick Start
//!
//! ### Stage transitions
//!
//! ```
//! use siteline::stages::{Stage, can_transition, get_next_stage};
//!
//! // The success path follows the fixed order.
//! assert_eq!(get_next_stage(Stage::Build, true, false), Some(Stage::Test));
//!
//! // Rework loops back to Build from Test or Defect Validation.
//! assert_eq!(
//!     get_next_stage(Stage::DefectValidation, false, true),
//!     Some(Stage::Build),
//! );
//!
//! // Everything else is rejected.
//! assert!(!can_transition(Some(Stage::Sales), Stage::Build));
//! ```
//!
//! ### Gate conditions
//!
//! Gate policies are plain JSON condition trees evaluated against the
//! delivery contract:
//!
//! ```
//! use serde_json::json;
//! use siteline::conditions::evaluate_conditions;
//!
//! let tree = json!({"all": [
//!     {"path": "assignments.consultant_id", "op": "exists"},
//!     {"path": "quality.lighthouse.a11y", "op": ">=", "value": 95},
//! ]});
//! let contract = json!({
//!     "assignments": {"consultant_id": "u1"},
//!     "quality": {"lighthouse": {"a11y": 97}},
//! });
//!
//! let (passed, reasons) = evaluate_conditions(Some(&tree), &contract);
//! assert!(passed);
//! assert!(reasons.is_empty());
//! ```
//!
//! ## Module Guide
//!
//! - [`stages`] - Stage enumeration, stage keys, and the valid-next map
//! - [`conditions`] - Total, side-effect-free gate condition evaluator
//! - [`contract`] - Delivery contract projection and versioning
//! - [`hitl`] - Gate resolution and approval lifecycle
//! - [`assignment`] - Role-based auto-assignment scoring engine
//! - [`reminders`] - Escalating client reminder loop and HOLD policy
//! - [`orchestrator`] - Per-project autopilot and pipeline status
//! - [`queue`] - Stage-scoped and generic job queues plus the worker runtime
//! - [`templates`] - Blueprint generation, preview, validation, and metrics
//! - [`ai`] - Narrow AI collaborator interface with deterministic stubs
//! - [`collaborators`] - Email, object-storage, and validation-runner seams
//! - [`events`] - Notification bus for job/stage/approval changes
//! - [`store`] - SQLite persistence for every entity
//! - [`config`] - Typed policy configuration with optimistic concurrency

pub mod ai;
pub mod assignment;
pub mod collaborators;
pub mod conditions;
pub mod config;
pub mod contract;
pub mod events;
pub mod hitl;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod reminders;
pub mod stages;
pub mod store;
pub mod telemetry;
pub mod templates;
pub mod util;
