//! Typed policy configuration.
//!
//! Policies live in the `admin_config` table as JSON documents keyed by
//! well-known names (`decision_policies_json`, `global_thresholds_json`,
//! `worker_concurrency_json`, `hitl_gates_json`). This module defines the
//! typed views with serde defaults so a missing or partial document always
//! yields a usable config, and the assembled [`PolicyBundle`] that
//! orchestrator entry points thread through domain logic — nothing in the
//! domain reads configuration from globals.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KEY_DECISION_POLICIES: &str = "decision_policies_json";
pub const KEY_GLOBAL_THRESHOLDS: &str = "global_thresholds_json";
pub const KEY_WORKER_CONCURRENCY: &str = "worker_concurrency_json";
pub const KEY_HITL_GATES: &str = "hitl_gates_json";

/// Autopilot decision policies (reminder cadence, retry caps, quality
/// floors). Defaults match the documented configuration keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPolicies {
    pub reminder_cadence_hours: i64,
    pub max_reminders: i64,
    pub idle_minutes: i64,
    pub build_retry_cap: i64,
    pub defect_cycle_cap: i64,
    pub pass_threshold_percent: f64,
    pub lighthouse_floor: LighthouseFloor,
    pub axe_block_severities: Vec<String>,
    pub axe_callout_max: i64,
    pub proof_pack_soft_mb: i64,
    pub proof_pack_hard_mb: i64,
    /// Pending approvals older than this are swept to `expired`.
    pub approval_expiry_days: i64,
}

impl Default for DecisionPolicies {
    fn default() -> Self {
        Self {
            reminder_cadence_hours: 24,
            max_reminders: 10,
            idle_minutes: 30,
            build_retry_cap: 3,
            defect_cycle_cap: 5,
            pass_threshold_percent: 98.0,
            lighthouse_floor: LighthouseFloor::default(),
            axe_block_severities: vec!["serious".into(), "critical".into()],
            axe_callout_max: 5,
            proof_pack_soft_mb: 25,
            proof_pack_hard_mb: 50,
            approval_expiry_days: 7,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LighthouseFloor {
    pub performance: f64,
    pub accessibility: f64,
    pub best_practices: f64,
    pub seo: f64,
}

impl Default for LighthouseFloor {
    fn default() -> Self {
        Self {
            performance: 90.0,
            accessibility: 95.0,
            best_practices: 90.0,
            seo: 90.0,
        }
    }
}

/// Global validation thresholds and worker timeouts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalThresholds {
    pub stage_timeouts_minutes: StageTimeouts,
    pub axe: AxeThresholds,
    pub content: ContentChecks,
    /// Extra keys (project quality overrides merge on top of these).
    #[serde(flatten)]
    pub extra: FxHashMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub build: i64,
    pub test: i64,
    pub defect_validation: i64,
    pub complete: i64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            build: 30,
            test: 15,
            defect_validation: 10,
            complete: 5,
        }
    }
}

impl StageTimeouts {
    /// Timeout for a stage in seconds, floored at 60.
    #[must_use]
    pub fn seconds_for(&self, stage: crate::stages::Stage) -> u64 {
        use crate::stages::Stage;
        let minutes = match stage {
            Stage::Build => self.build,
            Stage::Test => self.test,
            Stage::DefectValidation => self.defect_validation,
            Stage::Complete => self.complete,
            _ => 30,
        };
        (minutes.max(1) as u64 * 60).max(60)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AxeThresholds {
    pub critical_max: i64,
    pub serious_max: i64,
    pub moderate_max: i64,
}

impl Default for AxeThresholds {
    fn default() -> Self {
        Self {
            critical_max: 0,
            serious_max: 0,
            moderate_max: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentChecks {
    pub require_home: bool,
    pub require_cta: bool,
    pub require_contact_or_lead: bool,
    pub require_mobile_meta: bool,
}

impl Default for ContentChecks {
    fn default() -> Self {
        Self {
            require_home: true,
            require_cta: true,
            require_contact_or_lead: true,
            require_mobile_meta: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_parallel_jobs: usize,
    pub poll_interval_seconds: f64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 1,
            poll_interval_seconds: 2.0,
        }
    }
}

/// One HITL gate rule; a list of these forms the global policy and per-stage
/// project overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HitlGateRule {
    pub stage_key: String,
    /// `never` | `always` | `conditional`.
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions_json: Option<Value>,
}

/// Everything the orchestrator needs for one evaluation pass, assembled at
/// the entry point and passed down explicitly.
#[derive(Clone, Debug, Default)]
pub struct PolicyBundle {
    pub policies: DecisionPolicies,
    pub thresholds: GlobalThresholds,
    pub worker: WorkerSettings,
    pub hitl_gates: Vec<HitlGateRule>,
}

impl PolicyBundle {
    /// Deserialize a bundle from raw `admin_config` values, applying defaults
    /// for anything missing or malformed.
    #[must_use]
    pub fn from_values(
        policies: Option<Value>,
        thresholds: Option<Value>,
        worker: Option<Value>,
        hitl_gates: Option<Value>,
    ) -> Self {
        Self {
            policies: policies
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            thresholds: thresholds
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            worker: worker
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            hitl_gates: hitl_gates
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_policy() {
        let p = DecisionPolicies::default();
        assert_eq!(p.reminder_cadence_hours, 24);
        assert_eq!(p.max_reminders, 10);
        assert_eq!(p.defect_cycle_cap, 5);
        assert_eq!(p.build_retry_cap, 3);
        assert_eq!(p.approval_expiry_days, 7);
        let t = StageTimeouts::default();
        assert_eq!(t.build, 30);
        assert_eq!(t.test, 15);
    }

    #[test]
    fn partial_documents_fill_with_defaults() {
        let bundle = PolicyBundle::from_values(
            Some(json!({"max_reminders": 3})),
            None,
            Some(json!({"max_parallel_jobs": 4})),
            Some(json!([{"stage_key": "2_assignment", "mode": "always"}])),
        );
        assert_eq!(bundle.policies.max_reminders, 3);
        assert_eq!(bundle.policies.reminder_cadence_hours, 24);
        assert_eq!(bundle.worker.max_parallel_jobs, 4);
        assert_eq!(bundle.hitl_gates.len(), 1);
    }

    #[test]
    fn malformed_documents_fall_back_to_defaults() {
        let bundle = PolicyBundle::from_values(
            Some(json!("not an object")),
            Some(json!(17)),
            None,
            Some(json!({"not": "a list"})),
        );
        assert_eq!(bundle.policies.max_reminders, 10);
        assert!(bundle.hitl_gates.is_empty());
    }

    #[test]
    fn stage_timeout_floor_is_one_minute() {
        let t = StageTimeouts {
            complete: 0,
            ..Default::default()
        };
        assert_eq!(t.seconds_for(crate::stages::Stage::Complete), 60);
        assert_eq!(t.seconds_for(crate::stages::Stage::Build), 1800);
    }
}
