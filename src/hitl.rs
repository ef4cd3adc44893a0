//! HITL gate resolution, approval lifecycle, and invalidation.
//!
//! A gate is a data-driven rule `{stage_key, mode, approver_roles?,
//! conditions_json?}`. Project overrides win over the global policy; a stage
//! with no rule gets an implicit `{mode: never}`. Whether approval is
//! actually required also depends on the project's autopilot mode:
//!
//! | gate mode   | autopilot `full`          | `conditional` / default     |
//! |-------------|---------------------------|-----------------------------|
//! | never       | not required              | not required                |
//! | always      | required                  | required                    |
//! | conditional | not required              | required iff conditions fail|
//!
//! Only one `pending` approval exists per (project, stage_key). Its
//! `inputs_fingerprint` hashes the approval-relevant contract slice; after
//! any contract bump a differing fingerprint marks the row `invalidated` so
//! a decision is never made against stale inputs.

use chrono::{Duration, Utc};
use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::conditions::evaluate_conditions;
use crate::config::HitlGateRule;
use crate::model::{ApprovalStatus, AutopilotMode, StageApproval, StageStateStatus};
use crate::store::{PipelineStore, StoreError};
use crate::util::canonical::hash_parts;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("approval {0} not found")]
    #[diagnostic(code(siteline::hitl::approval_not_found))]
    ApprovalNotFound(Uuid),

    #[error("no pending approval for project {project_id} stage {stage_key}")]
    #[diagnostic(
        code(siteline::hitl::no_pending),
        help("Only pending approvals can be decided; re-run the orchestrator to issue one.")
    )]
    NoPendingApproval { project_id: Uuid, stage_key: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Project override (by stage_key) > global > implicit `{mode: never}`.
#[must_use]
pub fn resolve_gate_for_stage(
    stage_key: &str,
    global_rules: &[HitlGateRule],
    project_rules: &[HitlGateRule],
) -> HitlGateRule {
    project_rules
        .iter()
        .chain(global_rules.iter())
        .find(|rule| rule.stage_key == stage_key)
        .cloned()
        .unwrap_or_else(|| HitlGateRule {
            stage_key: stage_key.to_string(),
            mode: "never".to_string(),
            approver_roles: None,
            conditions_json: None,
        })
}

/// Apply the decision table. Returns `(required, reasons)`.
#[must_use]
pub fn should_require_approval(
    gate: &HitlGateRule,
    contract: &Value,
    autopilot_mode: AutopilotMode,
) -> (bool, Vec<String>) {
    let mode = gate.mode.trim().to_ascii_lowercase();

    // Full autopilot skips conditional gates but still respects always.
    if autopilot_mode == AutopilotMode::Full {
        if mode == "always" {
            return (true, vec!["Approval required by policy".to_string()]);
        }
        return (false, Vec::new());
    }

    match mode.as_str() {
        "always" => (true, vec!["Approval required by policy".to_string()]),
        "conditional" => {
            let (passed, failures) =
                evaluate_conditions(gate.conditions_json.as_ref(), contract);
            if passed {
                (false, Vec::new())
            } else if failures.is_empty() {
                (true, vec!["Gate conditions failed".to_string()])
            } else {
                (
                    true,
                    failures
                        .into_iter()
                        .map(|r| format!("Gate conditions failed: {r}"))
                        .collect(),
                )
            }
        }
        // "never" and anything unrecognized.
        _ => (false, Vec::new()),
    }
}

/// Hash the approval-relevant inputs for a stage: contract version plus the
/// onboarding/template/artifact/output identity markers the contract carries.
#[instrument(skip(store), err)]
pub async fn compute_inputs_fingerprint(
    store: &PipelineStore,
    project_id: Uuid,
    stage_key: &str,
) -> Result<String, GateError> {
    let mut parts: Vec<String> = vec![stage_key.to_string()];
    if let Some(row) = store.get_contract_row(project_id).await? {
        parts.push(format!("contract_v:{}", row.version));
        parts.push(format!("contract_hash:{}", row.content_hash));
    } else if let Some(project) = store.get_project(project_id).await? {
        parts.push(format!("p_updated:{}", project.updated_at.to_rfc3339()));
        if let Some(onboarding) = store.get_onboarding(project_id).await? {
            parts.push(format!("ob_sentinels:{}", onboarding.field_sentinels));
            parts.push(format!(
                "template:{}",
                onboarding
                    .selected_template_id
                    .map(|t| t.to_string())
                    .unwrap_or_default()
            ));
        }
        let artifacts = store.list_artifacts(project_id).await?;
        if !artifacts.is_empty() {
            parts.push(format!("art_count:{}", artifacts.len()));
            if let Some(last) = artifacts.iter().map(|a| a.created_at).max() {
                parts.push(format!("art_last:{}", last.to_rfc3339()));
            }
        }
        for output in store.latest_stage_outputs(project_id).await? {
            parts.push(format!("out_{}:{}", output.stage.encode(), output.id));
        }
    }
    Ok(hash_parts(&parts))
}

/// Create a pending approval for the stage, or refresh the snapshot and
/// fingerprint on the one that already exists.
#[instrument(skip(store, gate, reasons), err)]
pub async fn ensure_pending_approval(
    store: &PipelineStore,
    project_id: Uuid,
    stage_key: &str,
    gate: &HitlGateRule,
    reasons: &[String],
) -> Result<StageApproval, GateError> {
    let fingerprint = compute_inputs_fingerprint(store, project_id, stage_key).await?;
    let snapshot = json!({
        "gate": serde_json::to_value(gate).unwrap_or(Value::Null),
        "reasons": reasons,
    });
    let approval = store
        .upsert_pending_approval(project_id, stage_key, &snapshot, &fingerprint)
        .await?;
    Ok(approval)
}

/// Recompute fingerprints for every pending approval of the project; mark
/// stale ones `invalidated` and annotate the stage-state row.
#[instrument(skip(store), err)]
pub async fn invalidate_stale_approvals(
    store: &PipelineStore,
    project_id: Uuid,
) -> Result<usize, GateError> {
    let mut invalidated = 0;
    for approval in store.list_pending_approvals(project_id).await? {
        let fresh = compute_inputs_fingerprint(store, project_id, &approval.stage_key).await?;
        if fresh != approval.inputs_fingerprint {
            store
                .resolve_approval(approval.id, ApprovalStatus::Invalidated, None, None)
                .await?;
            if let Some(state) = store.get_stage_state(project_id, &approval.stage_key).await? {
                if state.status == StageStateStatus::AwaitingApproval {
                    store
                        .append_stage_blocked_reasons(
                            project_id,
                            &approval.stage_key,
                            &["Inputs changed; approval must be re-approved".to_string()],
                            Some(&["An approver must approve this stage".to_string()]),
                        )
                        .await?;
                }
            }
            invalidated += 1;
        }
    }
    Ok(invalidated)
}

/// Sweep pending approvals older than `expiry_days` to `expired`. Returns the
/// count expired.
#[instrument(skip(store), err)]
pub async fn expire_old_approvals(
    store: &PipelineStore,
    project_id: Option<Uuid>,
    expiry_days: i64,
) -> Result<usize, GateError> {
    let cutoff = Utc::now() - Duration::days(expiry_days.max(0));
    let stale = store.list_pending_approvals_before(cutoff, project_id).await?;
    let mut expired = 0;
    for approval in stale {
        store
            .resolve_approval(approval.id, ApprovalStatus::Expired, None, None)
            .await?;
        if let Some(state) = store
            .get_stage_state(approval.project_id, &approval.stage_key)
            .await?
        {
            if state.status == StageStateStatus::AwaitingApproval {
                store
                    .append_stage_blocked_reasons(
                        approval.project_id,
                        &approval.stage_key,
                        &["Approval request expired; please re-approve".to_string()],
                        None,
                    )
                    .await?;
            }
        }
        expired += 1;
    }
    Ok(expired)
}

/// Approve the pending approval for a stage. Flips the stage-state row to
/// `complete`; the caller (orchestrator) then re-evaluates and advances.
#[instrument(skip(store), err)]
pub async fn approve_stage(
    store: &PipelineStore,
    project_id: Uuid,
    stage_key: &str,
    approver_user_id: Option<Uuid>,
    comment: Option<&str>,
) -> Result<StageApproval, GateError> {
    let pending = store
        .get_pending_approval(project_id, stage_key)
        .await?
        .ok_or_else(|| GateError::NoPendingApproval {
            project_id,
            stage_key: stage_key.to_string(),
        })?;
    store
        .resolve_approval(pending.id, ApprovalStatus::Approved, approver_user_id, comment)
        .await?;
    store
        .set_stage_state(project_id, stage_key, StageStateStatus::Complete, &[], &[])
        .await?;
    store
        .add_audit(
            Some(project_id),
            approver_user_id,
            "STAGE_APPROVED",
            json!({"stage_key": stage_key, "comment": comment}),
        )
        .await?;
    store
        .get_approval(pending.id)
        .await?
        .ok_or(GateError::ApprovalNotFound(pending.id))
}

/// Reject the pending approval: the stage stays blocked with the reviewer's
/// comment recorded.
#[instrument(skip(store), err)]
pub async fn reject_stage(
    store: &PipelineStore,
    project_id: Uuid,
    stage_key: &str,
    approver_user_id: Option<Uuid>,
    comment: Option<&str>,
) -> Result<StageApproval, GateError> {
    let pending = store
        .get_pending_approval(project_id, stage_key)
        .await?
        .ok_or_else(|| GateError::NoPendingApproval {
            project_id,
            stage_key: stage_key.to_string(),
        })?;
    store
        .resolve_approval(pending.id, ApprovalStatus::Rejected, approver_user_id, comment)
        .await?;
    let reason = match comment {
        Some(comment) => format!("Approval rejected: {comment}"),
        None => "Approval rejected".to_string(),
    };
    store
        .set_stage_state(
            project_id,
            stage_key,
            StageStateStatus::Blocked,
            &[reason],
            &["Resolve reviewer feedback and request re-approval".to_string()],
        )
        .await?;
    store
        .add_audit(
            Some(project_id),
            approver_user_id,
            "STAGE_REJECTED",
            json!({"stage_key": stage_key, "comment": comment}),
        )
        .await?;
    store
        .get_approval(pending.id)
        .await?
        .ok_or(GateError::ApprovalNotFound(pending.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(stage_key: &str, mode: &str, conditions: Option<Value>) -> HitlGateRule {
        HitlGateRule {
            stage_key: stage_key.to_string(),
            mode: mode.to_string(),
            approver_roles: None,
            conditions_json: conditions,
        }
    }

    #[test]
    fn project_override_wins_over_global() {
        let global = vec![gate("3_build", "always", None)];
        let overrides = vec![gate("3_build", "never", None)];
        let resolved = resolve_gate_for_stage("3_build", &global, &overrides);
        assert_eq!(resolved.mode, "never");

        let resolved = resolve_gate_for_stage("4_test", &global, &overrides);
        assert_eq!(resolved.mode, "never"); // implicit
    }

    #[test]
    fn decision_table_full_autopilot() {
        let contract = json!({});
        let (required, _) =
            should_require_approval(&gate("3_build", "always", None), &contract, AutopilotMode::Full);
        assert!(required);
        let (required, _) = should_require_approval(
            &gate("3_build", "conditional", Some(json!({"all": [{"path": "x", "op": "exists"}]}))),
            &contract,
            AutopilotMode::Full,
        );
        assert!(!required, "full autopilot skips conditional gates");
    }

    #[test]
    fn conditional_gate_requires_approval_on_failure() {
        let rule = gate(
            "2_assignment",
            "conditional",
            Some(json!({"all": [{"path": "assignments.consultant_id", "op": "exists"}]})),
        );
        let (required, reasons) = should_require_approval(
            &rule,
            &json!({"assignments": {"consultant_id": null}}),
            AutopilotMode::Conditional,
        );
        assert!(required);
        assert_eq!(
            reasons,
            vec!["Gate conditions failed: assignments.consultant_id missing".to_string()]
        );

        let (required, reasons) = should_require_approval(
            &rule,
            &json!({"assignments": {"consultant_id": "u1"}}),
            AutopilotMode::Conditional,
        );
        assert!(!required);
        assert!(reasons.is_empty());
    }

    #[test]
    fn unknown_mode_never_requires() {
        let (required, _) = should_require_approval(
            &gate("3_build", "sometimes", None),
            &json!({}),
            AutopilotMode::Conditional,
        );
        assert!(!required);
    }
}
