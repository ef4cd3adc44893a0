//! Pipeline orchestrator: the per-project "what next" decision.
//!
//! Invoked on demand (API call, stage-job completion) and periodically by
//! the sweeper. One pass walks the project forward from its current stage:
//! readiness check → HITL gate → action, where the action is either an
//! immediate transition (side-effect-free stages) or a stage-job enqueue
//! (BUILD / TEST / DEFECT_VALIDATION) followed by a stop to wait for the
//! worker. Rework out of defect validation increments the defect-cycle
//! counter; pushing past the cap parks the project in NEEDS_REVIEW.
//!
//! Entry points never raise for transient issues: the reason lands on the
//! stage-state row and the pass returns a status object. Internal errors
//! feed autopilot failure accounting (counter + lock backoff, NEEDS_REVIEW
//! after three consecutive failures; the counter resets on any applied
//! transition).

use chrono::{Duration as ChronoDuration, Utc};
use miette::Diagnostic;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::assignment::{AssignmentOutcome, run_auto_assignment};
use crate::conditions::value_at_path;
use crate::config::PolicyBundle;
use crate::contract::{create_or_update_contract, get_contract};
use crate::hitl::{
    ensure_pending_approval, expire_old_approvals, invalidate_stale_approvals,
    resolve_gate_for_stage, should_require_approval,
};
use crate::model::{
    ApprovalStatus, Project, ProjectStatus, StageApproval, StageJobStatus, StageStateStatus,
};
use crate::queue::WorkerContext;
use crate::queue::stage_jobs::{enqueue_stage_job, list_stage_jobs};
use crate::reminders::run_reminder_scan;
use crate::stages::Stage;
use crate::store::StoreError;

/// Consecutive autopilot failures before the project is parked.
const AUTOPILOT_FAILURE_LIMIT: i64 = 3;
/// Safety bound on one pass; the stage order is only seven long.
const MAX_STEPS_PER_PASS: usize = 10;

#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Contract(#[from] crate::contract::ContractError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gate(#[from] crate::hitl::GateError),
}

/// What one orchestrator pass decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Project is not autopilot-eligible (status, mode, or lock).
    NotEligible(String),
    /// A stage is blocked; reasons recorded on its state row.
    Blocked { stage_key: String, reasons: Vec<String> },
    /// Waiting on a human approval for this stage.
    AwaitingApproval { stage_key: String },
    /// A stage job was enqueued (or is already in flight) and the pass
    /// stopped to wait for the worker.
    WaitingOnJob { stage_key: String, job_id: Option<Uuid> },
    /// Defect-cycle cap exceeded or repeated failures; project parked.
    NeedsReview { reason: String },
    /// The project reached COMPLETE.
    Completed,
    /// Transitions were applied and the pass ran out of work to do
    /// without hitting a stop condition.
    Advanced { to_stage: String },
}

#[derive(Clone, Debug)]
pub struct AdvanceSummary {
    pub project_id: Uuid,
    pub outcome: AdvanceOutcome,
    pub transitions_applied: usize,
    pub contract_version: i64,
}

/// Flattened pipeline view for the API collaborator.
#[derive(Clone, Debug)]
pub struct PipelineStatus {
    pub project_id: Uuid,
    pub status: ProjectStatus,
    pub current_stage: Stage,
    pub stage_states: Vec<crate::model::ProjectStageState>,
    pub pending_approvals: Vec<StageApproval>,
    pub blocked_summary: Vec<String>,
    pub next_ready_stages: Vec<String>,
    pub hold_reason: Option<String>,
    pub needs_review_reason: Option<String>,
}

pub struct Orchestrator {
    ctx: WorkerContext,
}

impl Orchestrator {
    #[must_use]
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// One autopilot pass for a project. Never raises for domain-level
    /// blockers; internal errors are absorbed into failure accounting.
    #[instrument(skip(self), err)]
    pub async fn auto_advance(
        &self,
        project_id: Uuid,
        trigger: &str,
    ) -> Result<AdvanceSummary, OrchestratorError> {
        match self.advance_inner(project_id, trigger).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                warn!(%project_id, %err, "autopilot pass errored");
                self.record_failure(project_id).await?;
                Ok(AdvanceSummary {
                    project_id,
                    outcome: AdvanceOutcome::Blocked {
                        stage_key: String::new(),
                        reasons: vec![format!("Autopilot error: {err}")],
                    },
                    transitions_applied: 0,
                    contract_version: 0,
                })
            }
        }
    }

    async fn advance_inner(
        &self,
        project_id: Uuid,
        trigger: &str,
    ) -> Result<AdvanceSummary, OrchestratorError> {
        let store = &self.ctx.store;
        let Some(project) = store.get_project(project_id).await? else {
            return Ok(AdvanceSummary {
                project_id,
                outcome: AdvanceOutcome::NotEligible("Project not found".to_string()),
                transitions_applied: 0,
                contract_version: 0,
            });
        };
        let now = Utc::now();
        if !project.is_autopilot_eligible(now) {
            let reason = match project.status {
                ProjectStatus::Hold => "Project on HOLD".to_string(),
                ProjectStatus::NeedsReview => "Project needs review".to_string(),
                _ if project.autopilot_lock_until.is_some_and(|t| t > now) => {
                    "Autopilot backing off after failures".to_string()
                }
                _ => "Autopilot disabled".to_string(),
            };
            return Ok(AdvanceSummary {
                project_id,
                outcome: AdvanceOutcome::NotEligible(reason),
                transitions_applied: 0,
                contract_version: 0,
            });
        }

        store.ensure_stage_states(project_id).await?;
        let contract_version = create_or_update_contract(store, project_id, trigger).await?;
        if contract_version.bumped {
            invalidate_stale_approvals(store, project_id).await?;
        }
        let bundle = store.load_policy_bundle().await?;
        let overrides = store.get_project_hitl_overrides(project_id).await?;

        let mut transitions_applied = 0usize;
        let mut outcome = AdvanceOutcome::Advanced {
            to_stage: project.current_stage.key().to_string(),
        };

        for _ in 0..MAX_STEPS_PER_PASS {
            let Some(project) = store.get_project(project_id).await? else {
                break;
            };
            let stage = project.current_stage;
            let stage_key = stage.key();

            if stage == Stage::Complete && project.status == ProjectStatus::Complete {
                outcome = AdvanceOutcome::Completed;
                break;
            }

            // Readiness first: a stage that is not ready blocks the pass.
            let readiness = self.stage_readiness(&project, &bundle).await?;
            let action = match readiness {
                Readiness::Blocked { reasons, actions } => {
                    store
                        .set_stage_state(
                            project_id,
                            stage_key,
                            StageStateStatus::Blocked,
                            &reasons,
                            &actions,
                        )
                        .await?;
                    outcome = AdvanceOutcome::Blocked {
                        stage_key: stage_key.to_string(),
                        reasons,
                    };
                    break;
                }
                Readiness::Waiting { job_id } => {
                    outcome = AdvanceOutcome::WaitingOnJob {
                        stage_key: stage_key.to_string(),
                        job_id,
                    };
                    break;
                }
                Readiness::NeedsJob => StageAction::Enqueue,
                Readiness::ReadyRework => StageAction::ReworkTransition,
                Readiness::Ready if stage == Stage::Complete => StageAction::FinishProject,
                Readiness::Ready => {
                    let next = match stage {
                        Stage::Sales => Stage::Onboarding,
                        Stage::Onboarding => Stage::Assignment,
                        Stage::Assignment => Stage::Build,
                        Stage::Build => Stage::Test,
                        Stage::Test => Stage::DefectValidation,
                        Stage::DefectValidation | Stage::Complete => Stage::Complete,
                    };
                    if stage == Stage::Sales {
                        // Handover creates the onboarding row for the portal.
                        store.ensure_onboarding(project_id).await?;
                    }
                    StageAction::Transition { to: next }
                }
            };

            // Gate: is a human needed before leaving this stage?
            let gate = resolve_gate_for_stage(stage_key, &bundle.hitl_gates, &overrides);
            let contract = get_contract(store, project_id).await?.unwrap_or(Value::Null);
            let (required, reasons) =
                should_require_approval(&gate, &contract, project.autopilot_mode);
            if required && !self.gate_satisfied(project_id, stage_key).await? {
                ensure_pending_approval(store, project_id, stage_key, &gate, &reasons).await?;
                store
                    .set_stage_state(
                        project_id,
                        stage_key,
                        StageStateStatus::AwaitingApproval,
                        &reasons,
                        &["An approver must approve this stage".to_string()],
                    )
                    .await?;
                self.ctx.bus.emit(
                    "APPROVAL_REQUESTED",
                    project_id,
                    Some(stage_key),
                    json!({"reasons": reasons}),
                );
                outcome = AdvanceOutcome::AwaitingApproval {
                    stage_key: stage_key.to_string(),
                };
                break;
            }

            // Action: enqueue worker-side stages, transition the rest.
            match action {
                StageAction::FinishProject => {
                    store.set_project_status(project_id, ProjectStatus::Complete).await?;
                    store
                        .set_stage_state(
                            project_id,
                            stage_key,
                            StageStateStatus::Complete,
                            &[],
                            &[],
                        )
                        .await?;
                    store.reset_autopilot_failures(project_id).await?;
                    self.ctx.bus.emit("PROJECT_COMPLETED", project_id, Some(stage_key), json!({}));
                    outcome = AdvanceOutcome::Completed;
                    break;
                }
                StageAction::Enqueue => {
                    let job_id = enqueue_stage_job(
                        store,
                        &self.ctx.bus,
                        project_id,
                        stage,
                        json!({"trigger": trigger}),
                        None,
                        None,
                        bundle.policies.build_retry_cap.max(1),
                    )
                    .await?;
                    store
                        .set_stage_state(
                            project_id,
                            stage_key,
                            StageStateStatus::Running,
                            &[],
                            &[],
                        )
                        .await?;
                    outcome = AdvanceOutcome::WaitingOnJob {
                        stage_key: stage_key.to_string(),
                        job_id: Some(job_id),
                    };
                    break;
                }
                StageAction::Transition { to } => {
                    let applied = store
                        .transition_project_stage(
                            project_id,
                            Some(stage),
                            to,
                            Some(trigger),
                            None,
                            None,
                        )
                        .await?;
                    if !applied {
                        // Lost a race; the next tick re-evaluates.
                        break;
                    }
                    transitions_applied += 1;
                    store.reset_autopilot_failures(project_id).await?;
                    self.ctx.bus.emit(
                        "STAGE_TRANSITION",
                        project_id,
                        Some(to.key()),
                        json!({"from": stage.encode(), "to": to.encode(), "trigger": trigger}),
                    );
                    outcome = AdvanceOutcome::Advanced {
                        to_stage: to.key().to_string(),
                    };
                    // Keep walking: the next stage may be ready too.
                }
                StageAction::ReworkTransition => {
                    let new_count = project.defect_cycle_count + 1;
                    if new_count > bundle.policies.defect_cycle_cap {
                        let reason = format!(
                            "Defect cycle cap ({}) exceeded",
                            bundle.policies.defect_cycle_cap
                        );
                        store.set_project_needs_review(project_id, &reason, None).await?;
                        self.ctx.bus.emit(
                            "PROJECT_NEEDS_REVIEW",
                            project_id,
                            Some(stage_key),
                            json!({"reason": reason, "defect_cycle_count": project.defect_cycle_count}),
                        );
                        outcome = AdvanceOutcome::NeedsReview { reason };
                        break;
                    }
                    store.set_defect_cycle_count(project_id, new_count).await?;
                    let applied = store
                        .transition_project_stage(
                            project_id,
                            Some(stage),
                            Stage::Build,
                            Some("defect rework"),
                            Some(json!({"defect_cycle_count": new_count})),
                            None,
                        )
                        .await?;
                    if applied {
                        transitions_applied += 1;
                        store.reset_autopilot_failures(project_id).await?;
                        info!(%project_id, cycle = new_count, "defect rework loop to BUILD");
                    }
                    outcome = AdvanceOutcome::Advanced {
                        to_stage: Stage::Build.key().to_string(),
                    };
                }
            }
        }

        Ok(AdvanceSummary {
            project_id,
            outcome,
            transitions_applied,
            contract_version: contract_version.version,
        })
    }

    /// An approved decision for this stage satisfies its gate.
    async fn gate_satisfied(
        &self,
        project_id: Uuid,
        stage_key: &str,
    ) -> Result<bool, OrchestratorError> {
        let approvals = self.ctx.store.list_approvals(project_id).await?;
        Ok(approvals
            .iter()
            .any(|a| a.stage_key == stage_key && a.status == ApprovalStatus::Approved))
    }

    /// Stage readiness per the minimum rule set. `ReadyRework` signals the
    /// defect-validation rework branch.
    async fn stage_readiness(
        &self,
        project: &Project,
        bundle: &PolicyBundle,
    ) -> Result<Readiness, OrchestratorError> {
        let store = &self.ctx.store;
        let project_id = project.id;
        match project.current_stage {
            Stage::Sales => {
                let mut reasons = Vec::new();
                if project.title.trim().is_empty() {
                    reasons.push("Project title missing".to_string());
                }
                if project.client_name.trim().is_empty() {
                    reasons.push("Client name missing".to_string());
                }
                if reasons.is_empty() {
                    Ok(Readiness::Ready)
                } else {
                    Ok(Readiness::blocked(reasons, "Complete the sales handover form"))
                }
            }
            Stage::Onboarding => {
                let contract = get_contract(store, project_id).await?.unwrap_or(Value::Null);
                let override_ok =
                    store.get_minimum_requirements_override(project_id).await?;
                let mut reasons = Vec::new();
                let submitted = value_at_path(&contract, "onboarding.submitted_at").is_some();
                if !submitted {
                    reasons.push("Client has not submitted onboarding".to_string());
                }
                if !override_ok {
                    for (path, label) in [
                        ("onboarding.primary_contact", "primary contact"),
                        ("onboarding.brand", "brand"),
                        ("onboarding.design_preferences", "design preferences"),
                        ("onboarding.compliance", "compliance fields"),
                    ] {
                        let missing = match value_at_path(&contract, path) {
                            None => true,
                            Some(v) => v.as_object().is_some_and(serde_json::Map::is_empty),
                        };
                        if missing {
                            reasons.push(format!("Onboarding {label} missing"));
                        }
                    }
                }
                if reasons.is_empty() {
                    Ok(Readiness::Ready)
                } else {
                    Ok(Readiness::blocked(reasons, "Collect the missing onboarding inputs"))
                }
            }
            Stage::Assignment => {
                // The engine itself is the readiness check: it either fills
                // all three roles or reports exactly what is missing.
                match run_auto_assignment(store, self.ctx.ai.clone(), project_id, false).await? {
                    AssignmentOutcome::Assigned => Ok(Readiness::Ready),
                    AssignmentOutcome::Skipped(_) => {
                        let filled = store.get_project(project_id).await?.is_some_and(|p| {
                            p.consultant_user_id.is_some()
                                && p.builder_user_id.is_some()
                                && p.tester_user_id.is_some()
                        });
                        if filled {
                            Ok(Readiness::Ready)
                        } else {
                            Ok(Readiness::blocked(
                                vec!["Auto-assignment rate-limited; roles still unfilled".to_string()],
                                "Assign the remaining roles manually or retry later",
                            ))
                        }
                    }
                    AssignmentOutcome::Blocked(reasons) => Ok(Readiness::Blocked {
                        actions: reasons.iter().map(|r| format!("Assign: {r}")).collect(),
                        reasons,
                    }),
                }
            }
            Stage::Build => {
                // A validated template (or a client-confirmed fallback) must
                // exist before any build job is worth enqueuing.
                let onboarding = store.get_onboarding(project_id).await?;
                let template = match onboarding.as_ref().and_then(|o| o.selected_template_id) {
                    Some(template_id) => store.get_template(template_id).await?,
                    None => None,
                };
                let fallback_confirmed = store.has_confirmed_fallback(project_id).await?;
                let template_ok = template
                    .as_ref()
                    .is_some_and(|t| t.status == "validated")
                    || (template.is_some() && fallback_confirmed);
                if !template_ok {
                    return Ok(Readiness::blocked(
                        vec![
                            "Selected template is missing or not validated, and no confirmed fallback exists"
                                .to_string(),
                        ],
                        "Select a validated template or confirm the fallback",
                    ));
                }
                self.worker_stage_readiness(project, Stage::Build, |outputs| {
                    outputs.get("preview_url").and_then(Value::as_str).is_some()
                })
                .await
            }
            Stage::Test => {
                // Latest BUILD output must be a success with a preview URL.
                let build = store.latest_stage_output(project_id, Stage::Build).await?;
                let ok = build.as_ref().is_some_and(|o| {
                    o.status == "success"
                        && o.outputs.get("preview_url").and_then(Value::as_str).is_some()
                });
                if !ok {
                    return Ok(Readiness::blocked(
                        vec!["No successful build output with a preview URL".to_string()],
                        "Re-run the build stage",
                    ));
                }
                self.worker_stage_readiness(project, Stage::Test, |outputs| {
                    outputs.get("quality").is_some()
                })
                .await
            }
            Stage::DefectValidation => {
                let test = store.latest_stage_output(project_id, Stage::Test).await?;
                let Some(test) = test else {
                    return Ok(Readiness::blocked(
                        vec!["No test output to validate".to_string()],
                        "Re-run the test stage",
                    ));
                };
                let failures = test
                    .outputs
                    .get("failures")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                if failures == 0 {
                    // Nothing to validate; skip straight to completion.
                    return Ok(Readiness::Ready);
                }
                let state = self
                    .worker_stage_readiness(project, Stage::DefectValidation, |outputs| {
                        outputs.get("rework").is_some()
                    })
                    .await?;
                match state {
                    Readiness::Ready => {
                        let dv = store
                            .latest_stage_output(project_id, Stage::DefectValidation)
                            .await?;
                        let rework = dv
                            .as_ref()
                            .and_then(|o| o.outputs.get("rework"))
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if rework {
                            Ok(Readiness::ReadyRework)
                        } else {
                            Ok(Readiness::Ready)
                        }
                    }
                    other => Ok(other),
                }
            }
            Stage::Complete => {
                let pending = store.list_pending_approvals(project_id).await?;
                if !pending.is_empty() {
                    return Ok(Readiness::blocked(
                        vec!["Open approvals remain".to_string()],
                        "Resolve pending approvals",
                    ));
                }
                let contract = get_contract(store, project_id).await?.unwrap_or(Value::Null);
                let floor = &bundle.policies.lighthouse_floor;
                let mut reasons = Vec::new();
                for (path, label, min) in [
                    ("quality.lighthouse.perf", "performance", floor.performance),
                    ("quality.lighthouse.a11y", "accessibility", floor.accessibility),
                    ("quality.lighthouse.bp", "best practices", floor.best_practices),
                    ("quality.lighthouse.seo", "seo", floor.seo),
                ] {
                    let ok = value_at_path(&contract, path)
                        .and_then(Value::as_f64)
                        .is_some_and(|v| v >= min);
                    if !ok {
                        reasons.push(format!("Lighthouse {label} below floor {min}"));
                    }
                }
                if reasons.is_empty() {
                    Ok(Readiness::Ready)
                } else {
                    Ok(Readiness::blocked(reasons, "Raise quality scores to the policy floor"))
                }
            }
        }
    }

    /// Shared readiness logic for worker-side stages: ready when the latest
    /// output satisfies `output_ok`; otherwise waiting on an in-flight job,
    /// blocked on a terminal-failed one, or ready-to-enqueue when no job ran
    /// yet (reported as `NeedsJob`).
    ///
    /// Outputs produced before the project last entered the stage do not
    /// count: a rework loop back to BUILD must re-run build and test, not
    /// reuse the previous cycle's outputs.
    async fn worker_stage_readiness(
        &self,
        project: &Project,
        stage: Stage,
        output_ok: impl Fn(&Value) -> bool,
    ) -> Result<Readiness, OrchestratorError> {
        let store = &self.ctx.store;
        let entered_at = last_entered_at(project, stage);
        let output = store.latest_stage_output(project.id, stage).await?;
        let usable = output.as_ref().is_some_and(|o| {
            o.status == "success"
                && output_ok(&o.outputs)
                && entered_at.is_none_or(|entered| o.created_at >= entered)
        });
        if usable {
            return Ok(Readiness::Ready);
        }
        let jobs = list_stage_jobs(store, project.id).await?;
        let latest = jobs
            .iter()
            .find(|j| j.stage == stage && entered_at.is_none_or(|e| j.created_at >= e));
        match latest {
            Some(job) if !job.status.is_terminal() => Ok(Readiness::Waiting {
                job_id: Some(job.id),
            }),
            Some(job) if job.status == StageJobStatus::NeedsHuman => Ok(Readiness::blocked(
                vec![format!("{} job needs human attention", stage.encode())],
                "Review the parked job report",
            )),
            Some(job) if job.status == StageJobStatus::Failed => Ok(Readiness::blocked(
                vec![format!(
                    "{} job failed after {} attempts",
                    stage.encode(),
                    job.attempts
                )],
                "Inspect the job error and re-enqueue",
            )),
            // No job yet, or the last one was canceled / stale: enqueue.
            _ => Ok(Readiness::NeedsJob),
        }
    }

    async fn record_failure(&self, project_id: Uuid) -> Result<(), OrchestratorError> {
        let store = &self.ctx.store;
        let Some(project) = store.get_project(project_id).await? else {
            return Ok(());
        };
        let backoff_minutes = 2i64
            .saturating_pow(project.autopilot_failure_count.clamp(0, 6) as u32)
            .min(60);
        let lock_until = Utc::now() + ChronoDuration::minutes(backoff_minutes);
        let count = store.record_autopilot_failure(project_id, lock_until).await?;
        if count >= AUTOPILOT_FAILURE_LIMIT {
            store
                .set_project_needs_review(
                    project_id,
                    &format!("Autopilot failed {count} consecutive times"),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    // -- Service entry points used by the API collaborator ----------------

    /// Flattened pipeline view.
    #[instrument(skip(self), err)]
    pub async fn get_pipeline_status(
        &self,
        project_id: Uuid,
    ) -> Result<Option<PipelineStatus>, OrchestratorError> {
        let store = &self.ctx.store;
        let Some(project) = store.get_project(project_id).await? else {
            return Ok(None);
        };
        store.ensure_stage_states(project_id).await?;
        let stage_states = store.list_stage_states(project_id).await?;
        let pending_approvals = store.list_pending_approvals(project_id).await?;
        let blocked_summary: Vec<String> = stage_states
            .iter()
            .filter(|s| s.status == StageStateStatus::Blocked)
            .flat_map(|s| {
                s.blocked_reasons
                    .iter()
                    .map(|r| format!("{}: {r}", s.stage_key))
                    .collect::<Vec<_>>()
            })
            .collect();
        let next_ready_stages: Vec<String> = stage_states
            .iter()
            .filter(|s| s.status == StageStateStatus::Ready)
            .map(|s| s.stage_key.clone())
            .collect();
        Ok(Some(PipelineStatus {
            project_id,
            status: project.status,
            current_stage: project.current_stage,
            stage_states,
            pending_approvals,
            blocked_summary,
            next_ready_stages,
            hold_reason: project.hold_reason,
            needs_review_reason: project.needs_review_reason,
        }))
    }

    /// API-facing advance request.
    pub async fn advance(&self, project_id: Uuid) -> Result<AdvanceSummary, OrchestratorError> {
        self.auto_advance(project_id, "api:advance").await
    }

    /// Approve the pending gate for a stage and immediately re-evaluate.
    #[instrument(skip(self), err)]
    pub async fn approve_stage(
        &self,
        project_id: Uuid,
        stage_key: &str,
        approver_user_id: Option<Uuid>,
        comment: Option<&str>,
    ) -> Result<AdvanceSummary, OrchestratorError> {
        crate::hitl::approve_stage(&self.ctx.store, project_id, stage_key, approver_user_id, comment)
            .await?;
        self.ctx.bus.emit(
            "APPROVAL_DECIDED",
            project_id,
            Some(stage_key),
            json!({"decision": "approved"}),
        );
        self.auto_advance(project_id, "approval").await
    }

    /// Reject the pending gate; the stage stays blocked with the comment.
    #[instrument(skip(self), err)]
    pub async fn reject_stage(
        &self,
        project_id: Uuid,
        stage_key: &str,
        approver_user_id: Option<Uuid>,
        comment: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        crate::hitl::reject_stage(&self.ctx.store, project_id, stage_key, approver_user_id, comment)
            .await?;
        self.ctx.bus.emit(
            "APPROVAL_DECIDED",
            project_id,
            Some(stage_key),
            json!({"decision": "rejected", "comment": comment}),
        );
        Ok(())
    }

    /// Periodic sweep: expire/invalidate approvals, run reminders, and
    /// re-evaluate every eligible project.
    #[instrument(skip(self, email, portal_base_url), err)]
    pub async fn sweep(
        &self,
        email: std::sync::Arc<dyn crate::collaborators::EmailNotifier>,
        portal_base_url: &str,
    ) -> Result<usize, OrchestratorError> {
        let store = &self.ctx.store;
        let bundle = store.load_policy_bundle().await?;
        expire_old_approvals(store, None, bundle.policies.approval_expiry_days).await?;
        run_reminder_scan(store, email, &self.ctx.bus, &bundle.policies, portal_base_url).await?;
        let mut evaluated = 0;
        for project in store.list_open_projects().await? {
            invalidate_stale_approvals(store, project.id).await?;
            if project.is_autopilot_eligible(Utc::now()) {
                self.auto_advance(project.id, "sweeper").await?;
                evaluated += 1;
            }
        }
        Ok(evaluated)
    }
}

enum Readiness {
    Ready,
    /// Ready, and the defect-validation verdict asks for rework.
    ReadyRework,
    /// A worker-side stage with no (usable) output and no job yet.
    NeedsJob,
    /// A job is in flight; wait for the worker.
    Waiting { job_id: Option<Uuid> },
    Blocked {
        reasons: Vec<String>,
        actions: Vec<String>,
    },
}

impl Readiness {
    fn blocked(reasons: Vec<String>, action: &str) -> Self {
        Readiness::Blocked {
            reasons,
            actions: vec![action.to_string()],
        }
    }
}

enum StageAction {
    Transition { to: Stage },
    ReworkTransition,
    Enqueue,
    FinishProject,
}

/// When the project last entered `stage`, from the stage-history log.
fn last_entered_at(project: &Project, stage: Stage) -> Option<chrono::DateTime<Utc>> {
    let history = project.stage_history.as_array()?;
    history
        .iter()
        .rev()
        .find(|entry| entry.get("to_stage").and_then(Value::as_str) == Some(stage.encode()))
        .and_then(|entry| entry.get("at").and_then(Value::as_str))
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
