//! Stage work executed by the worker.
//!
//! The original system's plugin-style per-stage agents collapse here into a
//! single [`StageAgent`] enum dispatched at compile time: build, test,
//! defect validation, completion, and assignment. Every agent reads the
//! delivery contract, performs its side effects, writes a stage output row,
//! and leaves the transition decision to the orchestrator's next pass.

use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::ai::AiClient;
use crate::assignment::{AssignmentOutcome, run_auto_assignment};
use crate::collaborators::{ObjectStore, ValidationRunner, project_prefix};
use crate::config::PolicyBundle;
use crate::contract::create_or_update_contract;
use crate::events::NotificationBus;
use crate::stages::Stage;
use crate::store::{PipelineStore, StoreError};
use crate::templates::preview::render_single_page;
use crate::templates::validation::aggregate_reports;

/// Shared dependencies handed to every agent run.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: PipelineStore,
    pub bus: NotificationBus,
    pub ai: Arc<dyn AiClient>,
    pub objects: Arc<dyn ObjectStore>,
    pub runners: Vec<Arc<dyn ValidationRunner>>,
}

/// How a stage run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageRunOutcome {
    Success,
    /// Retryable failures re-queue; permanent data errors do not.
    Failed { retryable: bool },
    NeedsHuman,
}

#[derive(Clone, Debug)]
pub struct StageRunResult {
    pub outcome: StageRunOutcome,
    pub outputs: Value,
}

impl StageRunResult {
    fn success(outputs: Value) -> Self {
        Self {
            outcome: StageRunOutcome::Success,
            outputs,
        }
    }

    fn failed(retryable: bool, error: &str) -> Self {
        Self {
            outcome: StageRunOutcome::Failed { retryable },
            outputs: json!({"error": error}),
        }
    }
}

/// The enumerated stage agents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageAgent {
    Assignment,
    Build,
    Test,
    DefectValidation,
    Completion,
}

impl StageAgent {
    /// Agent responsible for a stage's worker-side job, if any.
    #[must_use]
    pub fn for_stage(stage: Stage) -> Option<StageAgent> {
        match stage {
            Stage::Assignment => Some(StageAgent::Assignment),
            Stage::Build => Some(StageAgent::Build),
            Stage::Test => Some(StageAgent::Test),
            Stage::DefectValidation => Some(StageAgent::DefectValidation),
            Stage::Complete => Some(StageAgent::Completion),
            Stage::Sales | Stage::Onboarding => None,
        }
    }

    /// Execute the agent for one project. Side effects land in the store;
    /// the returned result drives the job status.
    #[instrument(skip(self, ctx, policies, payload), err)]
    pub async fn run(
        self,
        ctx: &WorkerContext,
        policies: &PolicyBundle,
        project_id: Uuid,
        payload: &Value,
    ) -> Result<StageRunResult, StoreError> {
        match self {
            StageAgent::Assignment => run_assignment(ctx, project_id, payload).await,
            StageAgent::Build => run_build(ctx, project_id).await,
            StageAgent::Test => run_test(ctx, policies, project_id).await,
            StageAgent::DefectValidation => run_defect_validation(ctx, project_id).await,
            StageAgent::Completion => run_completion(ctx, policies, project_id).await,
        }
    }
}

async fn run_assignment(
    ctx: &WorkerContext,
    project_id: Uuid,
    payload: &Value,
) -> Result<StageRunResult, StoreError> {
    let force = payload.get("force").and_then(Value::as_bool).unwrap_or(false);
    match run_auto_assignment(&ctx.store, ctx.ai.clone(), project_id, force).await? {
        AssignmentOutcome::Assigned => Ok(StageRunResult::success(json!({"assigned": true}))),
        AssignmentOutcome::Skipped(reason) => {
            Ok(StageRunResult::success(json!({"assigned": false, "skipped": reason})))
        }
        AssignmentOutcome::Blocked(reasons) => Ok(StageRunResult {
            outcome: StageRunOutcome::NeedsHuman,
            outputs: json!({"blocked_reasons": reasons}),
        }),
    }
}

/// Build: render the preview bundle from the selected template's blueprint
/// and the client's onboarding data, upload it, and record the build output.
async fn run_build(ctx: &WorkerContext, project_id: Uuid) -> Result<StageRunResult, StoreError> {
    if let Err(err) = create_or_update_contract(&ctx.store, project_id, "system:build").await {
        warn!(%err, "contract rebuild before build failed");
    }
    let Some(onboarding) = ctx.store.get_onboarding(project_id).await? else {
        // Missing linked data after enqueue is a permanent data error.
        return Ok(StageRunResult::failed(false, "No onboarding data for project"));
    };
    let template = match onboarding.selected_template_id {
        Some(template_id) => ctx.store.get_template(template_id).await?,
        None => None,
    };
    let fallback_confirmed = ctx.store.has_confirmed_fallback(project_id).await?;
    let template = match template {
        Some(t) if t.status == "validated" || fallback_confirmed => t,
        Some(_) => {
            return Ok(StageRunResult::failed(
                false,
                "Selected template is not validated and no confirmed fallback exists",
            ));
        }
        None => {
            return Ok(StageRunResult::failed(
                false,
                "No template selected for project",
            ));
        }
    };
    let Some(blueprint) = template.blueprint.as_ref() else {
        return Ok(StageRunResult::failed(false, "Template has no blueprint"));
    };

    let dataset = json!({
        "client_name": onboarding.contacts.get("name").cloned().unwrap_or(Value::Null),
        "brand": onboarding.brand,
        "fundamentals": onboarding.fundamentals,
    });
    let page = render_single_page(blueprint, &dataset, None);
    let key = format!("{}/preview/index.html", project_prefix(project_id));
    if let Err(err) = ctx.objects.put(&key, page.into_bytes()).await {
        // Storage hiccups are transient; the queue retries with backoff.
        return Ok(StageRunResult::failed(true, &format!("Preview upload failed: {err}")));
    }
    let preview_url = ctx.objects.presign(&key);

    ctx.store.add_artifact(project_id, "build_preview", &key, 0).await?;
    let outputs = json!({
        "preview_url": preview_url,
        "bundle_url": preview_url,
        "template_id": template.id.to_string(),
        "template_version": template.version,
    });
    ctx.store
        .add_stage_output(project_id, Stage::Build, "success", &outputs)
        .await?;
    if let Err(err) = create_or_update_contract(&ctx.store, project_id, "system:build").await {
        warn!(%err, "contract rebuild after build failed");
    }
    Ok(StageRunResult::success(outputs))
}

/// Test: run every validation runner against the build preview and record
/// the aggregated quality report. Failures do not fail the job — they feed
/// defect validation.
async fn run_test(
    ctx: &WorkerContext,
    policies: &PolicyBundle,
    project_id: Uuid,
) -> Result<StageRunResult, StoreError> {
    let Some(build) = ctx.store.latest_stage_output(project_id, Stage::Build).await? else {
        return Ok(StageRunResult::failed(false, "No build output to test"));
    };
    let Some(preview_url) = build.outputs.get("preview_url").and_then(Value::as_str) else {
        return Ok(StageRunResult::failed(false, "Build output has no preview URL"));
    };

    let thresholds = test_thresholds(ctx, policies, project_id).await?;
    let mut reports: Map<String, Value> = Map::new();
    for runner in &ctx.runners {
        match runner.run(preview_url, &thresholds).await {
            Ok(report) => {
                reports.insert(runner.name().to_string(), report);
            }
            Err(err) => {
                // Transient runner outage: retry the whole test job.
                return Ok(StageRunResult::failed(
                    true,
                    &format!("{} runner failed: {err}", runner.name()),
                ));
            }
        }
    }
    let summary = aggregate_reports(
        reports.get("lighthouse").unwrap_or(&Value::Null),
        reports.get("axe").unwrap_or(&Value::Null),
        reports.get("content").unwrap_or(&Value::Null),
        &thresholds,
    );
    let failures = summary
        .get("failed_reasons")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let lighthouse = reports.get("lighthouse").cloned().unwrap_or(Value::Null);
    let axe = reports.get("axe").cloned().unwrap_or(Value::Null);
    let outputs = json!({
        "preview_url": preview_url,
        "quality": {
            "lighthouse": {
                "perf": lighthouse.get("performance").cloned().unwrap_or(Value::Null),
                "a11y": lighthouse.get("accessibility").cloned().unwrap_or(Value::Null),
                "seo": lighthouse.get("seo").cloned().unwrap_or(Value::Null),
                "bp": lighthouse.get("best_practices").cloned().unwrap_or(Value::Null),
            },
            "axe": {
                "critical": axe.get("critical").cloned().unwrap_or(Value::Null),
                "serious": axe.get("serious").cloned().unwrap_or(Value::Null),
            },
        },
        "failures": failures,
        "passed": summary.get("passed").cloned().unwrap_or(json!(false)),
    });
    ctx.store
        .add_stage_output(project_id, Stage::Test, "success", &outputs)
        .await?;
    if let Err(err) = create_or_update_contract(&ctx.store, project_id, "system:test").await {
        warn!(%err, "contract rebuild after test failed");
    }
    Ok(StageRunResult::success(outputs))
}

/// Defect validation: decide whether the failing tests demand a rework loop
/// back to BUILD. The orchestrator applies the transition and the cycle cap.
async fn run_defect_validation(
    ctx: &WorkerContext,
    project_id: Uuid,
) -> Result<StageRunResult, StoreError> {
    let Some(test) = ctx.store.latest_stage_output(project_id, Stage::Test).await? else {
        return Ok(StageRunResult::failed(false, "No test output to validate"));
    };
    let failures = test
        .outputs
        .get("failures")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let defects: Vec<Value> = failures
        .iter()
        .enumerate()
        .map(|(i, failure)| {
            json!({
                "id": format!("defect-{}", i + 1),
                "summary": failure,
                "severity": "MEDIUM",
                "valid": true,
            })
        })
        .collect();
    let rework = !defects.is_empty();
    let outputs = json!({"rework": rework, "defects": defects});
    ctx.store
        .add_stage_output(project_id, Stage::DefectValidation, "success", &outputs)
        .await?;
    Ok(StageRunResult::success(outputs))
}

/// Completion: record the delivery summary once quality thresholds hold.
async fn run_completion(
    ctx: &WorkerContext,
    policies: &PolicyBundle,
    project_id: Uuid,
) -> Result<StageRunResult, StoreError> {
    let open_approvals = ctx.store.list_pending_approvals(project_id).await?;
    if !open_approvals.is_empty() {
        return Ok(StageRunResult::failed(false, "Open approvals remain"));
    }
    let quality = ctx
        .store
        .latest_stage_output(project_id, Stage::Test)
        .await?
        .map(|o| o.outputs.get("quality").cloned().unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    let floor = &policies.policies.lighthouse_floor;
    let meets = |path: &str, min: f64| {
        quality
            .pointer(path)
            .and_then(Value::as_f64)
            .is_some_and(|v| v >= min)
    };
    let mut missed: Vec<String> = Vec::new();
    if !meets("/lighthouse/perf", floor.performance) {
        missed.push(format!("lighthouse.performance below floor {}", floor.performance));
    }
    if !meets("/lighthouse/a11y", floor.accessibility) {
        missed.push(format!("lighthouse.accessibility below floor {}", floor.accessibility));
    }
    if !missed.is_empty() {
        return Ok(StageRunResult::failed(false, &missed.join("; ")));
    }
    let outputs = json!({"completed": true, "quality": quality});
    ctx.store
        .add_stage_output(project_id, Stage::Complete, "success", &outputs)
        .await?;
    Ok(StageRunResult::success(outputs))
}

/// Global thresholds merged with per-project quality overrides.
async fn test_thresholds(
    ctx: &WorkerContext,
    policies: &PolicyBundle,
    project_id: Uuid,
) -> Result<Value, StoreError> {
    let mut thresholds = serde_json::to_value(&policies.thresholds).unwrap_or(json!({}));
    thresholds["lighthouse_floor"] =
        serde_json::to_value(&policies.policies.lighthouse_floor).unwrap_or(Value::Null);
    if let Some(project) = ctx.store.get_project(project_id).await? {
        if let Some(Value::Object(overrides)) = project.quality_overrides {
            if let Some(base) = thresholds.as_object_mut() {
                for (key, value) in overrides {
                    base.insert(key, value);
                }
            }
        }
    }
    Ok(thresholds)
}
