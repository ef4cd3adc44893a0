//! HITL gate behavior through the orchestrator: conditional gates, approval
//! lifecycle, fingerprint invalidation, full-autopilot semantics.

mod common;

use serde_json::json;
use siteline::model::{ApprovalStatus, AutopilotMode, StageStateStatus};
use siteline::orchestrator::{AdvanceOutcome, Orchestrator};
use uuid::Uuid;

async fn gated_project(h: &common::TestHarness, conditions: serde_json::Value) -> Uuid {
    let store = h.store();
    store
        .update_config(
            "hitl_gates_json",
            &json!([{
                "stage_key": "2_assignment",
                "mode": "conditional",
                "conditions_json": conditions,
            }]),
            None,
            None,
        )
        .await
        .unwrap();
    let project_id = common::create_project(store, "P1").await;
    let template_id = common::seed_validated_template(store).await;
    common::seed_team(store).await;
    common::complete_onboarding(store, project_id, template_id).await;
    project_id
}

#[tokio::test]
async fn passing_conditional_gate_creates_no_approval() {
    let h = common::harness().await;
    // consultant_id exists after auto-assignment fills the roles.
    let project_id = gated_project(
        &h,
        json!({"all": [{"path": "assignments.consultant_id", "op": "exists"}]}),
    )
    .await;
    let orchestrator = Orchestrator::new(h.ctx.clone());

    let summary = orchestrator.auto_advance(project_id, "test").await.unwrap();
    // The pass should sail through assignment and stop at the build job.
    assert!(
        matches!(summary.outcome, AdvanceOutcome::WaitingOnJob { ref stage_key, .. } if stage_key == "3_build"),
        "outcome: {:?}",
        summary.outcome
    );
    assert!(h.store().list_pending_approvals(project_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_conditional_gate_creates_one_pending_approval() {
    let h = common::harness().await;
    let project_id = gated_project(
        &h,
        json!({"all": [{"path": "onboarding.website_fundamentals.launch_date", "op": "exists"}]}),
    )
    .await;
    let orchestrator = Orchestrator::new(h.ctx.clone());

    let summary = orchestrator.auto_advance(project_id, "test").await.unwrap();
    assert!(
        matches!(summary.outcome, AdvanceOutcome::AwaitingApproval { ref stage_key } if stage_key == "2_assignment"),
        "outcome: {:?}",
        summary.outcome
    );

    let pending = h.store().list_pending_approvals(project_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].inputs_fingerprint.is_empty());

    let state = h
        .store()
        .get_stage_state(project_id, "2_assignment")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, StageStateStatus::AwaitingApproval);
    assert!(
        state
            .blocked_reasons
            .iter()
            .any(|r| r.contains("Gate conditions failed")),
        "reasons: {:?}",
        state.blocked_reasons
    );

    // Re-running without input change keeps exactly one pending row.
    orchestrator.auto_advance(project_id, "test").await.unwrap();
    let pending = h.store().list_pending_approvals(project_id).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn input_change_invalidates_pending_and_advances_without_new_approval() {
    let h = common::harness().await;
    let project_id = gated_project(
        &h,
        json!({"all": [{"path": "onboarding.website_fundamentals.launch_date", "op": "exists"}]}),
    )
    .await;
    let orchestrator = Orchestrator::new(h.ctx.clone());
    orchestrator.auto_advance(project_id, "test").await.unwrap();
    let pending = h.store().list_pending_approvals(project_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    let stale_id = pending[0].id;

    // The client supplies the missing field; the contract bumps.
    h.store()
        .update_onboarding_fields(
            project_id,
            &json!({"name": "Pat Client"}),
            &json!({"logo": "logo.png"}),
            &json!({"theme": "modern"}),
            &json!({"wcag": "AA"}),
            &json!({"domain": "example.test", "launch_date": "2026-09-01"}),
            &[],
            100,
        )
        .await
        .unwrap();

    let summary = orchestrator.auto_advance(project_id, "test").await.unwrap();
    let stale = h.store().get_approval(stale_id).await.unwrap().unwrap();
    assert_eq!(stale.status, ApprovalStatus::Invalidated);
    assert!(h.store().list_pending_approvals(project_id).await.unwrap().is_empty());
    assert!(
        matches!(summary.outcome, AdvanceOutcome::WaitingOnJob { ref stage_key, .. } if stage_key == "3_build"),
        "outcome: {:?}",
        summary.outcome
    );
}

#[tokio::test]
async fn approve_unblocks_and_reject_blocks() {
    let h = common::harness().await;
    let store = h.store();
    store
        .update_config(
            "hitl_gates_json",
            &json!([{"stage_key": "2_assignment", "mode": "always"}]),
            None,
            None,
        )
        .await
        .unwrap();
    let project_id = common::create_project(store, "P1").await;
    let template_id = common::seed_validated_template(store).await;
    common::seed_team(store).await;
    common::complete_onboarding(store, project_id, template_id).await;
    let orchestrator = Orchestrator::new(h.ctx.clone());

    let summary = orchestrator.auto_advance(project_id, "test").await.unwrap();
    assert!(matches!(summary.outcome, AdvanceOutcome::AwaitingApproval { .. }));

    // Reject first: the stage stays blocked with the comment.
    orchestrator
        .reject_stage(project_id, "2_assignment", None, Some("wrong consultant"))
        .await
        .unwrap();
    let state = store.get_stage_state(project_id, "2_assignment").await.unwrap().unwrap();
    assert_eq!(state.status, StageStateStatus::Blocked);
    assert!(state.blocked_reasons.iter().any(|r| r.contains("wrong consultant")));

    // The next pass re-issues a pending approval; approving advances.
    orchestrator.auto_advance(project_id, "test").await.unwrap();
    let summary = orchestrator
        .approve_stage(project_id, "2_assignment", None, Some("go ahead"))
        .await
        .unwrap();
    assert!(
        matches!(summary.outcome, AdvanceOutcome::WaitingOnJob { ref stage_key, .. } if stage_key == "3_build"),
        "outcome: {:?}",
        summary.outcome
    );
}

#[tokio::test]
async fn full_autopilot_skips_conditional_but_honors_always() {
    let h = common::harness().await;
    let project_id = gated_project(
        &h,
        json!({"all": [{"path": "onboarding.website_fundamentals.launch_date", "op": "exists"}]}),
    )
    .await;
    h.store()
        .set_autopilot_mode(project_id, AutopilotMode::Full)
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(h.ctx.clone());

    let summary = orchestrator.auto_advance(project_id, "test").await.unwrap();
    assert!(
        matches!(summary.outcome, AdvanceOutcome::WaitingOnJob { .. }),
        "conditional gate must not stop full autopilot: {:?}",
        summary.outcome
    );
    assert!(h.store().list_pending_approvals(project_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn full_autopilot_still_respects_always_gates() {
    let h = common::harness().await;
    let store = h.store();
    store
        .update_config(
            "hitl_gates_json",
            &json!([{"stage_key": "2_assignment", "mode": "always"}]),
            None,
            None,
        )
        .await
        .unwrap();
    let project_id = common::create_project(store, "P1").await;
    let template_id = common::seed_validated_template(store).await;
    common::seed_team(store).await;
    common::complete_onboarding(store, project_id, template_id).await;
    store
        .set_autopilot_mode(project_id, AutopilotMode::Full)
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(h.ctx.clone());
    let summary = orchestrator.auto_advance(project_id, "test").await.unwrap();
    assert!(
        matches!(summary.outcome, AdvanceOutcome::AwaitingApproval { ref stage_key } if stage_key == "2_assignment"),
        "outcome: {:?}",
        summary.outcome
    );
    assert_eq!(store.list_pending_approvals(project_id).await.unwrap().len(), 1);
}
