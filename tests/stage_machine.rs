//! Stage state machine invariants: transitions, idempotence, history, audit.

mod common;

use serde_json::Value;
use siteline::model::ProjectStatus;
use siteline::stages::{Stage, can_transition};
use uuid::Uuid;

#[tokio::test]
async fn transition_applies_and_appends_history() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    let applied = store
        .transition_project_stage(project_id, Some(Stage::Sales), Stage::Onboarding, Some("handover"), None, None)
        .await
        .unwrap();
    assert!(applied);

    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.current_stage, Stage::Onboarding);
    let history = project.stage_history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["from_stage"], Value::from("SALES"));
    assert_eq!(history[0]["to_stage"], Value::from("ONBOARDING"));
    assert!(
        project.phase_start_dates.get("ONBOARDING").is_some(),
        "phase start recorded"
    );

    let actions = store.list_audit_actions(project_id).await.unwrap();
    assert_eq!(
        actions.iter().filter(|a| *a == "STAGE_TRANSITION").count(),
        1
    );

    // Stage-state rows rolled forward.
    let sales = store.get_stage_state(project_id, "0_sales").await.unwrap().unwrap();
    assert_eq!(sales.status.encode(), "complete");
    let onboarding = store
        .get_stage_state(project_id, "1_onboarding")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(onboarding.status.encode(), "ready");
}

#[tokio::test]
async fn transition_to_current_stage_is_noop() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    let applied = store
        .transition_project_stage(project_id, Some(Stage::Sales), Stage::Sales, None, None, None)
        .await
        .unwrap();
    assert!(!applied);
    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert!(project.stage_history.as_array().unwrap().is_empty());
    assert!(store.list_audit_actions(project_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_transition_returns_false_without_state_change() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    // SALES -> BUILD is not in the valid-next map.
    let applied = store
        .transition_project_stage(project_id, Some(Stage::Sales), Stage::Build, None, None, None)
        .await
        .unwrap();
    assert!(!applied);
    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.current_stage, Stage::Sales);
}

#[tokio::test]
async fn stale_from_stage_is_refused() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();
    store
        .transition_project_stage(project_id, None, Stage::Onboarding, None, None, None)
        .await
        .unwrap();

    // A caller that still thinks the project is in SALES loses the race.
    let applied = store
        .transition_project_stage(project_id, Some(Stage::Sales), Stage::Onboarding, None, None, None)
        .await
        .unwrap();
    assert!(!applied);
}

#[tokio::test]
async fn missing_project_is_a_noop() {
    let h = common::harness().await;
    let applied = h
        .store()
        .transition_project_stage(Uuid::new_v4(), None, Stage::Onboarding, None, None, None)
        .await
        .unwrap();
    assert!(!applied);
}

#[tokio::test]
async fn history_pairs_stay_within_valid_next_map() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    // Walk a full cycle including rework.
    for (from, to) in [
        (Stage::Sales, Stage::Onboarding),
        (Stage::Onboarding, Stage::Assignment),
        (Stage::Assignment, Stage::Build),
        (Stage::Build, Stage::Test),
        (Stage::Test, Stage::DefectValidation),
        (Stage::DefectValidation, Stage::Build),
        (Stage::Build, Stage::Test),
        (Stage::Test, Stage::DefectValidation),
        (Stage::DefectValidation, Stage::Complete),
    ] {
        let applied = store
            .transition_project_stage(project_id, Some(from), to, None, None, None)
            .await
            .unwrap();
        assert!(applied, "{from} -> {to} should apply");
    }

    let project = store.get_project(project_id).await.unwrap().unwrap();
    let history = project.stage_history.as_array().unwrap().clone();
    assert_eq!(history.len(), 9);
    // current_stage equals the last to_stage.
    assert_eq!(
        history.last().unwrap()["to_stage"],
        Value::from(project.current_stage.encode())
    );
    // Every consecutive pair is legal.
    for entry in &history {
        let from = Stage::decode(entry["from_stage"].as_str().unwrap()).unwrap();
        let to = Stage::decode(entry["to_stage"].as_str().unwrap()).unwrap();
        assert!(can_transition(Some(from), to), "{from} -> {to}");
    }
}

#[tokio::test]
async fn hold_and_needs_review_set_status_and_reason() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;

    store
        .set_project_hold(project_id, "Awaiting client response", None)
        .await
        .unwrap();
    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Hold);
    assert_eq!(project.hold_reason.as_deref(), Some("Awaiting client response"));
    assert!(!project.is_autopilot_eligible(chrono::Utc::now()));

    store
        .set_project_needs_review(project_id, "Defect cycle cap (5) exceeded", None)
        .await
        .unwrap();
    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::NeedsReview);
    assert!(
        project
            .needs_review_reason
            .as_deref()
            .unwrap()
            .contains("Defect cycle cap")
    );

    let actions = store.list_audit_actions(project_id).await.unwrap();
    assert!(actions.contains(&"PROJECT_HOLD".to_string()));
    assert!(actions.contains(&"PROJECT_NEEDS_REVIEW".to_string()));
}
