//! Reminder & hold loop: cadence windows, escalation, HOLD on exhaustion,
//! and resilient email sending.

mod common;

use chrono::{Duration, Utc};
use std::sync::Arc;

use siteline::collaborators::RecordingEmailNotifier;
use siteline::model::ProjectStatus;
use siteline::reminders::{ReminderAction, run_reminder_scan, run_reminder_tick};
use siteline::stages::Stage;
use uuid::Uuid;

async fn onboarding_project(h: &common::TestHarness) -> Uuid {
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();
    store
        .transition_project_stage(project_id, Some(Stage::Sales), Stage::Onboarding, None, None, None)
        .await
        .unwrap();
    store.ensure_onboarding(project_id).await.unwrap();
    project_id
}

#[tokio::test]
async fn within_cadence_window_nothing_is_sent() {
    let h = common::harness().await;
    let project_id = onboarding_project(&h).await;
    h.store()
        .set_reminder_state(project_id, 2, Some(Utc::now() - Duration::hours(1)))
        .await
        .unwrap();
    let email = RecordingEmailNotifier::new();
    let policies = siteline::config::DecisionPolicies::default();

    let action = run_reminder_tick(
        h.store(),
        Arc::new(email.clone()),
        &h.ctx.bus,
        &policies,
        "https://portal.test",
        project_id,
    )
    .await
    .unwrap();
    assert_eq!(action, ReminderAction::Skipped);
    assert!(email.sent().is_empty());
}

#[tokio::test]
async fn eligible_tick_sends_and_advances_counter() {
    let h = common::harness().await;
    let project_id = onboarding_project(&h).await;
    h.store()
        .set_reminder_state(project_id, 2, Some(Utc::now() - Duration::hours(25)))
        .await
        .unwrap();
    let email = RecordingEmailNotifier::new();
    let policies = siteline::config::DecisionPolicies::default();

    let action = run_reminder_tick(
        h.store(),
        Arc::new(email.clone()),
        &h.ctx.bus,
        &policies,
        "https://portal.test",
        project_id,
    )
    .await
    .unwrap();
    assert_eq!(action, ReminderAction::Sent(3));
    let sent = email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["recipients"][0], "client@example.test");

    let onboarding = h.store().get_onboarding(project_id).await.unwrap().unwrap();
    assert_eq!(onboarding.reminder_count, 3);
    assert!(onboarding.next_reminder_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn exhaustion_holds_the_project_after_one_final_reminder() {
    let h = common::harness().await;
    let project_id = onboarding_project(&h).await;
    // One reminder away from the cap, last sent 25h ago.
    h.store()
        .set_reminder_state(project_id, 9, Some(Utc::now() - Duration::hours(25)))
        .await
        .unwrap();
    let email = RecordingEmailNotifier::new();
    let policies = siteline::config::DecisionPolicies::default();
    assert_eq!(policies.max_reminders, 10);

    let actions = run_reminder_scan(
        h.store(),
        Arc::new(email.clone()),
        &h.ctx.bus,
        &policies,
        "https://portal.test",
    )
    .await
    .unwrap();
    assert_eq!(actions, vec![(project_id, ReminderAction::Held)]);
    assert_eq!(email.sent().len(), 1, "email send invoked exactly once");

    let onboarding = h.store().get_onboarding(project_id).await.unwrap().unwrap();
    assert_eq!(onboarding.reminder_count, 10);
    let project = h.store().get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Hold);
    assert!(
        project.hold_reason.as_deref().unwrap().contains("10 times"),
        "reason: {:?}",
        project.hold_reason
    );
}

#[tokio::test]
async fn submitted_onboarding_stops_reminders() {
    let h = common::harness().await;
    let project_id = onboarding_project(&h).await;
    h.store()
        .set_reminder_state(project_id, 1, Some(Utc::now() - Duration::hours(48)))
        .await
        .unwrap();
    h.store()
        .mark_onboarding_submitted(project_id, Utc::now())
        .await
        .unwrap();
    let email = RecordingEmailNotifier::new();
    let policies = siteline::config::DecisionPolicies::default();

    let action = run_reminder_tick(
        h.store(),
        Arc::new(email.clone()),
        &h.ctx.bus,
        &policies,
        "https://portal.test",
        project_id,
    )
    .await
    .unwrap();
    assert_eq!(action, ReminderAction::Skipped);
    assert!(email.sent().is_empty());
}

#[tokio::test]
async fn email_outage_neither_advances_nor_holds() {
    let h = common::harness().await;
    let project_id = onboarding_project(&h).await;
    h.store()
        .set_reminder_state(project_id, 4, Some(Utc::now() - Duration::hours(25)))
        .await
        .unwrap();
    let email = RecordingEmailNotifier::new();
    email.fail_with("smtp unreachable");
    let policies = siteline::config::DecisionPolicies::default();

    let action = run_reminder_tick(
        h.store(),
        Arc::new(email.clone()),
        &h.ctx.bus,
        &policies,
        "https://portal.test",
        project_id,
    )
    .await
    .unwrap();
    assert_eq!(action, ReminderAction::SendFailed);

    let onboarding = h.store().get_onboarding(project_id).await.unwrap().unwrap();
    assert_eq!(onboarding.reminder_count, 4, "counter untouched on failure");
    let project = h.store().get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Active);
}
