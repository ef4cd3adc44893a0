//! Queue discipline: claims, retries with backoff, idempotency keys,
//! leases, and stuck-job recovery.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use siteline::model::{GenericJobStatus, StageJobStatus};
use siteline::queue::generic_jobs::{
    claim_next_job, enqueue_job, extend_lease, get_job, mark_job_failed, mark_job_success,
    reclaim_expired_leases,
};
use siteline::queue::stage_jobs::{
    cancel_stage_job, claim_next_stage_job, enqueue_stage_job, get_stage_job, mark_failed,
    mark_running, mark_success, sweep_stuck_jobs,
};
use siteline::stages::Stage;
use uuid::Uuid;

#[tokio::test]
async fn stage_job_lifecycle_success() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    let job_id = enqueue_stage_job(
        store,
        &h.ctx.bus,
        project_id,
        Stage::Build,
        json!({"action": "build"}),
        Some("req-1"),
        None,
        3,
    )
    .await
    .unwrap();

    let claimed = claim_next_stage_job(store, &h.ctx.bus, "w1").await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.locked_by.as_deref(), Some("w1"));

    // Second worker finds nothing: the claim is exclusive.
    assert!(claim_next_stage_job(store, &h.ctx.bus, "w2").await.unwrap().is_none());

    let running = mark_running(store, &h.ctx.bus, job_id).await.unwrap().unwrap();
    assert_eq!(running.status, StageJobStatus::Running);
    assert_eq!(running.attempts, 1);
    assert!(running.locked_by.is_some(), "RUNNING implies locked_by");
    assert!(running.started_at.is_some());

    let done = mark_success(store, &h.ctx.bus, job_id).await.unwrap().unwrap();
    assert_eq!(done.status, StageJobStatus::Success);
    assert!(done.locked_by.is_none());

    // The notification stream saw every state change.
    let events = h.notifications.snapshot();
    assert!(events.iter().filter(|e| e.event_type == "JOB_UPDATE").count() >= 3);
}

#[tokio::test]
async fn stage_job_retries_with_backoff_then_fails_terminally() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    let job_id = enqueue_stage_job(
        store,
        &h.ctx.bus,
        project_id,
        Stage::Test,
        json!({}),
        None,
        None,
        2,
    )
    .await
    .unwrap();

    claim_next_stage_job(store, &h.ctx.bus, "w1").await.unwrap().unwrap();
    mark_running(store, &h.ctx.bus, job_id).await.unwrap();
    let retried = mark_failed(store, &h.ctx.bus, job_id, json!({"error": "flaky"}), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.status, StageJobStatus::Queued);
    assert!(retried.next_run_at > Utc::now(), "backoff pushed next_run_at out");
    // Not yet claimable: the backoff window holds it.
    assert!(claim_next_stage_job(store, &h.ctx.bus, "w1").await.unwrap().is_none());

    // Second (final) attempt fails retryably but attempts are exhausted.
    sqlx::query("UPDATE stage_jobs SET next_run_at = ?2, locked_by = NULL WHERE id = ?1")
        .bind(job_id.to_string())
        .bind((Utc::now() - Duration::seconds(1)).to_rfc3339())
        .execute(store.pool())
        .await
        .unwrap();
    claim_next_stage_job(store, &h.ctx.bus, "w1").await.unwrap().unwrap();
    mark_running(store, &h.ctx.bus, job_id).await.unwrap();
    let dead = mark_failed(store, &h.ctx.bus, job_id, json!({"error": "flaky"}), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.status, StageJobStatus::Failed);
    assert!(dead.attempts <= dead.max_attempts);
}

#[tokio::test]
async fn cancel_is_advisory_and_noop_for_missing_jobs() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    assert!(
        cancel_stage_job(store, &h.ctx.bus, Uuid::new_v4()).await.unwrap().is_none(),
        "cancel on a missing job returns None"
    );

    let job_id = enqueue_stage_job(
        store,
        &h.ctx.bus,
        project_id,
        Stage::Build,
        json!({}),
        None,
        None,
        3,
    )
    .await
    .unwrap();
    let canceled = cancel_stage_job(store, &h.ctx.bus, job_id).await.unwrap().unwrap();
    assert_eq!(canceled.status, StageJobStatus::Canceled);
    assert!(canceled.locked_by.is_none());
}

#[tokio::test]
async fn stuck_running_jobs_are_swept_to_failed() {
    let h = common::harness().await;
    let store = h.store();
    let project_id = common::create_project(store, "P1").await;
    store.ensure_stage_states(project_id).await.unwrap();

    let job_id = enqueue_stage_job(
        store,
        &h.ctx.bus,
        project_id,
        Stage::Build,
        json!({}),
        None,
        None,
        3,
    )
    .await
    .unwrap();
    claim_next_stage_job(store, &h.ctx.bus, "w1").await.unwrap();
    mark_running(store, &h.ctx.bus, job_id).await.unwrap();

    // Pretend the job started an hour ago.
    sqlx::query("UPDATE stage_jobs SET started_at = ?2 WHERE id = ?1")
        .bind(job_id.to_string())
        .bind((Utc::now() - Duration::hours(1)).to_rfc3339())
        .execute(store.pool())
        .await
        .unwrap();

    let swept = sweep_stuck_jobs(store, &h.ctx.bus, |_| 60).await.unwrap();
    assert_eq!(swept, vec![job_id]);
    let job = get_stage_job(store, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, StageJobStatus::Failed, "timeout is non-retryable");

    let actions = store.list_audit_actions(project_id).await.unwrap();
    assert!(actions.contains(&"WORKER_STAGE_TIMEOUT".to_string()));
}

#[tokio::test]
async fn generic_idempotency_key_coalesces_enqueues() {
    let h = common::harness().await;
    let store = h.store();

    let first = enqueue_job(store, "template.preview.render", json!({"a": 1}), Some("k1"), None, 5)
        .await
        .unwrap();
    let second = enqueue_job(store, "template.preview.render", json!({"a": 2}), Some("k1"), None, 5)
        .await
        .unwrap();
    assert_eq!(first, second, "same idempotency key, same job");
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE idempotency_key = 'k1'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);

    // After the job terminates, the key can be reused.
    mark_job_success(store, first).await.unwrap();
    let third = enqueue_job(store, "template.preview.render", json!({"a": 3}), Some("k1"), None, 5)
        .await
        .unwrap();
    assert_ne!(first, third);
}

#[tokio::test]
async fn generic_lease_heartbeat_and_reclaim() {
    let h = common::harness().await;
    let store = h.store();

    let job_id = enqueue_job(store, "template.validation.run", json!({}), None, None, 5)
        .await
        .unwrap();
    let claimed = claim_next_job(store, "w1", 120).await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
    assert!(claimed.lock_expires_at.is_some());

    assert!(extend_lease(store, job_id, 120).await.unwrap());

    // Force lease expiry: the reclaimer hands the job back to the queue.
    sqlx::query("UPDATE jobs SET lock_expires_at = ?2 WHERE id = ?1")
        .bind(job_id.to_string())
        .bind((Utc::now() - Duration::seconds(5)).to_rfc3339())
        .execute(store.pool())
        .await
        .unwrap();
    assert_eq!(reclaim_expired_leases(store).await.unwrap(), 1);
    let job = get_job(store, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, GenericJobStatus::Retry);
    assert!(!extend_lease(store, job_id, 120).await.unwrap(), "no longer running");

    let reclaimed = claim_next_job(store, "w2", 120).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
}

#[tokio::test]
async fn generic_failures_retry_then_die() {
    let h = common::harness().await;
    let store = h.store();

    let job_id = enqueue_job(store, "template.blueprint.generate", json!({}), None, None, 2)
        .await
        .unwrap();
    claim_next_job(store, "w1", 120).await.unwrap().unwrap();
    let retried = mark_job_failed(store, job_id, "model timeout").await.unwrap().unwrap();
    assert_eq!(retried.status, GenericJobStatus::Retry);
    assert_eq!(retried.attempts, 1);
    assert!(retried.run_at > Utc::now());
    assert_eq!(retried.last_error.as_deref(), Some("model timeout"));

    // Pull run_at back and fail the final attempt.
    sqlx::query("UPDATE jobs SET run_at = ?2 WHERE id = ?1")
        .bind(job_id.to_string())
        .bind((Utc::now() - Duration::seconds(1)).to_rfc3339())
        .execute(store.pool())
        .await
        .unwrap();
    claim_next_job(store, "w1", 120).await.unwrap().unwrap();
    let dead = mark_job_failed(store, job_id, "model timeout").await.unwrap().unwrap();
    assert_eq!(dead.status, GenericJobStatus::Dead);
    assert_eq!(dead.attempts, 2);
}
