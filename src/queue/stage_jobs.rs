//! Stage-scoped job queue.
//!
//! Jobs are claimed with a single `UPDATE … WHERE id = (SELECT … LIMIT 1)
//! RETURNING …` statement so concurrent workers never double-claim. Retryable
//! failures re-queue with `min(3600, 2^(attempts-1)·30)` seconds of backoff;
//! exhausted or non-retryable failures go to FAILED. Every state change is
//! published on the notification bus.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;
use uuid::Uuid;

use crate::events::NotificationBus;
use crate::model::{StageJob, StageJobStatus};
use crate::stages::Stage;
use crate::store::{
    PipelineStore, Result, StoreError, parse_json, parse_ts, parse_ts_opt, parse_uuid,
    parse_uuid_opt, ts,
};
use crate::util::retry::stage_job_backoff;

fn job_from_row(row: &SqliteRow) -> Result<StageJob> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let stage_raw: String = row.get("stage");
    let status_raw: String = row.get("status");
    Ok(StageJob {
        id: parse_uuid(&id, "stage_jobs.id")?,
        project_id: parse_uuid(&project_id, "stage_jobs.project_id")?,
        stage: Stage::decode(&stage_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("stage_jobs.stage '{stage_raw}'"),
        })?,
        status: StageJobStatus::decode(&status_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("stage_jobs.status '{status_raw}'"),
        })?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        payload: parse_json(&row.get::<String, _>("payload_json")),
        error: parse_json(&row.get::<String, _>("error_json")),
        request_id: row.get("request_id"),
        correlation_id: parse_uuid_opt(row.get("correlation_id")),
        next_run_at: parse_ts(&row.get::<String, _>("next_run_at")),
        locked_by: row.get("locked_by"),
        locked_at: parse_ts_opt(row.get("locked_at")),
        started_at: parse_ts_opt(row.get("started_at")),
        finished_at: parse_ts_opt(row.get("finished_at")),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
    })
}

const JOB_COLUMNS: &str = "id, project_id, stage, status, attempts, max_attempts, payload_json, \
     error_json, request_id, correlation_id, next_run_at, locked_by, locked_at, started_at, \
     finished_at, created_at";

fn broadcast(bus: &NotificationBus, job: &StageJob) {
    bus.emit(
        "JOB_UPDATE",
        job.project_id,
        Some(job.stage.key()),
        json!({
            "job_id": job.id.to_string(),
            "status": job.status.encode(),
            "stage": job.stage.encode(),
            "attempts": job.attempts,
        }),
    );
}

/// Enqueue a job for `(project, stage)`, runnable immediately.
#[instrument(skip(store, bus, payload), err)]
pub async fn enqueue_stage_job(
    store: &PipelineStore,
    bus: &NotificationBus,
    project_id: Uuid,
    stage: Stage,
    payload: Value,
    request_id: Option<&str>,
    actor_user_id: Option<Uuid>,
    max_attempts: i64,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let now = ts(Utc::now());
    sqlx::query(
        "INSERT INTO stage_jobs (id, project_id, stage, status, attempts, max_attempts, \
         payload_json, request_id, next_run_at, created_at) \
         VALUES (?1, ?2, ?3, 'QUEUED', 0, ?4, ?5, ?6, ?7, ?7)",
    )
    .bind(id.to_string())
    .bind(project_id.to_string())
    .bind(stage.encode())
    .bind(max_attempts.max(1))
    .bind(payload.to_string())
    .bind(request_id)
    .bind(&now)
    .execute(store.pool())
    .await?;
    store
        .set_stage_state_job(project_id, stage.key(), id, None)
        .await?;
    store
        .add_audit(
            Some(project_id),
            actor_user_id,
            "JOB_ENQUEUED",
            json!({"job_id": id.to_string(), "stage": stage.encode(), "request_id": request_id}),
        )
        .await?;
    if let Some(job) = get_stage_job(store, id).await? {
        broadcast(bus, &job);
    }
    Ok(id)
}

pub async fn get_stage_job(store: &PipelineStore, job_id: Uuid) -> Result<Option<StageJob>> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM stage_jobs WHERE id = ?1"
    ))
    .bind(job_id.to_string())
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn list_stage_jobs(store: &PipelineStore, project_id: Uuid) -> Result<Vec<StageJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM stage_jobs WHERE project_id = ?1 \
         ORDER BY created_at DESC, rowid DESC"
    ))
    .bind(project_id.to_string())
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Claim the oldest due QUEUED job. The lock columns are written in the same
/// statement that selects the row, so two workers cannot take the same job.
#[instrument(skip(store, bus), err)]
pub async fn claim_next_stage_job(
    store: &PipelineStore,
    bus: &NotificationBus,
    worker_id: &str,
) -> Result<Option<StageJob>> {
    let now = Utc::now();
    let row = sqlx::query(&format!(
        "UPDATE stage_jobs SET locked_by = ?1, locked_at = ?2 \
         WHERE id = (\
             SELECT id FROM stage_jobs \
             WHERE status = 'QUEUED' AND next_run_at <= ?2 AND locked_by IS NULL \
             ORDER BY created_at ASC, rowid ASC LIMIT 1\
         ) RETURNING {JOB_COLUMNS}"
    ))
    .bind(worker_id)
    .bind(ts(now))
    .fetch_optional(store.pool())
    .await?;
    let job = row.as_ref().map(job_from_row).transpose()?;
    if let Some(job) = &job {
        broadcast(bus, job);
    }
    Ok(job)
}

/// Move a claimed job to RUNNING, stamping `started_at` and counting the
/// attempt.
pub async fn mark_running(
    store: &PipelineStore,
    bus: &NotificationBus,
    job_id: Uuid,
) -> Result<Option<StageJob>> {
    let now = ts(Utc::now());
    sqlx::query(
        "UPDATE stage_jobs SET status = 'RUNNING', attempts = attempts + 1, \
         started_at = COALESCE(started_at, ?2) WHERE id = ?1",
    )
    .bind(job_id.to_string())
    .bind(&now)
    .execute(store.pool())
    .await?;
    let job = get_stage_job(store, job_id).await?;
    if let Some(job) = &job {
        broadcast(bus, job);
    }
    Ok(job)
}

pub async fn mark_success(
    store: &PipelineStore,
    bus: &NotificationBus,
    job_id: Uuid,
) -> Result<Option<StageJob>> {
    sqlx::query(
        "UPDATE stage_jobs SET status = 'SUCCESS', finished_at = ?2, locked_by = NULL, \
         locked_at = NULL WHERE id = ?1",
    )
    .bind(job_id.to_string())
    .bind(ts(Utc::now()))
    .execute(store.pool())
    .await?;
    let job = get_stage_job(store, job_id).await?;
    if let Some(job) = &job {
        broadcast(bus, job);
    }
    Ok(job)
}

/// Record a failure. Retryable failures under the attempt cap re-queue with
/// backoff; everything else is terminal FAILED.
#[instrument(skip(store, bus, error), err)]
pub async fn mark_failed(
    store: &PipelineStore,
    bus: &NotificationBus,
    job_id: Uuid,
    error: Value,
    retryable: bool,
) -> Result<Option<StageJob>> {
    let Some(job) = get_stage_job(store, job_id).await? else {
        return Ok(None);
    };
    let now = Utc::now();
    if retryable && job.attempts < job.max_attempts {
        let delay = stage_job_backoff(job.attempts);
        let next: DateTime<Utc> = now + chrono::Duration::from_std(delay).unwrap_or_default();
        sqlx::query(
            "UPDATE stage_jobs SET status = 'QUEUED', error_json = ?2, next_run_at = ?3, \
             locked_by = NULL, locked_at = NULL WHERE id = ?1",
        )
        .bind(job_id.to_string())
        .bind(error.to_string())
        .bind(ts(next))
        .execute(store.pool())
        .await?;
    } else {
        sqlx::query(
            "UPDATE stage_jobs SET status = 'FAILED', error_json = ?2, finished_at = ?3, \
             locked_by = NULL, locked_at = NULL WHERE id = ?1",
        )
        .bind(job_id.to_string())
        .bind(error.to_string())
        .bind(ts(now))
        .execute(store.pool())
        .await?;
    }
    let job = get_stage_job(store, job_id).await?;
    if let Some(job) = &job {
        broadcast(bus, job);
    }
    Ok(job)
}

/// Park the job for a human: terminal until someone intervenes.
pub async fn mark_needs_human(
    store: &PipelineStore,
    bus: &NotificationBus,
    job_id: Uuid,
    report: Value,
) -> Result<Option<StageJob>> {
    sqlx::query(
        "UPDATE stage_jobs SET status = 'NEEDS_HUMAN', error_json = ?2, finished_at = ?3, \
         locked_by = NULL, locked_at = NULL WHERE id = ?1",
    )
    .bind(job_id.to_string())
    .bind(report.to_string())
    .bind(ts(Utc::now()))
    .execute(store.pool())
    .await?;
    let job = get_stage_job(store, job_id).await?;
    if let Some(job) = &job {
        broadcast(bus, job);
    }
    Ok(job)
}

/// Advisory cancel: sets CANCELED and clears the lock. An in-flight worker
/// finishing afterwards still commits; subsequent orchestrator passes treat
/// CANCELED as terminal.
pub async fn cancel_stage_job(
    store: &PipelineStore,
    bus: &NotificationBus,
    job_id: Uuid,
) -> Result<Option<StageJob>> {
    let Some(_) = get_stage_job(store, job_id).await? else {
        return Ok(None);
    };
    sqlx::query(
        "UPDATE stage_jobs SET status = 'CANCELED', finished_at = ?2, locked_by = NULL, \
         locked_at = NULL WHERE id = ?1",
    )
    .bind(job_id.to_string())
    .bind(ts(Utc::now()))
    .execute(store.pool())
    .await?;
    let job = get_stage_job(store, job_id).await?;
    if let Some(job) = &job {
        broadcast(bus, job);
    }
    Ok(job)
}

/// Stuck-job recovery: any RUNNING job whose `started_at` exceeded its stage
/// timeout is marked FAILED non-retryably. Returns the ids swept.
#[instrument(skip(store, bus, timeout_seconds_for), err)]
pub async fn sweep_stuck_jobs(
    store: &PipelineStore,
    bus: &NotificationBus,
    timeout_seconds_for: impl Fn(Stage) -> u64,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM stage_jobs \
         WHERE status = 'RUNNING' AND started_at IS NOT NULL"
    ))
    .fetch_all(store.pool())
    .await?;
    let now = Utc::now();
    let mut swept = Vec::new();
    for row in &rows {
        let job = job_from_row(row)?;
        let Some(started_at) = job.started_at else {
            continue;
        };
        let timeout = timeout_seconds_for(job.stage);
        if (now - started_at).num_seconds() as u64 > timeout {
            mark_failed(
                store,
                bus,
                job.id,
                json!({"error": "Job exceeded max runtime"}),
                false,
            )
            .await?;
            store
                .add_audit(
                    Some(job.project_id),
                    None,
                    "WORKER_STAGE_TIMEOUT",
                    json!({"job_id": job.id.to_string(), "stage": job.stage.encode()}),
                )
                .await?;
            swept.push(job.id);
        }
    }
    Ok(swept)
}
