//! Generic job queue for template pipelines and other typed work.
//!
//! Differences from the stage queue: free-form `type` + payload, an
//! `idempotency_key` unique across non-terminal statuses (duplicate enqueues
//! return the existing id), and an explicit lease (`lock_expires_at`,
//! default 120 s) that running workers must extend as a heartbeat. Claims
//! take `queued`/`retry` jobs whose `run_at` has passed and whose lease (if
//! any) expired, so a crashed worker's job becomes claimable again on lease
//! expiry. Retry backoff is `min(900, 2^attempts·10)` seconds.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::model::{GenericJob, GenericJobStatus};
use crate::store::{
    PipelineStore, Result, StoreError, parse_json, parse_ts, parse_ts_opt, parse_uuid, ts,
};
use crate::util::retry::generic_job_backoff;

pub const DEFAULT_LEASE_SECONDS: i64 = 120;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;
const MAX_LAST_ERROR_LEN: usize = 2000;

// Well-known job types for the template pipelines.
pub const JOB_TYPE_BLUEPRINT: &str = "template.blueprint.generate";
pub const JOB_TYPE_PREVIEW: &str = "template.preview.render";
pub const JOB_TYPE_VALIDATION: &str = "template.validation.run";
pub const JOB_TYPE_METRICS: &str = "template.metrics.aggregate";
pub const JOB_TYPE_EVOLUTION: &str = "template.evolution.propose";

fn job_from_row(row: &SqliteRow) -> Result<GenericJob> {
    let id: String = row.get("id");
    let status_raw: String = row.get("status");
    Ok(GenericJob {
        id: parse_uuid(&id, "jobs.id")?,
        job_type: row.get("type"),
        payload: parse_json(&row.get::<String, _>("payload_json")),
        status: GenericJobStatus::decode(&status_raw).ok_or_else(|| StoreError::Corrupt {
            what: format!("jobs.status '{status_raw}'"),
        })?,
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        run_at: parse_ts(&row.get::<String, _>("run_at")),
        locked_by: row.get("locked_by"),
        locked_at: parse_ts_opt(row.get("locked_at")),
        lock_expires_at: parse_ts_opt(row.get("lock_expires_at")),
        idempotency_key: row.get("idempotency_key"),
        last_error: row.get("last_error"),
        created_at: parse_ts(&row.get::<String, _>("created_at")),
        updated_at: parse_ts(&row.get::<String, _>("updated_at")),
    })
}

const JOB_COLUMNS: &str = "id, type, payload_json, status, attempts, max_attempts, run_at, \
     locked_by, locked_at, lock_expires_at, idempotency_key, last_error, created_at, updated_at";

/// Enqueue a typed job. With an `idempotency_key`, an existing job in a
/// non-terminal status short-circuits and its id is returned instead.
#[instrument(skip(store, payload), err)]
pub async fn enqueue_job(
    store: &PipelineStore,
    job_type: &str,
    payload: Value,
    idempotency_key: Option<&str>,
    run_at: Option<DateTime<Utc>>,
    max_attempts: i64,
) -> Result<Uuid> {
    if let Some(key) = idempotency_key {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE idempotency_key = ?1 \
             AND status IN ('queued', 'running', 'retry') LIMIT 1",
        )
        .bind(key)
        .fetch_optional(store.pool())
        .await?;
        if let Some(existing) = existing {
            debug!(key, job_id = %existing, "generic job idempotent skip");
            return parse_uuid(&existing, "jobs.id");
        }
    }
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO jobs (id, type, payload_json, status, attempts, max_attempts, run_at, \
         idempotency_key, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?7, ?7)",
    )
    .bind(id.to_string())
    .bind(job_type)
    .bind(payload.to_string())
    .bind(max_attempts.max(1))
    .bind(ts(run_at.unwrap_or(now)))
    .bind(idempotency_key)
    .bind(ts(now))
    .execute(store.pool())
    .await?;
    Ok(id)
}

pub async fn get_job(store: &PipelineStore, job_id: Uuid) -> Result<Option<GenericJob>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(job_id.to_string())
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Claim one due job under a fresh lease.
#[instrument(skip(store), err)]
pub async fn claim_next_job(
    store: &PipelineStore,
    worker_id: &str,
    lease_seconds: i64,
) -> Result<Option<GenericJob>> {
    let now = Utc::now();
    let lease_until = now + ChronoDuration::seconds(lease_seconds.max(1));
    let row = sqlx::query(&format!(
        "UPDATE jobs SET status = 'running', locked_by = ?1, locked_at = ?2, \
         lock_expires_at = ?3, updated_at = ?2 \
         WHERE id = (\
             SELECT id FROM jobs \
             WHERE status IN ('queued', 'retry') AND run_at <= ?2 \
             AND (lock_expires_at IS NULL OR lock_expires_at < ?2) \
             ORDER BY run_at ASC, rowid ASC LIMIT 1\
         ) RETURNING {JOB_COLUMNS}"
    ))
    .bind(worker_id)
    .bind(ts(now))
    .bind(ts(lease_until))
    .fetch_optional(store.pool())
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Heartbeat: push the lease out while still running. Returns `false` when
/// the job is no longer running (lease already reclaimed).
pub async fn extend_lease(
    store: &PipelineStore,
    job_id: Uuid,
    lease_seconds: i64,
) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE jobs SET lock_expires_at = ?2, updated_at = ?3 \
         WHERE id = ?1 AND status = 'running'",
    )
    .bind(job_id.to_string())
    .bind(ts(now + ChronoDuration::seconds(lease_seconds.max(1))))
    .bind(ts(now))
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Lease reclaim: running jobs whose lease expired (worker crashed or lost
/// its heartbeat) go back to `retry` so another worker can claim them.
/// Returns the number reclaimed.
#[instrument(skip(store), err)]
pub async fn reclaim_expired_leases(store: &PipelineStore) -> Result<u64> {
    let now = ts(Utc::now());
    let result = sqlx::query(
        "UPDATE jobs SET status = 'retry', locked_by = NULL, locked_at = NULL, \
         lock_expires_at = NULL, updated_at = ?1 \
         WHERE status = 'running' AND lock_expires_at IS NOT NULL AND lock_expires_at < ?1",
    )
    .bind(&now)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_job_success(store: &PipelineStore, job_id: Uuid) -> Result<Option<GenericJob>> {
    sqlx::query(
        "UPDATE jobs SET status = 'success', locked_by = NULL, locked_at = NULL, \
         lock_expires_at = NULL, updated_at = ?2 WHERE id = ?1",
    )
    .bind(job_id.to_string())
    .bind(ts(Utc::now()))
    .execute(store.pool())
    .await?;
    get_job(store, job_id).await
}

/// Count the attempt and either re-queue with backoff or mark the job dead.
#[instrument(skip(store), err)]
pub async fn mark_job_failed(
    store: &PipelineStore,
    job_id: Uuid,
    error_message: &str,
) -> Result<Option<GenericJob>> {
    let Some(job) = get_job(store, job_id).await? else {
        return Ok(None);
    };
    let now = Utc::now();
    let attempts = job.attempts + 1;
    let truncated: String = error_message.chars().take(MAX_LAST_ERROR_LEN).collect();
    if attempts >= job.max_attempts {
        sqlx::query(
            "UPDATE jobs SET status = 'dead', attempts = ?2, last_error = ?3, locked_by = NULL, \
             locked_at = NULL, lock_expires_at = NULL, updated_at = ?4 WHERE id = ?1",
        )
        .bind(job_id.to_string())
        .bind(attempts)
        .bind(&truncated)
        .bind(ts(now))
        .execute(store.pool())
        .await?;
    } else {
        let delay = generic_job_backoff(attempts);
        let next = now + ChronoDuration::from_std(delay).unwrap_or_default();
        sqlx::query(
            "UPDATE jobs SET status = 'retry', attempts = ?2, last_error = ?3, run_at = ?4, \
             locked_by = NULL, locked_at = NULL, lock_expires_at = NULL, updated_at = ?5 \
             WHERE id = ?1",
        )
        .bind(job_id.to_string())
        .bind(attempts)
        .bind(&truncated)
        .bind(ts(next))
        .bind(ts(now))
        .execute(store.pool())
        .await?;
    }
    get_job(store, job_id).await
}
