//! Worker runtime: claims jobs under lease, enforces per-stage timeouts,
//! reports status, and recovers stuck jobs.
//!
//! The worker is a standalone entry point (see `src/bin/worker.rs`) owning
//! its own task pool; the request-handling process may run the sweeper but
//! never executes jobs synchronously. Polling cadence is 2 s by default,
//! parallelism comes from `worker_concurrency_json.max_parallel_jobs`
//! (default 1), and SIGINT/SIGTERM stop claiming while letting in-flight
//! jobs finish.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::agents::{StageAgent, StageRunOutcome, WorkerContext};
use super::generic_jobs::{
    DEFAULT_LEASE_SECONDS, claim_next_job, extend_lease, mark_job_failed, mark_job_success,
    reclaim_expired_leases,
};
use super::stage_jobs::{
    claim_next_stage_job, mark_failed, mark_needs_human, mark_running, mark_success,
    sweep_stuck_jobs,
};
use crate::model::GenericJob;
use crate::orchestrator::Orchestrator;
use crate::store::StoreError;

/// Handler for one generic job type (template pipelines register these).
#[async_trait]
pub trait GenericJobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    /// Run the job. `Err(message)` marks the job failed (retry/dead per the
    /// queue's attempt accounting).
    async fn run(&self, job: &GenericJob) -> Result<Value, String>;
}

pub struct WorkerRuntime {
    ctx: WorkerContext,
    worker_id: String,
    handlers: Vec<Arc<dyn GenericJobHandler>>,
    stopping: Arc<AtomicBool>,
}

impl WorkerRuntime {
    #[must_use]
    pub fn new(ctx: WorkerContext, handlers: Vec<Arc<dyn GenericJobHandler>>) -> Self {
        Self {
            ctx,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            handlers,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Request a graceful stop: no new claims, in-flight jobs finish.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Main loop. Returns when a shutdown signal arrives and in-flight jobs
    /// have drained.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), StoreError> {
        let settings = self.ctx.store.load_policy_bundle().await?.worker;
        let max_parallel = settings.max_parallel_jobs.max(1);
        let poll = Duration::from_secs_f64(settings.poll_interval_seconds.max(0.1));
        info!(worker_id = %self.worker_id, max_parallel, "worker started");

        let mut inflight: JoinSet<()> = JoinSet::new();
        loop {
            if self.stopping.load(Ordering::SeqCst) || shutdown_requested() {
                break;
            }
            while inflight.len() < max_parallel {
                let claimed = self.spawn_one(&mut inflight).await?;
                if !claimed {
                    break;
                }
            }
            // Reap finished tasks without blocking the poll cadence.
            while inflight.try_join_next().is_some() {}
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = wait_for_shutdown() => break,
            }
        }

        info!(worker_id = %self.worker_id, "worker draining in-flight jobs");
        while inflight.join_next().await.is_some() {}
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Claim one stage job or one generic job and spawn its execution.
    /// Returns whether anything was claimed.
    async fn spawn_one(&self, inflight: &mut JoinSet<()>) -> Result<bool, StoreError> {
        let policies = self.ctx.store.load_policy_bundle().await?;
        sweep_stuck_jobs(&self.ctx.store, &self.ctx.bus, |stage| {
            policies.thresholds.stage_timeouts_minutes.seconds_for(stage)
        })
        .await?;
        reclaim_expired_leases(&self.ctx.store).await?;

        if let Some(job) =
            claim_next_stage_job(&self.ctx.store, &self.ctx.bus, &self.worker_id).await?
        {
            let ctx = self.ctx.clone();
            let job_id = job.id;
            inflight.spawn(async move {
                if let Err(err) = run_stage_job(&ctx, job_id).await {
                    error!(%job_id, %err, "stage job execution errored");
                }
            });
            return Ok(true);
        }

        if let Some(job) =
            claim_next_job(&self.ctx.store, &self.worker_id, DEFAULT_LEASE_SECONDS).await?
        {
            let ctx = self.ctx.clone();
            let handlers = self.handlers.clone();
            inflight.spawn(async move {
                run_generic_job(&ctx, &handlers, job).await;
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Process queued work until both queues are empty. Test/ops helper; the
    /// production loop is [`run`](Self::run).
    pub async fn run_until_idle(&self) -> Result<usize, StoreError> {
        let mut processed = 0;
        loop {
            let policies = self.ctx.store.load_policy_bundle().await?;
            sweep_stuck_jobs(&self.ctx.store, &self.ctx.bus, |stage| {
                policies.thresholds.stage_timeouts_minutes.seconds_for(stage)
            })
            .await?;
            reclaim_expired_leases(&self.ctx.store).await?;
            if let Some(job) =
                claim_next_stage_job(&self.ctx.store, &self.ctx.bus, &self.worker_id).await?
            {
                run_stage_job(&self.ctx, job.id).await?;
                processed += 1;
                continue;
            }
            if let Some(job) =
                claim_next_job(&self.ctx.store, &self.worker_id, DEFAULT_LEASE_SECONDS).await?
            {
                run_generic_job(&self.ctx, &self.handlers, job).await;
                processed += 1;
                continue;
            }
            return Ok(processed);
        }
    }
}

/// Execute one claimed stage job end to end.
#[instrument(skip(ctx), err)]
async fn run_stage_job(ctx: &WorkerContext, job_id: Uuid) -> Result<(), StoreError> {
    let Some(job) = mark_running(&ctx.store, &ctx.bus, job_id).await? else {
        return Ok(());
    };
    let policies = ctx.store.load_policy_bundle().await?;
    ctx.store
        .add_audit(
            Some(job.project_id),
            None,
            "WORKER_STAGE_STARTED",
            json!({"job_id": job.id.to_string(), "stage": job.stage.encode(), "request_id": job.request_id}),
        )
        .await?;

    let Some(agent) = StageAgent::for_stage(job.stage) else {
        mark_success(&ctx.store, &ctx.bus, job.id).await?;
        return Ok(());
    };
    let timeout_seconds = policies.thresholds.stage_timeouts_minutes.seconds_for(job.stage);
    let run = timeout(
        Duration::from_secs(timeout_seconds),
        agent.run(ctx, &policies, job.project_id, &job.payload),
    )
    .await;

    let status_label: &str;
    match run {
        Err(_elapsed) => {
            status_label = "TIMEOUT";
            mark_failed(
                &ctx.store,
                &ctx.bus,
                job.id,
                json!({"error": "Job execution timed out"}),
                false,
            )
            .await?;
            ctx.store
                .add_audit(
                    Some(job.project_id),
                    None,
                    "WORKER_STAGE_TIMEOUT",
                    json!({"job_id": job.id.to_string(), "stage": job.stage.encode()}),
                )
                .await?;
        }
        Ok(Err(err)) => {
            status_label = "ERROR";
            warn!(%err, "stage agent errored; retrying");
            mark_failed(
                &ctx.store,
                &ctx.bus,
                job.id,
                json!({"error": err.to_string()}),
                true,
            )
            .await?;
        }
        Ok(Ok(result)) => {
            ctx.store
                .set_stage_state_job(
                    job.project_id,
                    job.stage.key(),
                    job.id,
                    Some(&result.outputs),
                )
                .await?;
            match result.outcome {
                StageRunOutcome::Success => {
                    status_label = "SUCCESS";
                    mark_success(&ctx.store, &ctx.bus, job.id).await?;
                }
                StageRunOutcome::NeedsHuman => {
                    status_label = "NEEDS_HUMAN";
                    mark_needs_human(&ctx.store, &ctx.bus, job.id, result.outputs.clone()).await?;
                }
                StageRunOutcome::Failed { retryable } => {
                    status_label = "FAILED";
                    mark_failed(&ctx.store, &ctx.bus, job.id, result.outputs.clone(), retryable)
                        .await?;
                }
            }
        }
    }

    ctx.store
        .add_audit(
            Some(job.project_id),
            None,
            "WORKER_STAGE_FINISHED",
            json!({"job_id": job.id.to_string(), "stage": job.stage.encode(), "status": status_label}),
        )
        .await?;

    // Ask the orchestrator what comes next; a blocked result is fine here.
    let orchestrator = Orchestrator::new(ctx.clone());
    if let Err(err) = orchestrator.auto_advance(job.project_id, "worker").await {
        warn!(%err, project_id = %job.project_id, "auto-advance after stage job failed");
    }
    Ok(())
}

/// Execute one claimed generic job with a lease heartbeat.
async fn run_generic_job(
    ctx: &WorkerContext,
    handlers: &[Arc<dyn GenericJobHandler>],
    job: GenericJob,
) {
    let Some(handler) = handlers.iter().find(|h| h.job_type() == job.job_type) else {
        let _ = mark_job_failed(
            &ctx.store,
            job.id,
            &format!("No handler for job type '{}'", job.job_type),
        )
        .await;
        return;
    };

    let store = ctx.store.clone();
    let job_id = job.id;
    let heartbeat = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(
            (DEFAULT_LEASE_SECONDS as u64 / 2).max(1),
        ));
        tick.tick().await; // immediate first tick
        loop {
            tick.tick().await;
            match extend_lease(&store, job_id, DEFAULT_LEASE_SECONDS).await {
                Ok(true) => {}
                _ => break,
            }
        }
    });

    let result = handler.run(&job).await;
    heartbeat.abort();
    match result {
        Ok(_output) => {
            if let Err(err) = mark_job_success(&ctx.store, job.id).await {
                error!(%err, job_id = %job.id, "failed to record generic job success");
            }
        }
        Err(message) => {
            if let Err(err) = mark_job_failed(&ctx.store, job.id, &message).await {
                error!(%err, job_id = %job.id, "failed to record generic job failure");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown signaling
// ---------------------------------------------------------------------------

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Resolve when SIGINT or SIGTERM arrives (and latch the flag so every
/// worker loop sees it).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return std::future::pending::<()>().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    SHUTDOWN.store(true, Ordering::SeqCst);
}
