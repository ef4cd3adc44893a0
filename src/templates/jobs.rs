//! Generic-job handlers for the template pipelines.
//!
//! Each handler wraps one pipeline; preview and validation runs are bounded
//! by semaphores so a burst of enqueues cannot saturate the worker.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::model::GenericJob;
use crate::queue::WorkerContext;
use crate::queue::generic_jobs::{
    JOB_TYPE_BLUEPRINT, JOB_TYPE_EVOLUTION, JOB_TYPE_METRICS, JOB_TYPE_PREVIEW,
    JOB_TYPE_VALIDATION, enqueue_job,
};
use crate::queue::worker::GenericJobHandler;
use crate::store::PipelineStore;
use crate::templates::evolution::run_evolution_proposal;
use crate::templates::metrics::aggregate_template_performance;
use crate::templates::pipeline::{DEFAULT_MAX_ITERATIONS, run_blueprint_pipeline};
use crate::templates::preview::run_template_preview_pipeline;
use crate::templates::validation::run_template_validation_pipeline;

pub const PREVIEW_CONCURRENCY: usize = 2;
pub const VALIDATION_CONCURRENCY: usize = 2;

fn template_id_from(job: &GenericJob) -> Result<Uuid, String> {
    job.payload
        .get("template_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| "payload missing template_id".to_string())
}

/// Enqueue a blueprint run, keyed so duplicate requests coalesce.
pub async fn enqueue_blueprint_job(
    store: &PipelineStore,
    template_id: Uuid,
    regenerate: bool,
) -> Result<Uuid, crate::store::StoreError> {
    enqueue_job(
        store,
        JOB_TYPE_BLUEPRINT,
        json!({"template_id": template_id.to_string(), "regenerate": regenerate}),
        Some(&format!("blueprint:{template_id}")),
        None,
        5,
    )
    .await
}

pub async fn enqueue_preview_job(
    store: &PipelineStore,
    template_id: Uuid,
) -> Result<Uuid, crate::store::StoreError> {
    enqueue_job(
        store,
        JOB_TYPE_PREVIEW,
        json!({"template_id": template_id.to_string()}),
        Some(&format!("preview:{template_id}")),
        None,
        5,
    )
    .await
}

pub async fn enqueue_validation_job(
    store: &PipelineStore,
    template_id: Uuid,
    force: bool,
) -> Result<Uuid, crate::store::StoreError> {
    enqueue_job(
        store,
        JOB_TYPE_VALIDATION,
        json!({"template_id": template_id.to_string(), "force": force}),
        Some(&format!("validation:{template_id}")),
        None,
        5,
    )
    .await
}

struct BlueprintHandler {
    ctx: WorkerContext,
}

#[async_trait]
impl GenericJobHandler for BlueprintHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_BLUEPRINT
    }

    async fn run(&self, job: &GenericJob) -> Result<Value, String> {
        let template_id = template_id_from(job)?;
        let max_iterations = job
            .payload
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let regenerate = job
            .payload
            .get("regenerate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let result = run_blueprint_pipeline(
            &self.ctx.store,
            self.ctx.ai.clone(),
            template_id,
            max_iterations,
            regenerate,
        )
        .await
        .map_err(|e| e.to_string())?;
        match result.get("status").and_then(Value::as_str) {
            Some("success" | "pass" | "fail") => Ok(result),
            _ => Err(result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("blueprint pipeline failed")
                .to_string()),
        }
    }
}

struct PreviewHandler {
    ctx: WorkerContext,
    semaphore: Arc<Semaphore>,
}

#[async_trait]
impl GenericJobHandler for PreviewHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_PREVIEW
    }

    async fn run(&self, job: &GenericJob) -> Result<Value, String> {
        let template_id = template_id_from(job)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| "preview semaphore closed".to_string())?;
        let result =
            run_template_preview_pipeline(&self.ctx.store, self.ctx.objects.clone(), template_id)
                .await
                .map_err(|e| e.to_string())?;
        match result.get("status").and_then(Value::as_str) {
            Some("ready") => Ok(result),
            _ => Err(result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("preview pipeline failed")
                .to_string()),
        }
    }
}

struct ValidationHandler {
    ctx: WorkerContext,
    semaphore: Arc<Semaphore>,
}

#[async_trait]
impl GenericJobHandler for ValidationHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_VALIDATION
    }

    async fn run(&self, job: &GenericJob) -> Result<Value, String> {
        let template_id = template_id_from(job)?;
        let force = job
            .payload
            .get("force")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| "validation semaphore closed".to_string())?;
        let bundle = self
            .ctx
            .store
            .load_policy_bundle()
            .await
            .map_err(|e| e.to_string())?;
        let mut thresholds = serde_json::to_value(&bundle.thresholds).unwrap_or(json!({}));
        thresholds["lighthouse_floor"] =
            serde_json::to_value(&bundle.policies.lighthouse_floor).unwrap_or(Value::Null);
        let result = run_template_validation_pipeline(
            &self.ctx.store,
            &self.ctx.runners,
            &thresholds,
            template_id,
            force,
        )
        .await
        .map_err(|e| e.to_string())?;
        // A template failing its gates is a valid outcome, not a job failure.
        Ok(result)
    }
}

struct MetricsHandler {
    ctx: WorkerContext,
}

#[async_trait]
impl GenericJobHandler for MetricsHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_METRICS
    }

    async fn run(&self, _job: &GenericJob) -> Result<Value, String> {
        aggregate_template_performance(&self.ctx.store)
            .await
            .map_err(|e| e.to_string())
    }
}

struct EvolutionHandler {
    ctx: WorkerContext,
}

#[async_trait]
impl GenericJobHandler for EvolutionHandler {
    fn job_type(&self) -> &'static str {
        JOB_TYPE_EVOLUTION
    }

    async fn run(&self, job: &GenericJob) -> Result<Value, String> {
        let template_id = template_id_from(job)?;
        run_evolution_proposal(&self.ctx.store, template_id)
            .await
            .map_err(|e| e.to_string())
    }
}

/// The full handler set for a worker runtime.
#[must_use]
pub fn default_handlers(ctx: &WorkerContext) -> Vec<Arc<dyn GenericJobHandler>> {
    vec![
        Arc::new(BlueprintHandler { ctx: ctx.clone() }),
        Arc::new(PreviewHandler {
            ctx: ctx.clone(),
            semaphore: Arc::new(Semaphore::new(PREVIEW_CONCURRENCY)),
        }),
        Arc::new(ValidationHandler {
            ctx: ctx.clone(),
            semaphore: Arc::new(Semaphore::new(VALIDATION_CONCURRENCY)),
        }),
        Arc::new(MetricsHandler { ctx: ctx.clone() }),
        Arc::new(EvolutionHandler { ctx: ctx.clone() }),
    ]
}
