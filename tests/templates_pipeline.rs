//! Template pipelines end to end with deterministic collaborators:
//! blueprint run, preview render, validation gating, metrics aggregation,
//! and evolution proposals.

mod common;

use serde_json::json;
use std::sync::Arc;

use siteline::collaborators::StubRunner;
use siteline::queue::WorkerRuntime;
use siteline::queue::generic_jobs::{claim_next_job, get_job};
use siteline::templates::jobs::{
    default_handlers, enqueue_blueprint_job, enqueue_preview_job, enqueue_validation_job,
};
use siteline::templates::metrics::aggregate_template_performance;
use siteline::templates::pipeline::run_blueprint_pipeline;
use siteline::templates::preview::run_template_preview_pipeline;

#[tokio::test]
async fn blueprint_pipeline_produces_validated_template() {
    let h = common::harness().await;
    let store = h.store();
    let template = store
        .create_template("starter", "Starter", Some("general"), Some("modern"))
        .await
        .unwrap();

    let result = run_blueprint_pipeline(store, h.ctx.ai.clone(), template.id, 3, true)
        .await
        .unwrap();
    assert_eq!(result["status"], json!("success"), "result: {result}");

    let template = store.get_template(template.id).await.unwrap().unwrap();
    assert_eq!(template.status, "validated");
    assert!(template.blueprint.is_some());
    assert!(template.blueprint_hash.is_some());
    let quality = template.blueprint_quality.unwrap();
    assert_eq!(quality["status"], json!("pass"));
    assert!(!template.prompt_log.as_array().unwrap().is_empty());
    // A fresh blueprint resets validation.
    assert_eq!(template.validation_status, "not_run");
}

#[tokio::test]
async fn preview_pipeline_uploads_bundle_and_thumbnail() {
    let h = common::harness().await;
    let store = h.store();
    let template_id = common::seed_validated_template(store).await;

    let result = run_template_preview_pipeline(store, h.ctx.objects.clone(), template_id)
        .await
        .unwrap();
    assert_eq!(result["status"], json!("ready"), "result: {result}");

    let template = store.get_template(template_id).await.unwrap().unwrap();
    assert_eq!(template.preview_status, "ready");
    let url = template.preview_url.unwrap();
    assert!(url.contains("templates/harbor/v1/"), "namespaced key: {url}");
    assert!(template.preview_thumbnail_url.is_some());
}

#[tokio::test]
async fn preview_without_blueprint_fails_cleanly() {
    let h = common::harness().await;
    let store = h.store();
    let template = store
        .create_template("bare", "Bare", None, None)
        .await
        .unwrap();

    let result = run_template_preview_pipeline(store, h.ctx.objects.clone(), template.id)
        .await
        .unwrap();
    assert_eq!(result["status"], json!("failed"));
    let template = store.get_template(template.id).await.unwrap().unwrap();
    assert_eq!(template.preview_status, "failed");
    assert!(template.preview_error.unwrap().contains("No blueprint"));
}

#[tokio::test]
async fn validation_passes_then_skips_identical_inputs() {
    let h = common::harness().await;
    let store = h.store();
    let template_id = common::seed_validated_template(store).await;
    run_template_preview_pipeline(store, h.ctx.objects.clone(), template_id)
        .await
        .unwrap();

    let worker = WorkerRuntime::new(h.ctx.clone(), default_handlers(&h.ctx));
    enqueue_validation_job(store, template_id, false).await.unwrap();
    worker.run_until_idle().await.unwrap();

    let template = store.get_template(template_id).await.unwrap().unwrap();
    assert_eq!(template.validation_status, "passed");
    let first_run_at = template.validation_last_run_at.unwrap();
    let hash = template.validation_hash.clone().unwrap();

    // Same inputs: the pipeline reports passed without re-running.
    let bundle = store.load_policy_bundle().await.unwrap();
    let mut thresholds = serde_json::to_value(&bundle.thresholds).unwrap();
    thresholds["lighthouse_floor"] =
        serde_json::to_value(&bundle.policies.lighthouse_floor).unwrap();
    let rerun = siteline::templates::validation::run_template_validation_pipeline(
        store,
        &h.ctx.runners,
        &thresholds,
        template_id,
        false,
    )
    .await
    .unwrap();
    assert_eq!(rerun["skipped"], json!(true));
    let template = store.get_template(template_id).await.unwrap().unwrap();
    assert_eq!(template.validation_last_run_at.unwrap(), first_run_at);
    assert_eq!(template.validation_hash.unwrap(), hash);
}

#[tokio::test]
async fn failing_runners_gate_the_template() {
    let h = common::harness_with_runners(vec![
        Arc::new(StubRunner::new(
            "lighthouse",
            json!({"performance": 55, "accessibility": 97, "best_practices": 95, "seo": 96}),
        )),
        Arc::new(StubRunner::new("axe", json!({"critical": 2, "serious": 0}))),
        Arc::new(StubRunner::content_passing()),
    ])
    .await;
    let store = h.store();
    let template_id = common::seed_validated_template(store).await;
    run_template_preview_pipeline(store, h.ctx.objects.clone(), template_id)
        .await
        .unwrap();

    let worker = WorkerRuntime::new(h.ctx.clone(), default_handlers(&h.ctx));
    enqueue_validation_job(store, template_id, false).await.unwrap();
    worker.run_until_idle().await.unwrap();

    let template = store.get_template(template_id).await.unwrap().unwrap();
    assert_eq!(template.validation_status, "failed");
    let results = template.validation_results.unwrap();
    let reasons: Vec<String> = results["failed_reasons"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    assert!(reasons.iter().any(|r| r.contains("lighthouse.performance")));
    assert!(reasons.iter().any(|r| r.contains("axe.critical")));
    assert!(template.preview_error.is_some());
}

#[tokio::test]
async fn blueprint_jobs_coalesce_on_idempotency_key() {
    let h = common::harness().await;
    let store = h.store();
    let template = store
        .create_template("starter", "Starter", None, None)
        .await
        .unwrap();

    let first = enqueue_blueprint_job(store, template.id, true).await.unwrap();
    let second = enqueue_blueprint_job(store, template.id, true).await.unwrap();
    assert_eq!(first, second);

    let worker = WorkerRuntime::new(h.ctx.clone(), default_handlers(&h.ctx));
    let processed = worker.run_until_idle().await.unwrap();
    assert_eq!(processed, 1);
    let job = get_job(store, first).await.unwrap().unwrap();
    assert_eq!(job.status.encode(), "success");
}

#[tokio::test]
async fn preview_job_runs_through_the_worker() {
    let h = common::harness().await;
    let store = h.store();
    let template_id = common::seed_validated_template(store).await;
    enqueue_preview_job(store, template_id).await.unwrap();

    let worker = WorkerRuntime::new(h.ctx.clone(), default_handlers(&h.ctx));
    worker.run_until_idle().await.unwrap();
    let template = store.get_template(template_id).await.unwrap().unwrap();
    assert_eq!(template.preview_status, "ready");
    // Queue drained.
    assert!(claim_next_job(store, "probe", 10).await.unwrap().is_none());
}

#[tokio::test]
async fn metrics_aggregation_weights_feedback() {
    let h = common::harness().await;
    let store = h.store();
    let template_id = common::seed_validated_template(store).await;
    let project_id = common::create_project(store, "P1").await;
    store
        .add_client_sentiment(project_id, Some(template_id), Some(4.0), None, &[])
        .await
        .unwrap();
    store
        .add_delivery_outcome(project_id, Some(template_id), Some(10.0), 2, Some(true))
        .await
        .unwrap();

    let summary = aggregate_template_performance(store).await.unwrap();
    assert_eq!(summary["templates_updated"], json!(1));

    let template = store.get_template(template_id).await.unwrap().unwrap();
    let metrics = template.performance_metrics.unwrap();
    assert_eq!(metrics["usage_count"], json!(1));
    assert_eq!(metrics["avg_sentiment"], json!(4.0));
    assert_eq!(metrics["avg_defects"], json!(2.0));
    assert_eq!(metrics["conversion_proxy"], json!(1.0));
    // 0.4*(4/5) + 0.35*(1 - 2/20) + 0.25*(1 - 10/30) = 0.802 (rounded).
    assert_eq!(metrics["weighted_score"], json!(0.802));

    let stamp = store
        .get_config_value("last_template_metrics_updated_at")
        .await
        .unwrap();
    assert!(stamp.is_some());
}

#[tokio::test]
async fn evolution_proposals_are_stored_never_applied() {
    let h = common::harness().await;
    let store = h.store();
    let template_id = common::seed_validated_template(store).await;
    let project_id = common::create_project(store, "P1").await;
    for _ in 0..2 {
        store
            .add_client_sentiment(
                project_id,
                Some(template_id),
                Some(2.0),
                None,
                &["accessibility".to_string()],
            )
            .await
            .unwrap();
    }
    store
        .save_template_metrics(template_id, &json!({"avg_sentiment": 2.0, "avg_defects": 4.0}))
        .await
        .unwrap();

    let before = store.get_template(template_id).await.unwrap().unwrap();
    let result = siteline::templates::evolution::run_evolution_proposal(store, template_id)
        .await
        .unwrap();
    assert_eq!(result["status"], json!("ok"));

    let proposals = store.list_evolution_proposals(template_id).await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert!(
        !proposals[0]["suggested_blueprint_changes"].as_array().unwrap().is_empty()
    );
    // The blueprint itself is untouched.
    let after = store.get_template(template_id).await.unwrap().unwrap();
    assert_eq!(after.blueprint, before.blueprint);
    assert_eq!(after.version, before.version);
}
