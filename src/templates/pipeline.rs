//! Blueprint pipeline: generate → critique → refine, bounded and hash-aware.
//!
//! The loop critiques the current blueprint, stops when the rubric passes,
//! otherwise asks the refiner for a better one. A refinement that hashes
//! identically to its predecessor means the model is stuck and the loop
//! aborts. Schema failures get one repair pass; still-invalid output fails
//! the run with the (redacted) raw output stored on the error.

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::ai::{AiClient, AiError, parse_ai_json};
use crate::model::BlueprintRunStatus;
use crate::store::{PipelineStore, StoreError};
use crate::templates::blueprint::{normalize_schema_version, validate_blueprint_v1};
use crate::templates::rubric::{
    default_thresholds, local_heuristic_scores, meets_thresholds, run_hard_checks,
};
use crate::util::canonical::hash_value;

pub const DEFAULT_MAX_ITERATIONS: usize = 3;

/// Critique outcome: scorecard merged from the model (when it answers) and
/// the local rubric, plus the hard checks.
struct Critique {
    scorecard: FxHashMap<String, i64>,
    hard_checks: FxHashMap<String, bool>,
    issues: Vec<Value>,
    summary: String,
}

async fn critique(ai: &dyn AiClient, blueprint: &Value) -> Critique {
    let hard_checks: FxHashMap<String, bool> = run_hard_checks(blueprint)
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let mut scorecard: FxHashMap<String, i64> = local_heuristic_scores(blueprint)
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let mut issues = Vec::new();
    let mut summary = "Heuristic critique".to_string();

    let prompt = format!(
        "Critique this website blueprint and score it 0-100 on conversion, clarity, \
         accessibility_heuristics, completeness, consistency. Return JSON \
         {{\"scorecard\": {{...}}, \"issues\": [{{\"path\", \"message\", \"fix_hint\"}}], \
         \"summary\": \"...\"}}.\nBlueprint:\n{blueprint}"
    );
    match ai.complete("blueprint.critique", &prompt).await {
        Ok(raw) => {
            if let Ok(parsed) = parse_ai_json("blueprint.critique", &raw) {
                if let Some(model_scores) = parsed.get("scorecard").and_then(Value::as_object) {
                    for (key, value) in model_scores {
                        if let Some(score) = value.as_i64() {
                            scorecard.insert(key.clone(), score.clamp(0, 100));
                        }
                    }
                }
                if let Some(model_issues) = parsed.get("issues").and_then(Value::as_array) {
                    issues = model_issues.clone();
                }
                if let Some(model_summary) = parsed.get("summary").and_then(Value::as_str) {
                    summary = model_summary.chars().take(500).collect();
                }
            }
        }
        Err(err) => warn!(%err, "critique call failed; using heuristic scores"),
    }
    Critique {
        scorecard,
        hard_checks,
        issues,
        summary,
    }
}

async fn refine(
    ai: &dyn AiClient,
    blueprint: &Value,
    issues: &[Value],
) -> Result<Option<Value>, AiError> {
    let prompt = format!(
        "Refine this website blueprint to address the issues. Keep the same JSON schema and \
         return the complete blueprint only.\nIssues:\n{}\nBlueprint:\n{blueprint}",
        Value::Array(issues.to_vec())
    );
    let raw = ai.complete("blueprint.refine", &prompt).await?;
    Ok(parse_ai_json("blueprint.refine", &raw).ok())
}

fn passes(critique: &Critique) -> bool {
    meets_thresholds(&critique.scorecard, &critique.hard_checks)
}

/// Run the blueprint pipeline for a template and persist the result.
#[instrument(skip(store, ai), err)]
pub async fn run_blueprint_pipeline(
    store: &PipelineStore,
    ai: Arc<dyn AiClient>,
    template_id: Uuid,
    max_iterations: usize,
    regenerate: bool,
) -> Result<Value, StoreError> {
    let Some(template) = store.get_template(template_id).await? else {
        return Ok(json!({"status": "failed", "error": "Template not found"}));
    };

    // Generate (or reuse) the starting blueprint.
    let mut blueprint = if regenerate || template.blueprint.is_none() {
        let prompt = format!(
            "Generate a complete website blueprint (schema v1) for template \"{}\" \
             (category: {}, style: {}). Return JSON only.",
            template.name,
            template.category.as_deref().unwrap_or("general"),
            template.style.as_deref().unwrap_or("modern"),
        );
        let raw = match ai.complete("blueprint.generate", &prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                return Ok(json!({"status": "failed", "error": err.to_string()}));
            }
        };
        match parse_ai_json("blueprint.generate", &raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Ok(json!({"status": "failed", "error": err.to_string()}));
            }
        }
    } else {
        template.blueprint.clone().unwrap_or(Value::Null)
    };
    normalize_schema_version(&mut blueprint);

    // One repair pass for schema failures.
    let (valid, schema_errors) = validate_blueprint_v1(&blueprint);
    if !valid {
        let issues: Vec<Value> = schema_errors
            .iter()
            .map(|e| {
                let path = e.split(':').next().unwrap_or("root");
                json!({"path": path, "message": e, "fix_hint": e})
            })
            .collect();
        match refine(ai.as_ref(), &blueprint, &issues).await {
            Ok(Some(mut repaired)) => {
                normalize_schema_version(&mut repaired);
                let (valid, errors) = validate_blueprint_v1(&repaired);
                if valid {
                    blueprint = repaired;
                } else {
                    return Ok(json!({
                        "status": "failed",
                        "error": format!("Blueprint still invalid after repair: {errors:?}"),
                    }));
                }
            }
            _ => {
                return Ok(json!({
                    "status": "failed",
                    "error": format!("Blueprint invalid: {schema_errors:?}"),
                }));
            }
        }
    }

    let mut prompt_log: Vec<Value> = template
        .prompt_log
        .as_array()
        .cloned()
        .unwrap_or_default();
    let mut last_hash = hash_value(&blueprint);
    let iterations = max_iterations.max(1);

    for i in 0..iterations {
        let result = critique(ai.as_ref(), &blueprint).await;
        prompt_log.push(json!({
            "iteration": i + 1,
            "event": "critique",
            "summary": result.summary,
        }));
        if passes(&result) {
            break;
        }
        let refined = match refine(ai.as_ref(), &blueprint, &result.issues).await {
            Ok(Some(refined)) => refined,
            _ => {
                prompt_log.push(json!({"iteration": i + 1, "event": "refine_failed"}));
                break;
            }
        };
        let new_hash = hash_value(&refined);
        if new_hash == last_hash {
            prompt_log.push(json!({
                "iteration": i + 1,
                "event": "stuck",
                "message": "Blueprint unchanged after refine",
            }));
            break;
        }
        last_hash = new_hash;
        blueprint = refined;
        normalize_schema_version(&mut blueprint);
        let (valid, errors) = validate_blueprint_v1(&blueprint);
        if !valid {
            prompt_log.push(json!({
                "iteration": i + 1,
                "event": "schema_errors",
                "errors": errors.iter().take(5).collect::<Vec<_>>(),
            }));
        }
    }

    let final_critique = critique(ai.as_ref(), &blueprint).await;
    let passed = passes(&final_critique);
    let thresholds: FxHashMap<String, i64> = default_thresholds()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let quality = json!({
        "iterations": iterations,
        "scorecard": final_critique.scorecard,
        "hard_checks": final_critique.hard_checks,
        "issues": final_critique.issues,
        "status": if passed { "pass" } else { "fail" },
        "thresholds": thresholds,
    });
    let log_tail: Vec<Value> = prompt_log.iter().rev().take(20).rev().cloned().collect();
    let status = if passed {
        "validated"
    } else if template.status.is_empty() {
        "draft"
    } else {
        template.status.as_str()
    };
    store
        .save_template_blueprint(
            template_id,
            &blueprint,
            &hash_value(&blueprint),
            &quality,
            &Value::Array(log_tail),
            status,
        )
        .await?;

    Ok(json!({
        "status": if passed { "success" } else { "fail" },
        "iterations": iterations,
        "scorecard": quality["scorecard"],
        "hard_checks": quality["hard_checks"],
        "passed": passed,
    }))
}

/// Run a persisted blueprint-run record through the pipeline.
#[instrument(skip(store, ai), err)]
pub async fn run_blueprint_job(
    store: &PipelineStore,
    ai: Arc<dyn AiClient>,
    run_id: Uuid,
) -> Result<(), StoreError> {
    let Some(run) = store.get_blueprint_run(run_id).await? else {
        return Ok(());
    };
    if run.status != BlueprintRunStatus::Queued {
        return Ok(());
    }
    store
        .update_blueprint_run(run_id, BlueprintRunStatus::Running, None, None)
        .await?;
    let max_iterations = run
        .payload
        .get("max_iterations")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);
    let regenerate = run
        .payload
        .get("regenerate")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let result =
        run_blueprint_pipeline(store, ai, run.template_id, max_iterations, regenerate).await?;
    let succeeded = matches!(
        result.get("status").and_then(Value::as_str),
        Some("success" | "pass")
    );
    let error_text = result.get("error").and_then(Value::as_str);
    store
        .update_blueprint_run(
            run_id,
            if succeeded {
                BlueprintRunStatus::Success
            } else {
                BlueprintRunStatus::Failed
            },
            Some(&result),
            error_text,
        )
        .await?;
    Ok(())
}
