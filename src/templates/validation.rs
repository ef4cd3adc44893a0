//! Template validation: external Lighthouse/axe/content reports aggregated
//! into a scorecard and gated on thresholds.
//!
//! Results are keyed by `(blueprint_hash, preview_url, thresholds)` so
//! identical inputs skip a re-run.

use serde_json::{Value, json};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::collaborators::ValidationRunner;
use crate::store::{PipelineStore, StoreError};
use crate::util::canonical::{canonical_json, hash_str};

/// Fold the three reports into a pass/fail scorecard with reasons.
///
/// Thresholds shape (missing pieces fall back to permissive defaults):
/// `{lighthouse_floor: {performance, accessibility, best_practices, seo},
///   axe: {critical_max, serious_max, moderate_max},
///   content: {require_home, require_cta, require_contact_or_lead,
///             require_mobile_meta}}`.
#[must_use]
pub fn aggregate_reports(
    lighthouse: &Value,
    axe: &Value,
    content: &Value,
    thresholds: &Value,
) -> Value {
    let mut failed: Vec<String> = Vec::new();

    let floor = thresholds.get("lighthouse_floor");
    for (metric, floor_key) in [
        ("performance", "performance"),
        ("accessibility", "accessibility"),
        ("best_practices", "best_practices"),
        ("seo", "seo"),
    ] {
        let Some(min) = floor
            .and_then(|f| f.get(floor_key))
            .and_then(Value::as_f64)
        else {
            continue;
        };
        let actual = lighthouse.get(metric).and_then(Value::as_f64);
        match actual {
            Some(actual) if actual >= min => {}
            Some(actual) => {
                failed.push(format!("lighthouse.{metric} {actual} below floor {min}"));
            }
            None => failed.push(format!("lighthouse.{metric} missing")),
        }
    }

    let axe_thresholds = thresholds.get("axe");
    for (severity, max_key) in [
        ("critical", "critical_max"),
        ("serious", "serious_max"),
        ("moderate", "moderate_max"),
    ] {
        let Some(max) = axe_thresholds
            .and_then(|a| a.get(max_key))
            .and_then(Value::as_i64)
        else {
            continue;
        };
        let count = axe.get(severity).and_then(Value::as_i64).unwrap_or(0);
        if count > max {
            failed.push(format!("axe.{severity} count {count} exceeds max {max}"));
        }
    }

    let content_rules = thresholds.get("content");
    for (check, rule_key) in [
        ("has_home", "require_home"),
        ("has_cta", "require_cta"),
        ("has_contact_or_lead", "require_contact_or_lead"),
        ("has_mobile_meta", "require_mobile_meta"),
    ] {
        let required = content_rules
            .and_then(|c| c.get(rule_key))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if required && !content.get(check).and_then(Value::as_bool).unwrap_or(false) {
            failed.push(format!("content check {check} failed"));
        }
    }

    json!({
        "passed": failed.is_empty(),
        "failed_reasons": failed,
        "lighthouse": lighthouse,
        "axe": axe,
        "content": content,
    })
}

/// Stable key over the validation inputs.
#[must_use]
pub fn validation_hash(
    blueprint_hash: Option<&str>,
    preview_url: Option<&str>,
    thresholds: &Value,
) -> String {
    hash_str(&format!(
        "{}|{}|{}",
        blueprint_hash.unwrap_or(""),
        preview_url.unwrap_or(""),
        canonical_json(thresholds)
    ))
}

/// Run the validation pipeline for a template.
///
/// Skips when the validation hash is unchanged and the last run passed
/// (unless `force`). Persists the aggregated scorecard on the template row
/// and promotes the template to `validated` on a pass.
#[instrument(skip(store, runners, thresholds), err)]
pub async fn run_template_validation_pipeline(
    store: &PipelineStore,
    runners: &[Arc<dyn ValidationRunner>],
    thresholds: &Value,
    template_id: Uuid,
    force: bool,
) -> Result<Value, StoreError> {
    let Some(template) = store.get_template(template_id).await? else {
        return Ok(json!({"status": "failed", "error": "Template not found"}));
    };
    let Some(preview_url) = template.preview_url.as_deref() else {
        let error = "No preview URL. Generate preview first.";
        store
            .save_template_validation(
                template_id,
                "failed",
                &json!({"error": error}),
                None,
                Some(error),
                false,
            )
            .await?;
        return Ok(json!({"status": "failed", "error": error}));
    };

    let new_hash = validation_hash(
        template.blueprint_hash.as_deref(),
        Some(preview_url),
        thresholds,
    );
    if !force
        && template.validation_hash.as_deref() == Some(new_hash.as_str())
        && template.validation_status == "passed"
    {
        return Ok(json!({"status": "passed", "skipped": true, "validation_hash": new_hash}));
    }

    let mut reports = serde_json::Map::new();
    for runner in runners {
        match runner.run(preview_url, thresholds).await {
            Ok(report) => {
                reports.insert(runner.name().to_string(), report);
            }
            Err(err) => {
                let error = format!("{} runner failed: {err}", runner.name());
                store
                    .save_template_validation(
                        template_id,
                        "failed",
                        &json!({"error": error}),
                        None,
                        Some(&error),
                        false,
                    )
                    .await?;
                return Ok(json!({"status": "failed", "error": error}));
            }
        }
    }
    let summary = aggregate_reports(
        reports.get("lighthouse").unwrap_or(&Value::Null),
        reports.get("axe").unwrap_or(&Value::Null),
        reports.get("content").unwrap_or(&Value::Null),
        thresholds,
    );
    let passed = summary.get("passed").and_then(Value::as_bool).unwrap_or(false);
    let failed_reasons: Vec<String> = summary
        .get("failed_reasons")
        .and_then(Value::as_array)
        .map(|r| {
            r.iter()
                .filter_map(Value::as_str)
                .take(5)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let preview_error = if passed {
        None
    } else {
        Some(failed_reasons.join("; "))
    };
    store
        .save_template_validation(
            template_id,
            if passed { "passed" } else { "failed" },
            &summary,
            Some(&new_hash),
            preview_error.as_deref(),
            passed,
        )
        .await?;
    Ok(json!({
        "status": if passed { "passed" } else { "failed" },
        "passed": passed,
        "validation_hash": new_hash,
        "failed_reasons": failed_reasons,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Value {
        json!({
            "lighthouse_floor": {"performance": 90.0, "accessibility": 95.0, "best_practices": 90.0, "seo": 90.0},
            "axe": {"critical_max": 0, "serious_max": 0, "moderate_max": 5},
            "content": {"require_home": true, "require_cta": true, "require_contact_or_lead": true, "require_mobile_meta": false},
        })
    }

    #[test]
    fn clean_reports_pass() {
        let summary = aggregate_reports(
            &json!({"performance": 95, "accessibility": 97, "best_practices": 95, "seo": 96}),
            &json!({"critical": 0, "serious": 0, "moderate": 2}),
            &json!({"has_home": true, "has_cta": true, "has_contact_or_lead": true}),
            &thresholds(),
        );
        assert_eq!(summary["passed"], json!(true));
        assert!(summary["failed_reasons"].as_array().unwrap().is_empty());
    }

    #[test]
    fn each_gate_reports_its_failure() {
        let summary = aggregate_reports(
            &json!({"performance": 70, "accessibility": 97, "best_practices": 95, "seo": 96}),
            &json!({"critical": 1, "serious": 0}),
            &json!({"has_home": true, "has_cta": false, "has_contact_or_lead": true}),
            &thresholds(),
        );
        assert_eq!(summary["passed"], json!(false));
        let reasons: Vec<String> = summary["failed_reasons"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        assert!(reasons.iter().any(|r| r.contains("lighthouse.performance")));
        assert!(reasons.iter().any(|r| r.contains("axe.critical")));
        assert!(reasons.iter().any(|r| r.contains("has_cta")));
    }

    #[test]
    fn hash_is_stable_across_threshold_key_order() {
        let a = json!({"axe": {"critical_max": 0}, "lighthouse_floor": {"seo": 90.0}});
        let b = json!({"lighthouse_floor": {"seo": 90.0}, "axe": {"critical_max": 0}});
        assert_eq!(
            validation_hash(Some("h"), Some("u"), &a),
            validation_hash(Some("h"), Some("u"), &b)
        );
        assert_ne!(
            validation_hash(Some("h"), Some("u"), &a),
            validation_hash(Some("h2"), Some("u"), &a)
        );
    }
}
