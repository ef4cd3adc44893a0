//! Template evolution proposals from metrics and recent feedback.
//!
//! Proposals are never auto-applied: they are stored for human review as
//! suggested blueprint deltas `{path, from, to, reason}`.

use serde_json::{Value, json};
use tracing::instrument;
use uuid::Uuid;

use crate::store::{PipelineStore, StoreError};

pub const SENTIMENT_THRESHOLD: f64 = 3.5;
pub const DEFECT_RATE_HIGH: f64 = 3.0;

/// Feedback tag → suggested blueprint change.
const TAG_SUGGESTIONS: [(&str, &str, &str, &str); 5] = [
    (
        "navigation_confusion",
        "pages.home.sections.navigation.variant",
        "simplified",
        "Users found navigation confusing",
    ),
    (
        "design_clarity",
        "pages.home.sections.hero.variant",
        "centered",
        "Improve design clarity with centered hero",
    ),
    (
        "mobile_issues",
        "pages.home.sections",
        "reduce_count",
        "High mobile issues: fewer sections on home",
    ),
    (
        "accessibility",
        "tokens.a11y",
        "enhance",
        "Repeated accessibility feedback",
    ),
    (
        "load_time",
        "pages.home.sections.gallery_grid",
        "lazy",
        "Improve load time with lazy images",
    ),
];

/// Build a proposal from aggregated metrics and recent feedback tags.
#[must_use]
pub fn propose_template_improvements(
    version: i64,
    metrics: &Value,
    recent_feedback: &[Value],
) -> Value {
    let mut change_summary: Vec<String> = Vec::new();
    let mut changes: Vec<Value> = Vec::new();
    let mut rationale: Vec<String> = Vec::new();

    let avg_sentiment = metrics.get("avg_sentiment").and_then(Value::as_f64);
    let avg_defects = metrics.get("avg_defects").and_then(Value::as_f64);

    let mut tag_counts: Vec<(String, usize)> = Vec::new();
    for feedback in recent_feedback {
        let tags = feedback
            .get("tags")
            .or_else(|| feedback.get("tags_json"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for tag in tags.iter().filter_map(Value::as_str) {
            match tag_counts.iter_mut().find(|(t, _)| t == tag) {
                Some((_, count)) => *count += 1,
                None => tag_counts.push((tag.to_string(), 1)),
            }
        }
    }

    if let Some(sentiment) = avg_sentiment {
        if sentiment < SENTIMENT_THRESHOLD {
            rationale.push(format!(
                "Average sentiment ({sentiment}) below threshold ({SENTIMENT_THRESHOLD})."
            ));
            change_summary.push("Improve overall layout and clarity".to_string());
        }
    }
    if let Some(defects) = avg_defects {
        if defects >= DEFECT_RATE_HIGH {
            rationale.push(format!("Defect rate ({defects}) is high; suggest simpler layouts."));
            changes.push(json!({
                "path": "pages.0.sections",
                "from": "current",
                "to": "reduce_sections",
                "reason": "High defect rate: reduce section count on home for maintainability",
            }));
        }
    }
    for (tag, count) in &tag_counts {
        if *count < 2 {
            continue;
        }
        if let Some((_, path, to, reason)) =
            TAG_SUGGESTIONS.iter().find(|(t, ..)| *t == tag.as_str())
        {
            changes.push(json!({
                "path": path,
                "from": "current",
                "to": to,
                "reason": reason,
            }));
            change_summary.push((*reason).to_string());
            rationale.push(format!("Repeated feedback tag '{tag}' ({count} times)."));
        }
    }

    if change_summary.is_empty() && changes.is_empty() {
        return json!({
            "new_version": version + 1,
            "change_summary": "No changes suggested; metrics within acceptable range.",
            "rationale": "No actionable feedback or thresholds not met.",
            "suggested_blueprint_changes": [],
            "expected_impact": {},
        });
    }

    let mut expected_impact = serde_json::Map::new();
    if avg_sentiment.is_some_and(|s| s < SENTIMENT_THRESHOLD) {
        expected_impact.insert("sentiment".to_string(), json!("+0.3"));
    }
    if tag_counts.iter().any(|(t, c)| t == "accessibility" && *c >= 2) {
        expected_impact.insert("a11y".to_string(), json!("+5"));
    }
    if avg_defects.is_some_and(|d| d >= DEFECT_RATE_HIGH) {
        expected_impact.insert("defects".to_string(), json!("-20%"));
    }
    if !expected_impact.contains_key("conversion")
        && metrics.get("conversion_proxy").is_some_and(|v| !v.is_null())
    {
        expected_impact.insert("conversion".to_string(), json!("+8%"));
    }

    json!({
        "new_version": version + 1,
        "change_summary": change_summary.join("; "),
        "rationale": rationale.join(" "),
        "suggested_blueprint_changes": changes,
        "expected_impact": expected_impact,
    })
}

/// Build and persist a proposal for a template from its stored metrics and
/// sentiment tags.
#[instrument(skip(store), err)]
pub async fn run_evolution_proposal(
    store: &PipelineStore,
    template_id: Uuid,
) -> Result<Value, StoreError> {
    let Some(template) = store.get_template(template_id).await? else {
        return Ok(json!({"status": "failed", "error": "Template not found"}));
    };
    let metrics = template.performance_metrics.unwrap_or(json!({}));
    let feedback: Vec<Value> = store
        .list_template_sentiments(template_id)
        .await?
        .into_iter()
        .map(|(_, rating, overall, tags)| {
            json!({"rating": rating, "overall_score": overall, "tags": tags})
        })
        .collect();
    let proposal = propose_template_improvements(template.version, &metrics, &feedback);
    let proposal_id = store.add_evolution_proposal(template_id, &proposal).await?;
    Ok(json!({"status": "ok", "proposal_id": proposal_id.to_string(), "proposal": proposal}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_metrics_propose_nothing() {
        let proposal = propose_template_improvements(
            2,
            &json!({"avg_sentiment": 4.5, "avg_defects": 0.5}),
            &[],
        );
        assert_eq!(proposal["new_version"], json!(3));
        assert!(proposal["suggested_blueprint_changes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn low_sentiment_and_defects_drive_changes() {
        let proposal = propose_template_improvements(
            1,
            &json!({"avg_sentiment": 2.8, "avg_defects": 4.0}),
            &[],
        );
        let changes = proposal["suggested_blueprint_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["to"], json!("reduce_sections"));
        assert_eq!(proposal["expected_impact"]["sentiment"], json!("+0.3"));
        assert_eq!(proposal["expected_impact"]["defects"], json!("-20%"));
    }

    #[test]
    fn repeated_tags_trigger_suggestions_once() {
        let feedback = vec![
            json!({"tags": ["accessibility", "load_time"]}),
            json!({"tags": ["accessibility"]}),
        ];
        let proposal =
            propose_template_improvements(1, &json!({"avg_sentiment": 4.8}), &feedback);
        let changes = proposal["suggested_blueprint_changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1, "load_time seen once should not fire: {changes:?}");
        assert_eq!(changes[0]["path"], json!("tokens.a11y"));
        assert_eq!(proposal["expected_impact"]["a11y"], json!("+5"));
    }
}
