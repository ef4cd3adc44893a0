//! Template performance aggregation.
//!
//! Folds client sentiments and delivery outcomes into each active template's
//! `performance_metrics_json` with a weighted score: sentiment 0.4, low
//! defects 0.35, low cycle time 0.25 (defects and cycle time inverted over
//! their caps). Templates with no data score a neutral 0.5.

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use crate::store::{PipelineStore, StoreError};

pub const WEIGHT_SENTIMENT: f64 = 0.4;
pub const WEIGHT_DEFECTS: f64 = 0.35;
pub const WEIGHT_CYCLE: f64 = 0.25;
pub const MAX_CYCLE_DAYS: f64 = 30.0;
pub const MAX_DEFECTS: f64 = 20.0;

const LAST_RUN_KEY: &str = "last_template_metrics_updated_at";

/// Normalize a sentiment to the 0–5 scale: overall score wins, a 0–100
/// rating is scaled down, missing data is neutral 3.0.
#[must_use]
pub fn sentiment_value(rating: Option<f64>, overall_score: Option<f64>) -> f64 {
    if let Some(overall) = overall_score {
        return overall;
    }
    match rating {
        Some(r) if r <= 5.0 => r,
        Some(r) => r / 20.0,
        None => 3.0,
    }
}

/// Weighted 0–1 score over the aggregates. `None` inputs contribute nothing;
/// an entirely empty template scores 0.5.
#[must_use]
pub fn weighted_score(
    avg_sentiment: Option<f64>,
    avg_defects: Option<f64>,
    avg_cycle_days: Option<f64>,
) -> f64 {
    if avg_sentiment.is_none() && avg_defects.is_none() && avg_cycle_days.is_none() {
        return 0.5;
    }
    let mut score = 0.0;
    if let Some(sentiment) = avg_sentiment {
        score += WEIGHT_SENTIMENT * (sentiment / 5.0);
    }
    if let Some(defects) = avg_defects {
        score += WEIGHT_DEFECTS * (1.0 - (defects / MAX_DEFECTS).min(1.0));
    }
    if let Some(cycle) = avg_cycle_days {
        score += WEIGHT_CYCLE * (1.0 - (cycle / MAX_CYCLE_DAYS).min(1.0));
    }
    (score * 1000.0).round() / 1000.0
}

/// Aggregate performance for every active template.
#[instrument(skip(store), err)]
pub async fn aggregate_template_performance(store: &PipelineStore) -> Result<Value, StoreError> {
    let templates = store.list_active_templates().await?;
    let now_iso = Utc::now().to_rfc3339();
    let mut updated = 0usize;

    for template in templates {
        let sentiments = store.list_template_sentiments(template.id).await?;
        let outcomes = store.list_template_outcomes(template.id).await?;

        let mut usage_projects: Vec<uuid::Uuid> = sentiments
            .iter()
            .map(|(p, ..)| *p)
            .chain(outcomes.iter().map(|(p, ..)| *p))
            .collect();
        usage_projects.sort();
        usage_projects.dedup();
        let usage_count = if usage_projects.is_empty() {
            sentiments.len() + outcomes.len()
        } else {
            usage_projects.len()
        };

        let avg_sentiment = if sentiments.is_empty() {
            None
        } else {
            let sum: f64 = sentiments
                .iter()
                .map(|(_, rating, overall, _)| sentiment_value(*rating, *overall))
                .sum();
            Some(((sum / sentiments.len() as f64) * 100.0).round() / 100.0)
        };
        let cycles: Vec<f64> = outcomes.iter().filter_map(|(_, c, _, _)| *c).collect();
        let avg_cycle_time_days = if cycles.is_empty() {
            None
        } else {
            Some(((cycles.iter().sum::<f64>() / cycles.len() as f64) * 10.0).round() / 10.0)
        };
        let avg_defects = if outcomes.is_empty() {
            None
        } else {
            let sum: i64 = outcomes.iter().map(|(_, _, d, _)| *d).sum();
            Some(((sum as f64 / outcomes.len() as f64) * 10.0).round() / 10.0)
        };
        let on_time = outcomes
            .iter()
            .filter(|(_, _, _, on_time)| *on_time == Some(true))
            .count();
        let conversion_proxy = if outcomes.is_empty() {
            None
        } else {
            Some(((on_time as f64 / outcomes.len() as f64) * 100.0).round() / 100.0)
        };

        let metrics = json!({
            "usage_count": usage_count,
            "avg_sentiment": avg_sentiment,
            "avg_cycle_time_days": avg_cycle_time_days,
            "avg_defects": avg_defects,
            "conversion_proxy": conversion_proxy,
            "weighted_score": weighted_score(avg_sentiment, avg_defects, avg_cycle_time_days),
            "last_updated_at": now_iso,
        });
        store.save_template_metrics(template.id, &metrics).await?;
        updated += 1;
    }

    if let Err(err) = store
        .update_config(LAST_RUN_KEY, &json!({"updated_at": now_iso}), None, None)
        .await
    {
        warn!(%err, "could not stamp metrics run time");
    }
    Ok(json!({"status": "ok", "templates_updated": updated}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentiment_normalization() {
        assert!((sentiment_value(None, Some(4.2)) - 4.2).abs() < 1e-9);
        assert!((sentiment_value(Some(4.0), None) - 4.0).abs() < 1e-9);
        assert!((sentiment_value(Some(80.0), None) - 4.0).abs() < 1e-9);
        assert!((sentiment_value(None, None) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_score_components() {
        // Perfect marks: 0.4 + 0.35 + 0.25 = 1.0.
        assert!((weighted_score(Some(5.0), Some(0.0), Some(0.0)) - 1.0).abs() < 1e-9);
        // No data at all is neutral.
        assert!((weighted_score(None, None, None) - 0.5).abs() < 1e-9);
        // Defects at the cap contribute nothing.
        assert!((weighted_score(None, Some(20.0), None) - 0.0).abs() < 1e-9);
        // Sentiment-only template.
        assert!((weighted_score(Some(4.0), None, None) - 0.32).abs() < 1e-9);
    }
}
