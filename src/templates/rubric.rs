//! Quality rubric for the blueprint critic: scoring categories (0–100) and
//! hard checks that must all hold for a pass.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Minimum category scores for a blueprint to pass.
#[must_use]
pub fn default_thresholds() -> FxHashMap<&'static str, i64> {
    FxHashMap::from_iter([
        ("conversion", 75),
        ("clarity", 75),
        ("accessibility_heuristics", 80),
        ("completeness", 80),
        ("consistency", 75),
    ])
}

/// Hard checks; all must be true for a pass.
#[must_use]
pub fn run_hard_checks(blueprint: &Value) -> FxHashMap<&'static str, bool> {
    let pages = blueprint
        .get("pages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let has_home = !pages.is_empty()
        && pages.iter().enumerate().any(|(i, p)| {
            i == 0
                || p.get("slug")
                    .and_then(Value::as_str)
                    .is_some_and(|s| s.trim().eq_ignore_ascii_case("home"))
        });

    let section_types = |p: &Value| -> Vec<String> {
        p.get("sections")
            .and_then(Value::as_array)
            .map(|sections| {
                sections
                    .iter()
                    .filter_map(|s| s.get("type").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let lead_enabled = blueprint
        .pointer("/forms/lead/enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let has_contact_or_lead = lead_enabled
        || pages
            .iter()
            .any(|p| section_types(p).iter().any(|t| t == "contact_form"));

    let has_cta = pages
        .iter()
        .any(|p| section_types(p).iter().any(|t| t == "cta_banner" || t == "hero"));

    let items = blueprint
        .pointer("/navigation/items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let has_accessible_nav_labels = items.is_empty()
        || items.iter().all(|item| {
            item.get("label")
                .or_else(|| item.get("ariaLabel"))
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty())
        });

    let mobile_first = blueprint
        .pointer("/constraints/mobile_first")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    FxHashMap::from_iter([
        ("has_home", has_home),
        ("has_contact_or_lead", has_contact_or_lead),
        ("has_cta", has_cta),
        ("has_accessible_nav_labels", has_accessible_nav_labels),
        ("mobile_first", mobile_first),
    ])
}

/// Local heuristic scoring (no model): start every category at 50 and add
/// points for each hard check and structural nicety that holds.
#[must_use]
pub fn local_heuristic_scores(blueprint: &Value) -> FxHashMap<&'static str, i64> {
    let mut scores = FxHashMap::from_iter([
        ("conversion", 50i64),
        ("clarity", 50),
        ("accessibility_heuristics", 50),
        ("completeness", 50),
        ("consistency", 50),
    ]);
    let hard = run_hard_checks(blueprint);
    let mut add = |key: &'static str, delta: i64| {
        let entry = scores.entry(key).or_insert(50);
        *entry = (*entry + delta).min(100);
    };
    if hard.get("has_home").copied().unwrap_or(false) {
        add("completeness", 15);
    }
    if hard.get("has_contact_or_lead").copied().unwrap_or(false) {
        add("conversion", 20);
    }
    if hard.get("has_cta").copied().unwrap_or(false) {
        add("conversion", 15);
    }
    if hard.get("has_accessible_nav_labels").copied().unwrap_or(false) {
        add("accessibility_heuristics", 25);
    }
    if hard.get("mobile_first").copied().unwrap_or(false) {
        add("accessibility_heuristics", 15);
    }
    let tokens = blueprint.get("tokens");
    if tokens.and_then(|t| t.get("colors")).is_some()
        && tokens.and_then(|t| t.get("typography")).is_some()
    {
        add("consistency", 25);
    }
    if blueprint
        .get("pages")
        .and_then(Value::as_array)
        .is_some_and(|p| p.len() >= 2)
    {
        add("completeness", 10);
    }
    scores
}

/// Whether a scorecard + hard-check set clears the thresholds.
#[must_use]
pub fn meets_thresholds(
    scorecard: &FxHashMap<String, i64>,
    hard_checks: &FxHashMap<String, bool>,
) -> bool {
    for (key, min) in default_thresholds() {
        if scorecard.get(key).copied().unwrap_or(0) < min {
            return false;
        }
    }
    hard_checks.values().all(|&ok| ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn solid_blueprint() -> Value {
        json!({
            "tokens": {"colors": {}, "typography": {}, "spacing": {}},
            "navigation": {"style": "topbar", "items": [{"label": "Home", "href": "home"}]},
            "pages": [
                {"slug": "home", "sections": [{"type": "hero"}, {"type": "contact_form"}]},
                {"slug": "about", "sections": [{"type": "faq"}]},
            ],
            "forms": {"lead": {"enabled": false}},
            "constraints": {"mobile_first": true, "wcag_target": "AA"},
        })
    }

    #[test]
    fn hard_checks_all_pass_for_solid_blueprint() {
        let checks = run_hard_checks(&solid_blueprint());
        assert!(checks.values().all(|&ok| ok), "checks: {checks:?}");
    }

    #[test]
    fn heuristic_scores_reward_structure() {
        let scores = local_heuristic_scores(&solid_blueprint());
        assert_eq!(scores["conversion"], 85);
        assert_eq!(scores["completeness"], 75);
        assert_eq!(scores["accessibility_heuristics"], 90);
        assert_eq!(scores["consistency"], 75);
    }

    #[test]
    fn missing_cta_fails_hard_checks() {
        let mut bp = solid_blueprint();
        bp["pages"] = json!([{"slug": "home", "sections": [{"type": "faq"}]}]);
        let checks = run_hard_checks(&bp);
        assert!(!checks["has_cta"]);
        assert!(checks["has_home"]);
    }

    #[test]
    fn thresholds_require_every_category() {
        let mut scorecard: FxHashMap<String, i64> = FxHashMap::default();
        for (k, _) in default_thresholds() {
            scorecard.insert(k.to_string(), 90);
        }
        let hard: FxHashMap<String, bool> =
            FxHashMap::from_iter([("has_home".to_string(), true)]);
        assert!(meets_thresholds(&scorecard, &hard));
        scorecard.insert("clarity".to_string(), 60);
        assert!(!meets_thresholds(&scorecard, &hard));
    }
}
