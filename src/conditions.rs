//! Condition evaluator for HITL gates and other rule-based checks.
//!
//! Conditions are plain JSON: `{ "path": "...", "op": "...", "value": ... }`
//! with optional `{"all": [...]}` / `{"any": [...]}` nesting. Evaluation is
//! total: malformed input never errors, it simply passes or fails with a
//! human-readable reason list. Unknown operators pass so that newer policy
//! documents do not brick older deployments.

use serde_json::Value;

/// Safe navigation: value at a dot-separated `path`, `None` when any segment
/// is missing. Integer segments index into arrays; blank segments are
/// skipped.
pub fn value_at_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    if path.trim().is_empty() {
        return None;
    }
    let mut current = ctx;
    for part in path.split('.') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Evaluate a single `{path, op, value}` condition against `ctx`.
///
/// Missing/malformed conditions pass. `op` defaults to `exists`.
pub fn evaluate_condition(condition: &Value, ctx: &Value) -> bool {
    let Some(obj) = condition.as_object() else {
        return true;
    };
    let path = obj.get("path").and_then(Value::as_str).unwrap_or("");
    let op = obj
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or("exists")
        .trim()
        .to_ascii_lowercase();
    let expected = obj.get("value");
    let actual = if path.is_empty() {
        None
    } else {
        value_at_path(ctx, path)
    };

    match op.as_str() {
        "exists" => match actual {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        },
        "==" => {
            // Missing values compare as null, so `== null` matches absence.
            actual.unwrap_or(&Value::Null) == expected.unwrap_or(&Value::Null)
        }
        "!=" => actual.unwrap_or(&Value::Null) != expected.unwrap_or(&Value::Null),
        ">=" | "<=" | ">" | "<" => {
            let (Some(a), Some(b)) = (
                actual.and_then(as_number),
                expected.and_then(as_number),
            ) else {
                return false;
            };
            match op.as_str() {
                ">=" => a >= b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a < b,
            }
        }
        "contains" => {
            let Some(needle) = expected else {
                return false;
            };
            match actual {
                Some(Value::Array(items)) => items.contains(needle),
                Some(Value::String(s)) => match needle {
                    Value::String(n) => s.contains(n.as_str()),
                    other => s.contains(&other.to_string()),
                },
                _ => false,
            }
        }
        "in" => match (actual, expected) {
            (Some(a), Some(Value::Array(options))) => options.contains(a),
            _ => false,
        },
        // Unknown operators pass (forward compatibility).
        _ => true,
    }
}

fn failure_summary(condition: &Value, ctx: &Value) -> String {
    let obj = condition.as_object();
    let path = obj
        .and_then(|o| o.get("path"))
        .and_then(Value::as_str)
        .unwrap_or("?");
    let op = obj
        .and_then(|o| o.get("op"))
        .and_then(Value::as_str)
        .unwrap_or("exists")
        .trim()
        .to_ascii_lowercase();
    let expected = obj.and_then(|o| o.get("value"));
    let actual = value_at_path(ctx, path);
    let display = |v: Option<&Value>| match v {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    match op.as_str() {
        "exists" => format!("{path} missing"),
        ">=" | "<=" | ">" | "<" => format!(
            "{path} ({}) {op} {} failed",
            display(actual),
            display(expected)
        ),
        "==" => format!("{path} != {}", display(expected)),
        "!=" => format!("{path} == {}", display(expected)),
        _ => format!("Condition on {path} failed"),
    }
}

/// Evaluate a condition tree with `all`/`any` nesting.
///
/// Returns `(passed, failure_reasons)`. A missing tree passes. Never errors
/// and recursion is bounded by the tree itself (serde_json values are finite).
pub fn evaluate_conditions(tree: Option<&Value>, ctx: &Value) -> (bool, Vec<String>) {
    let Some(tree) = tree else {
        return (true, Vec::new());
    };
    if tree.is_null() {
        return (true, Vec::new());
    }
    let mut reasons = Vec::new();
    let passed = eval_node(tree, ctx, &mut reasons);
    (passed, reasons)
}

fn eval_node(node: &Value, ctx: &Value, reasons: &mut Vec<String>) -> bool {
    let Some(obj) = node.as_object() else {
        return true;
    };
    if let Some(children) = obj.get("all") {
        let Some(children) = children.as_array() else {
            return true;
        };
        for child in children {
            // A failing leaf records its own summary; nothing more to add.
            if !eval_node(child, ctx, reasons) {
                return false;
            }
        }
        return true;
    }
    if let Some(children) = obj.get("any") {
        let Some(children) = children.as_array() else {
            return true;
        };
        for child in children {
            let mut scratch = Vec::new();
            if eval_node(child, ctx, &mut scratch) {
                return true;
            }
        }
        if let Some(first) = children.first() {
            if first.get("path").is_some() {
                reasons.push(failure_summary(first, ctx));
            }
        }
        return false;
    }
    // Leaf condition.
    let passed = evaluate_condition(node, ctx);
    if !passed {
        reasons.push(failure_summary(node, ctx));
    }
    passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_tree_passes() {
        let (passed, reasons) = evaluate_conditions(None, &json!({}));
        assert!(passed);
        assert!(reasons.is_empty());
    }

    #[test]
    fn path_lookup_handles_arrays_and_missing_segments() {
        let ctx = json!({"a": {"b": [{"c": 5}]}});
        assert_eq!(value_at_path(&ctx, "a.b.0.c"), Some(&json!(5)));
        assert_eq!(value_at_path(&ctx, "a.b.1.c"), None);
        assert_eq!(value_at_path(&ctx, "a.x.c"), None);
        assert_eq!(value_at_path(&ctx, ""), None);
    }

    #[test]
    fn exists_rejects_null_and_empty_string() {
        let ctx = json!({"a": "", "b": null, "c": "x", "d": 0});
        assert!(!evaluate_condition(&json!({"path": "a", "op": "exists"}), &ctx));
        assert!(!evaluate_condition(&json!({"path": "b", "op": "exists"}), &ctx));
        assert!(evaluate_condition(&json!({"path": "c", "op": "exists"}), &ctx));
        assert!(evaluate_condition(&json!({"path": "d", "op": "exists"}), &ctx));
    }

    #[test]
    fn numeric_comparisons_coerce_strings() {
        let ctx = json!({"score": "92.5"});
        assert!(evaluate_condition(
            &json!({"path": "score", "op": ">=", "value": 90}),
            &ctx
        ));
        assert!(!evaluate_condition(
            &json!({"path": "score", "op": "<", "value": 90}),
            &ctx
        ));
        // Type mismatch -> false, never an error.
        let ctx = json!({"score": {"nested": true}});
        assert!(!evaluate_condition(
            &json!({"path": "score", "op": ">=", "value": 90}),
            &ctx
        ));
    }

    #[test]
    fn contains_and_in_membership() {
        let ctx = json!({"tags": ["seo", "cms"], "name": "northwind"});
        assert!(evaluate_condition(
            &json!({"path": "tags", "op": "contains", "value": "seo"}),
            &ctx
        ));
        assert!(evaluate_condition(
            &json!({"path": "name", "op": "contains", "value": "wind"}),
            &ctx
        ));
        assert!(evaluate_condition(
            &json!({"path": "name", "op": "in", "value": ["northwind", "acme"]}),
            &ctx
        ));
        assert!(!evaluate_condition(
            &json!({"path": "name", "op": "in", "value": "northwind"}),
            &ctx
        ));
    }

    #[test]
    fn unknown_operator_passes() {
        let ctx = json!({});
        assert!(evaluate_condition(
            &json!({"path": "anything", "op": "matches_regex", "value": ".*"}),
            &ctx
        ));
    }

    #[test]
    fn all_reports_first_failure() {
        let tree = json!({"all": [
            {"path": "a", "op": "exists"},
            {"path": "b", "op": "exists"},
        ]});
        let (passed, reasons) = evaluate_conditions(Some(&tree), &json!({"a": 1}));
        assert!(!passed);
        assert_eq!(reasons, vec!["b missing".to_string()]);
    }

    #[test]
    fn any_passes_when_one_branch_does() {
        let tree = json!({"any": [
            {"path": "a", "op": "exists"},
            {"path": "b", "op": "exists"},
        ]});
        let (passed, reasons) = evaluate_conditions(Some(&tree), &json!({"b": 1}));
        assert!(passed);
        assert!(reasons.is_empty());

        let (passed, reasons) = evaluate_conditions(Some(&tree), &json!({}));
        assert!(!passed);
        assert_eq!(reasons, vec!["a missing".to_string()]);
    }

    #[test]
    fn comparison_failure_summary_shows_actual() {
        let tree = json!({"path": "quality.a11y", "op": ">=", "value": 95});
        let (_, reasons) =
            evaluate_conditions(Some(&tree), &json!({"quality": {"a11y": 80}}));
        assert_eq!(reasons, vec!["quality.a11y (80) >= 95 failed".to_string()]);
    }

    #[test]
    fn malformed_trees_never_fail() {
        let ctx = json!({});
        for tree in [
            json!(42),
            json!("not a condition"),
            json!({"all": "not a list"}),
            json!({"any": {}}),
            json!([1, 2, 3]),
        ] {
            let (passed, _) = evaluate_conditions(Some(&tree), &ctx);
            assert!(passed, "tree should pass: {tree}");
        }
    }
}
