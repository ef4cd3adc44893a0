//! Totality property for the condition evaluator: any tree shape against
//! any context returns a verdict and a reason list, never a panic.

use proptest::prelude::*;
use serde_json::{Value, json};
use siteline::conditions::{evaluate_condition, evaluate_conditions};

fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9_.]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(depth, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z_]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_op() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("exists".to_string()),
        Just("==".to_string()),
        Just("!=".to_string()),
        Just(">=".to_string()),
        Just("<=".to_string()),
        Just(">".to_string()),
        Just("<".to_string()),
        Just("contains".to_string()),
        Just("in".to_string()),
        "[a-z_]{1,10}",
    ]
}

proptest! {
    #[test]
    fn evaluate_is_total_for_arbitrary_trees(tree in arb_json(4), ctx in arb_json(4)) {
        // A verdict and a (possibly empty) reason list, never a panic.
        let (passed, reasons) = evaluate_conditions(Some(&tree), &ctx);
        if passed {
            prop_assert!(reasons.is_empty(), "passing trees report no failures");
        }
    }

    #[test]
    fn single_conditions_never_panic(
        path in "[a-z_.]{0,16}",
        op in arb_op(),
        value in arb_json(2),
        ctx in arb_json(4),
    ) {
        let condition = json!({"path": path, "op": op, "value": value});
        let _ = evaluate_condition(&condition, &ctx);
    }

    #[test]
    fn nested_all_any_never_panics(children in prop::collection::vec(arb_json(3), 0..5), ctx in arb_json(3)) {
        let all = json!({"all": children.clone()});
        let any = json!({"any": children});
        let _ = evaluate_conditions(Some(&all), &ctx);
        let _ = evaluate_conditions(Some(&any), &ctx);
    }
}
