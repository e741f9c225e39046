//! ABOUTME: Control-flow helpers shared by the Executor's `for_loop` and
//! ABOUTME: `while_loop` handling: the per-iteration `loop` namespace and
//! ABOUTME: the iteration-count ceiling both loop kinds enforce.

use pipeline_core::Value;
use std::collections::BTreeMap;

/// Resolve a `for_loop`'s `over` value into the list it iterates. A
/// non-list value iterates as a single-element sequence, so `over:
/// "{{inputs.single_item}}"` resolving to a scalar still runs the body
/// once rather than erroring out.
pub fn resolve_iterable(over: &Value) -> Vec<Value> {
    match over {
        Value::List(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Build the `loop` namespace map for iteration `index` (0-based) of
/// `total`, binding the current element under both the author-chosen
/// `iterator` name and the always-present `index`/`iteration`/`total`/
/// `first`/`last` keys (§4.3/§4.10). Excluded from the outer Result Store
/// merge (Open Question decision #2): callers read it only through
/// `TemplateContext::loop_item` for the duration of that one iteration.
pub fn loop_namespace(iterator: &str, item: Value, index: usize, total: usize) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    map.insert(iterator.to_string(), item.clone());
    if iterator != "item" {
        map.insert("item".to_string(), item);
    }
    map.insert("index".to_string(), Value::Number(index as f64));
    map.insert("iteration".to_string(), Value::Number((index + 1) as f64));
    map.insert("total".to_string(), Value::Number(total as f64));
    map.insert("first".to_string(), Value::Bool(index == 0));
    map.insert(
        "last".to_string(),
        Value::Bool(total == 0 || index + 1 == total),
    );
    map
}

/// True once `iteration` has reached `max_iterations`. Non-fatal by
/// design (§4.10): both loop kinds treat hitting this ceiling as a normal
/// stopping condition — `{success: false, max_iterations_reached: true}` —
/// not an error that aborts the run.
pub fn iteration_limit_reached(iteration: usize, max_iterations: usize) -> bool {
    iteration >= max_iterations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_over_value_iterates_its_items() {
        let over = Value::list([Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(resolve_iterable(&over).len(), 2);
    }

    #[test]
    fn scalar_over_value_iterates_once() {
        let over = Value::String("solo".to_string());
        assert_eq!(resolve_iterable(&over).len(), 1);
    }

    #[test]
    fn loop_namespace_carries_custom_iterator_name_and_standard_keys() {
        let ns = loop_namespace("task", Value::String("x".to_string()), 1, 3);
        assert_eq!(ns.get("task").and_then(Value::as_str), Some("x"));
        assert_eq!(ns.get("index").and_then(Value::as_f64), Some(1.0));
        assert_eq!(ns.get("iteration").and_then(Value::as_f64), Some(2.0));
        assert_eq!(ns.get("total").and_then(Value::as_f64), Some(3.0));
        assert_eq!(ns.get("first").and_then(Value::as_bool), Some(false));
        assert_eq!(ns.get("last").and_then(Value::as_bool), Some(false));
    }

    #[test]
    fn loop_namespace_defaults_to_item_when_no_iterator_name_given() {
        let ns = loop_namespace("item", Value::Number(9.0), 2, 3);
        assert_eq!(ns.get("item").and_then(Value::as_f64), Some(9.0));
        assert_eq!(ns.get("last").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn iteration_limit_reached_at_the_ceiling() {
        assert!(iteration_limit_reached(5, 5));
        assert!(!iteration_limit_reached(4, 5));
    }
}
