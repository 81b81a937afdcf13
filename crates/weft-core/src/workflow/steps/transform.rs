//! Transform steps: a pure, ordered pipeline over a resolved value.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::error::WeftError;
use crate::workflow::resolver::{value_to_string, VariableStore};
use crate::workflow::schema::{TransformOp, TransformSpec};

pub(crate) fn run_transform(
    spec: &TransformSpec,
    store: &VariableStore,
) -> Result<String, WeftError> {
    let mut value = resolve_input(store, &spec.input)?;

    for op in &spec.operations {
        value = apply(op, value, store)?;
    }

    serde_json::to_string(&value).map_err(|e| WeftError::ExpressionMalformed {
        expr: spec.input.clone(),
        reason: format!("transform result not serializable: {}", e),
    })
}

fn resolve_input(store: &VariableStore, input: &str) -> Result<Value, WeftError> {
    let inner = input
        .trim()
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(input)
        .trim();
    let value = store.evaluate_expr(inner)?;
    Ok(match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    })
}

fn apply(op: &TransformOp, value: Value, store: &VariableStore) -> Result<Value, WeftError> {
    match op {
        TransformOp::Filter { condition } => {
            let items = expect_sequence(value, "filter")?;
            let mut kept = Vec::new();
            for item in items {
                if store.element_matches(&item, condition)? {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        TransformOp::Map { fields } => {
            let items = expect_sequence(value, "map")?;
            let projected = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(obj) => {
                        let mut out = Map::new();
                        for field in fields {
                            if let Some(v) = obj.get(field) {
                                out.insert(field.clone(), v.clone());
                            }
                        }
                        Value::Object(out)
                    }
                    other => other,
                })
                .collect();
            Ok(Value::Array(projected))
        }
        TransformOp::Sort { key, desc } => {
            let mut items = expect_sequence(value, "sort")?;
            // stable; null keys sort last in either direction
            items.sort_by(|a, b| {
                let ka = sort_key(a, key);
                let kb = sort_key(b, key);
                match (ka.is_null(), kb.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) => {
                        let ord = compare_values(ka, kb);
                        if *desc {
                            ord.reverse()
                        } else {
                            ord
                        }
                    }
                }
            });
            Ok(Value::Array(items))
        }
        TransformOp::Limit { count } => {
            let mut items = expect_sequence(value, "limit")?;
            items.truncate(*count);
            Ok(Value::Array(items))
        }
        TransformOp::Pluck { key } => {
            let items = expect_sequence(value, "pluck")?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .map(|item| item.get(key).cloned().unwrap_or(Value::Null))
                    .collect(),
            ))
        }
        TransformOp::Group { key } => {
            let items = expect_sequence(value, "group")?;
            let mut grouped: Map<String, Value> = Map::new();
            for item in items {
                let group_key = item
                    .get(key)
                    .map(value_to_string)
                    .unwrap_or_default();
                grouped
                    .entry(group_key)
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .map(|arr| arr.push(item));
            }
            Ok(Value::Object(grouped))
        }
    }
}

fn expect_sequence(value: Value, op: &str) -> Result<Vec<Value>, WeftError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(WeftError::ExpressionMalformed {
            expr: op.to_string(),
            reason: format!(
                "{} expects a sequence, found {}",
                op,
                match other {
                    Value::Null => "null",
                    Value::Bool(_) => "boolean",
                    Value::Number(_) => "number",
                    Value::String(_) => "string",
                    Value::Object(_) => "mapping",
                    Value::Array(_) => unreachable!(),
                }
            ),
        }),
    }
}

fn sort_key<'v>(item: &'v Value, key: &str) -> &'v Value {
    item.get(key).unwrap_or(&Value::Null)
}

/// Mixed-type ordering: bool < number < string < array < object.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| value_to_string(a).cmp(&value_to_string(b))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::TransformSpec;
    use serde_json::json;

    fn store_with(input: Value) -> VariableStore {
        let mut store = VariableStore::new();
        store.set("data", input);
        store
    }

    fn run(ops_yaml: &str, input: Value) -> String {
        let spec: TransformSpec = serde_yaml::from_str(&format!(
            "input: \"{{{{data}}}}\"\noperations:\n{}",
            ops_yaml
        ))
        .unwrap();
        run_transform(&spec, &store_with(input)).unwrap()
    }

    fn tickets() -> Value {
        json!([
            {"id": 3, "status": "open", "severity": "low"},
            {"id": 1, "status": "closed", "severity": "high"},
            {"id": 2, "status": "open", "severity": "high"}
        ])
    }

    #[test]
    fn test_filter() {
        let out = run("  - type: filter\n    condition: \"status == 'open'\"\n", tickets());
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_map_projection() {
        let out = run("  - type: map\n    fields: [id]\n", tickets());
        assert_eq!(out, "[{\"id\":3},{\"id\":1},{\"id\":2}]");
    }

    #[test]
    fn test_sort_and_limit() {
        let out = run(
            "  - type: sort\n    key: id\n  - type: limit\n    count: 2\n",
            tickets(),
        );
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let ids: Vec<i64> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_sort_desc_and_null_last() {
        let input = json!([{"n": 1}, {"m": 9}, {"n": 5}]);
        let out = run("  - type: sort\n    key: n\n    desc: true\n", input);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let arr = parsed.as_array().unwrap();
        assert_eq!(arr[0]["n"], 5);
        assert_eq!(arr[1]["n"], 1);
        // the element without the key sorts last even when descending
        assert!(arr[2].get("m").is_some());
    }

    #[test]
    fn test_sort_is_stable() {
        let input = json!([
            {"k": 1, "tag": "a"},
            {"k": 1, "tag": "b"},
            {"k": 0, "tag": "c"}
        ]);
        let out = run("  - type: sort\n    key: k\n", input);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        let tags: Vec<&str> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_pluck() {
        let out = run("  - type: pluck\n    key: severity\n", tickets());
        assert_eq!(out, "[\"low\",\"high\",\"high\"]");
    }

    #[test]
    fn test_group() {
        let out = run("  - type: group\n    key: status\n", tickets());
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["open"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["closed"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_pipeline_chains_operations() {
        let out = run(
            "  - type: filter\n    condition: \"severity == 'high'\"\n  - type: pluck\n    key: id\n",
            tickets(),
        );
        assert_eq!(out, "[1,2]");
    }

    #[test]
    fn test_json_string_input_parses() {
        let mut store = VariableStore::new();
        store.set("data", json!("[{\"id\": 1}]"));
        let spec: TransformSpec = serde_yaml::from_str(
            "input: \"{{data}}\"\noperations:\n  - type: pluck\n    key: id\n",
        )
        .unwrap();
        assert_eq!(run_transform(&spec, &store).unwrap(), "[1]");
    }

    #[test]
    fn test_non_sequence_rejected() {
        let mut store = VariableStore::new();
        store.set("data", json!(42));
        let spec: TransformSpec = serde_yaml::from_str(
            "input: \"{{data}}\"\noperations:\n  - type: limit\n    count: 1\n",
        )
        .unwrap();
        assert!(matches!(
            run_transform(&spec, &store),
            Err(WeftError::ExpressionMalformed { .. })
        ));
    }
}
