use serde_json::{Map, Value};

/// One leaf-level difference between two JSON documents.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Recursively collects leaf changes from `previous` to `current`. Object
/// keys are compared by name, arrays by index; a removed leaf is reported
/// with `new = null`.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    prefix: &str,
    changes: &mut Vec<Change>,
) {
    match (previous, current) {
        (Value::Object(prev), Value::Object(curr)) => {
            for (key, curr_val) in curr {
                let path = join(prefix, key);
                match prev.get(key) {
                    Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
                    None if curr_val.is_object() => {
                        diff_json(&Value::Object(Map::new()), curr_val, &path, changes)
                    }
                    None => changes.push(Change {
                        path,
                        old: Value::Null,
                        new: curr_val.clone(),
                    }),
                }
            }
            for (key, prev_val) in prev {
                if !curr.contains_key(key) {
                    changes.push(Change {
                        path: join(prefix, key),
                        old: prev_val.clone(),
                        new: Value::Null,
                    });
                }
            }
        }
        (Value::Array(prev), Value::Array(curr)) if prev.len() == curr.len() => {
            for (i, (p, c)) in prev.iter().zip(curr).enumerate() {
                diff_json(p, c, &format!("{prefix}[{i}]"), changes);
            }
        }
        (prev, curr) if prev != curr => changes.push(Change {
            path: prefix.to_string(),
            old: prev.clone(),
            new: curr.clone(),
        }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diff(a: &Value, b: &Value) -> Vec<Change> {
        let mut changes = Vec::new();
        diff_json(a, b, "", &mut changes);
        changes
    }

    #[test]
    fn leaf_change_has_dotted_path() {
        let changes = diff(
            &json!({"zones": {"1": {"power": "ON"}}}),
            &json!({"zones": {"1": {"power": "OFF"}}}),
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "zones.1.power");
        assert_eq!(changes[0].old, json!("ON"));
        assert_eq!(changes[0].new, json!("OFF"));
    }

    #[test]
    fn unchanged_documents_produce_nothing() {
        let v = json!({"a": 1, "b": [1, 2]});
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn added_and_removed_keys() {
        let changes = diff(&json!({"a": 1}), &json!({"b": {"c": 2}}));
        assert!(changes.contains(&Change {
            path: "b.c".into(),
            old: Value::Null,
            new: json!(2)
        }));
        assert!(changes.contains(&Change {
            path: "a".into(),
            old: json!(1),
            new: Value::Null
        }));
    }

    #[test]
    fn arrays_compare_by_index() {
        let changes = diff(&json!({"l": [1, 2]}), &json!({"l": [1, 3]}));
        assert_eq!(changes[0].path, "l[1]");

        let changes = diff(&json!({"l": [1]}), &json!({"l": [1, 2]}));
        assert_eq!(changes[0].path, "l");
    }
}
