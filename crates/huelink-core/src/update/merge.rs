use serde_json::Value;

/// Merge `incoming` into `base`.
///
/// Where both sides hold an object at the same key the objects are merged
/// recursively; otherwise the incoming value replaces the existing one.
/// Keys present only in `base` are kept.
pub fn gentle_merge(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                let next = match old.get(key) {
                    Some(existing) => gentle_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}
