use serde_json::Value;

/// Ordered (dotted path, rendered scalar) pairs for one record.
pub type FlatRecord = Vec<(String, String)>;

/// Flattens one nested record into dotted-path columns.
///
/// Mappings recurse with `.`-joined path segments. A sequence whose elements
/// are all mappings recurses with the element index as a segment; any other
/// sequence is kept as a single column holding its compact JSON text, so a
/// value that cannot be flattened structurally still gets a stable path and
/// a deterministic string form. Pair order follows the sorted key order of
/// the underlying maps, so the same record always flattens identically.
pub fn flatten(record: &Value) -> FlatRecord {
    let mut pairs = Vec::new();
    match record {
        Value::Object(map) => {
            for (key, value) in map {
                walk(key.clone(), value, &mut pairs);
            }
        }
        other => pairs.push(("value".to_string(), scalar_repr(other))),
    }
    pairs
}

fn walk(path: String, value: &Value, pairs: &mut FlatRecord) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                walk(format!("{path}.{key}"), nested, pairs);
            }
        }
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            for (index, item) in items.iter().enumerate() {
                walk(format!("{path}.{index}"), item, pairs);
            }
        }
        Value::Array(_) => pairs.push((path, value.to_string())),
        scalar => pairs.push((path, scalar_repr(scalar))),
    }
}

fn scalar_repr(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
