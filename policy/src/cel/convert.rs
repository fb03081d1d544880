//! Conversion between JSON documents and CEL values.

use std::collections::HashMap;
use std::sync::Arc;

use cel_interpreter::objects::{Key, Map};
use cel_interpreter::Value;
use serde_json::Number;

/// Convert a JSON value into a CEL value.
///
/// Integers become `int` when they fit, then `uint`, otherwise `double`.
pub fn to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => number_to_cel(n),
        serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            Value::List(Arc::new(items.iter().map(to_cel).collect()))
        }
        serde_json::Value::Object(fields) => {
            let map: HashMap<Key, Value> = fields
                .iter()
                .map(|(k, v)| (Key::String(Arc::new(k.clone())), to_cel(v)))
                .collect();
            Value::Map(Map { map: Arc::new(map) })
        }
    }
}

fn number_to_cel(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else if let Some(u) = n.as_u64() {
        Value::UInt(u)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Convert a CEL result back into JSON.
pub fn to_json(value: &Value) -> Result<serde_json::Value, String> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| format!("cannot represent {} as JSON", f))?,
        Value::String(s) => serde_json::Value::String(s.as_str().to_string()),
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(to_json).collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Map(map) => {
            let mut fields = serde_json::Map::with_capacity(map.map.len());
            for (key, v) in map.map.iter() {
                fields.insert(key_to_string(key), to_json(v)?);
            }
            serde_json::Value::Object(fields)
        }
        other => return Err(format!("unsupported value {:?}", other)),
    })
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.as_str().to_string(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}

/// Build a CEL map from string keys.
pub fn string_map<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    let map: HashMap<Key, Value> = entries
        .into_iter()
        .map(|(k, v)| (Key::String(Arc::new(k)), v))
        .collect();
    Value::Map(Map { map: Arc::new(map) })
}

/// Short type name used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::UInt(_) => "uint",
        Value::Float(_) => "double",
        Value::String(_) => "string",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Bytes(_) => "bytes",
        _ => "value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_prefer_int() {
        assert_eq!(to_cel(&json!(3)), Value::Int(3));
        assert_eq!(to_cel(&json!(u64::MAX)), Value::UInt(u64::MAX));
        assert_eq!(to_cel(&json!(1.5)), Value::Float(1.5));
    }

    #[test]
    fn test_nested_document() {
        let doc = json!({
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "spec": {"replicas": 2, "paused": false, "containers": [{"name": "c"}]}
        });
        assert_eq!(to_json(&to_cel(&doc)).unwrap(), doc);
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(to_json(&Value::Float(f64::INFINITY)).is_err());
    }
}
