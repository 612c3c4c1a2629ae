//! JSON <-> script value conversion

use rhai::{Array, Dynamic, ImmutableString, Map, FLOAT, INT};
use serde_json::Value;

pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(v) => (*v).into(),
        Value::Number(v) => {
            if let Some(i) = v.as_i64() {
                (i as INT).into()
            } else if let Some(f) = v.as_f64() {
                (f as FLOAT).into()
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(v) => v.as_str().into(),
        Value::Array(items) => items.iter().map(json_to_dynamic).collect::<Array>().into(),
        Value::Object(object) => {
            let mut out = Map::new();
            for (k, v) in object {
                out.insert(k.as_str().into(), json_to_dynamic(v));
            }
            out.into()
        }
    }
}

pub fn json_map_to_dynamic(object: &serde_json::Map<String, Value>) -> Map {
    object
        .iter()
        .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
        .collect()
}

/// Convert a script value to JSON. Values with no JSON form (function
/// pointers, custom types) become `null`.
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(v) = value.as_bool() {
        return Value::Bool(v);
    }
    if let Ok(v) = value.as_int() {
        return Value::from(v);
    }
    if let Ok(v) = value.as_float() {
        return Value::from(v);
    }
    if let Some(v) = value.clone().try_cast::<ImmutableString>() {
        return Value::String(v.to_string());
    }
    if let Some(v) = value.clone().try_cast::<char>() {
        return Value::String(v.to_string());
    }
    if let Some(items) = value.clone().try_cast::<Array>() {
        return Value::Array(items.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        return Value::Object(dynamic_map_to_json(&map));
    }
    Value::Null
}

pub fn dynamic_map_to_json(map: &Map) -> serde_json::Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
        .collect()
}

/// Numeric argument that may arrive as an integer or a float
pub fn number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|i| i as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_values_survive_the_trip() {
        let value = json!({"hp": 3, "speed": 1.5, "tags": ["a", true, null], "inner": {"k": "v"}});
        assert_eq!(dynamic_to_json(&json_to_dynamic(&value)), value);
    }

    #[test]
    fn integers_and_floats_are_both_numbers() {
        assert_eq!(number(&Dynamic::from(3 as INT)), Some(3.0));
        assert_eq!(number(&Dynamic::from(2.5 as FLOAT)), Some(2.5));
        assert_eq!(number(&Dynamic::from("x")), None);
    }
}
