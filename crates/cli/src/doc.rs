//! Documents on the command line: JSON or YAML, with a marker string standing
//! in for values not known until apply.

use anyhow::{Context, Result};
use cachet_core::Value;
use serde_json::Value as Json;

/// Rendering of a "not yet known" value.
pub const UNKNOWN_MARKER: &str = "(known after apply)";

pub fn parse_document(text: &str) -> Result<Json> {
    match serde_json::from_str::<Json>(text) {
        Ok(j) => Ok(j),
        Err(_) => serde_yaml::from_str::<Json>(text).context("document is neither valid JSON nor YAML"),
    }
}

pub fn to_value(j: Json) -> Value {
    match j {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => Value::Number(n),
        Json::String(s) if s == UNKNOWN_MARKER => Value::Unknown,
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::List(items.into_iter().map(to_value).collect()),
        Json::Object(entries) => Value::Map(entries.into_iter().map(|(k, v)| (k, to_value(v))).collect()),
    }
}

pub fn to_document(v: &Value) -> Json {
    match v {
        Value::Unknown => Json::String(UNKNOWN_MARKER.to_string()),
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => Json::Number(n.clone()),
        Value::String(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(to_document).collect()),
        Value::Map(entries) => Json::Object(entries.iter().map(|(k, v)| (k.clone(), to_document(v))).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn yaml_and_json_agree() {
        let y = parse_document("value: abc\nkeepers:\n  rev: 2\ntimestamp: null\n").unwrap();
        let j = parse_document(r#"{"value":"abc","keepers":{"rev":2},"timestamp":null}"#).unwrap();
        assert_eq!(y, j);
        assert!(parse_document("{ value: [").is_err());
    }

    #[test]
    fn unknown_marker_maps_both_ways() {
        let v = to_value(json!({"timestamp": UNKNOWN_MARKER, "value": ["a", 1, null]}));
        assert_eq!(v.get("timestamp"), Some(&Value::Unknown));
        assert_eq!(to_document(&v), json!({"timestamp": "(known after apply)", "value": ["a", 1, null]}));
    }
}
