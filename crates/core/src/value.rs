//! Structured values and their structural type descriptors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::{AttributePath, PathStep};

/// Structural type of a value.
///
/// Serialized in the runtime's JSON type shape: `"string"`, `"number"`,
/// `"bool"`, `"dynamic"`, `["list", T]`, `["map", T]`, `["object", {..}]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "serde_json::Value", try_from = "serde_json::Value")]
pub enum Type {
    Bool,
    Number,
    String,
    /// Any value; the concrete shape is carried by the value itself.
    Dynamic,
    List(Box<Type>),
    Map(Box<Type>),
    Object(BTreeMap<String, Type>),
}

impl Type {
    pub fn list(elem: Type) -> Self { Type::List(Box::new(elem)) }
    pub fn map(elem: Type) -> Self { Type::Map(Box::new(elem)) }

    pub fn object<'a>(attrs: impl IntoIterator<Item = (&'a str, Type)>) -> Self {
        Type::Object(attrs.into_iter().map(|(k, t)| (k.to_string(), t)).collect())
    }

    /// Attribute types when this is an object type.
    pub fn attribute_types(&self) -> Option<&BTreeMap<String, Type>> {
        match self {
            Type::Object(attrs) => Some(attrs),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("bool"),
            Type::Number => f.write_str("number"),
            Type::String => f.write_str("string"),
            Type::Dynamic => f.write_str("dynamic"),
            Type::List(t) => write!(f, "list({})", t),
            Type::Map(t) => write!(f, "map({})", t),
            Type::Object(attrs) => {
                f.write_str("object({")?;
                for (i, (k, t)) in attrs.iter().enumerate() {
                    if i > 0 { f.write_str(", ")?; }
                    write!(f, "{}: {}", k, t)?;
                }
                f.write_str("})")
            }
        }
    }
}

impl From<Type> for serde_json::Value {
    fn from(ty: Type) -> Self {
        use serde_json::json;
        match ty {
            Type::Bool => json!("bool"),
            Type::Number => json!("number"),
            Type::String => json!("string"),
            Type::Dynamic => json!("dynamic"),
            Type::List(t) => json!(["list", serde_json::Value::from(*t)]),
            Type::Map(t) => json!(["map", serde_json::Value::from(*t)]),
            Type::Object(attrs) => {
                let obj: serde_json::Map<String, serde_json::Value> =
                    attrs.into_iter().map(|(k, t)| (k, serde_json::Value::from(t))).collect();
                json!(["object", obj])
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid type descriptor: {0}")]
pub struct TypeShapeError(String);

impl TryFrom<serde_json::Value> for Type {
    type Error = TypeShapeError;

    fn try_from(v: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as J;
        match v {
            J::String(s) => match s.as_str() {
                "bool" => Ok(Type::Bool),
                "number" => Ok(Type::Number),
                "string" => Ok(Type::String),
                "dynamic" => Ok(Type::Dynamic),
                other => Err(TypeShapeError(format!("unknown primitive {:?}", other))),
            },
            J::Array(mut parts) if parts.len() == 2 => {
                let inner = parts.pop().unwrap_or(J::Null);
                let kind = parts.pop().unwrap_or(J::Null);
                match (kind.as_str(), inner) {
                    (Some("list"), t) => Ok(Type::list(Type::try_from(t)?)),
                    (Some("map"), t) => Ok(Type::map(Type::try_from(t)?)),
                    (Some("object"), J::Object(attrs)) => {
                        let mut out = BTreeMap::new();
                        for (k, t) in attrs {
                            out.insert(k, Type::try_from(t)?);
                        }
                        Ok(Type::Object(out))
                    }
                    (k, _) => Err(TypeShapeError(format!("unsupported collection kind {:?}", k))),
                }
            }
            other => Err(TypeShapeError(other.to_string())),
        }
    }
}

/// Tagged value: concrete scalar, concrete collection, explicit null, or
/// "not yet known".
///
/// Objects and maps share the `Map` representation; the [`Type`] a value is
/// checked against decides which one it is. Keys are kept ordered so nothing
/// downstream depends on hash iteration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Placeholder for a value that will be determined at apply time.
    Unknown,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self { Value::String(s.into()) }

    pub fn empty_map() -> Self { Value::Map(BTreeMap::new()) }

    pub fn object<'a>(attrs: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Value::Map(attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }
    pub fn is_unknown(&self) -> bool { matches!(self, Value::Unknown) }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Attribute lookup on an object value. `None` for non-objects and absent keys.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(name))
    }

    /// Short name of the value's shape, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unknown => "unknown",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Path to the first "not yet known" marker, depth-first in key order.
    pub fn first_unknown(&self) -> Option<AttributePath> {
        fn walk(v: &Value, path: &mut AttributePath, top: bool) -> bool {
            match v {
                Value::Unknown => true,
                Value::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        path.push(PathStep::ElementIndex(i as u64));
                        if walk(item, path, false) { return true; }
                        path.pop();
                    }
                    false
                }
                Value::Map(entries) => {
                    for (k, item) in entries {
                        // top-level keys are record attributes, nested ones are map keys
                        path.push(if top { PathStep::Attribute(k.clone()) } else { PathStep::ElementKey(k.clone()) });
                        if walk(item, path, false) { return true; }
                        path.pop();
                    }
                    false
                }
                _ => false,
            }
        }
        let mut path = AttributePath::new();
        if walk(self, &mut path, true) { Some(path) } else { None }
    }

    /// True when no "not yet known" marker appears anywhere inside.
    pub fn is_wholly_known(&self) -> bool { self.first_unknown().is_none() }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self { Value::Number(Number::from(n)) }
}
