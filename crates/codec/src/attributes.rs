use std::collections::BTreeMap;

use cachet_core::{AttributePath, Value};

use crate::DecodeError;

/// Three-way view of a string attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringAttr<'a> {
    Null,
    Unknown,
    Known(&'a str),
}

/// Typed accessor over a decoded object value.
///
/// Engines read and write attributes by name through this instead of
/// poking into raw maps. An absent attribute reads the same as an explicit null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: BTreeMap<String, Value>,
}

impl Attributes {
    pub fn from_value(v: Value) -> Result<Self, DecodeError> {
        match v {
            Value::Map(entries) => Ok(Self { entries }),
            other => Err(DecodeError::TypeMismatch {
                path: AttributePath::new(),
                expected: "object".to_string(),
                found: other.kind(),
            }),
        }
    }

    /// Value of `name`; fails when the attribute is not present at all.
    pub fn get(&self, name: &str) -> Result<&Value, DecodeError> {
        self.entries.get(name).ok_or_else(|| DecodeError::MissingAttribute { path: AttributePath::root(name) })
    }

    pub fn string_attr(&self, name: &str) -> Result<StringAttr<'_>, DecodeError> {
        match self.entries.get(name) {
            None | Some(Value::Null) => Ok(StringAttr::Null),
            Some(Value::Unknown) => Ok(StringAttr::Unknown),
            Some(Value::String(s)) => Ok(StringAttr::Known(s)),
            Some(other) => Err(DecodeError::TypeMismatch {
                path: AttributePath::root(name),
                expected: "string".to_string(),
                found: other.kind(),
            }),
        }
    }

    /// Replace `name`, returning the previous value.
    pub fn set(&mut self, name: &str, v: Value) -> Option<Value> {
        self.entries.insert(name.to_string(), v)
    }

    pub fn into_value(self) -> Value { Value::Map(self.entries) }
}
