//! Cachet state codec: converts the opaque [`DynamicValue`] exchanged at the
//! boundary into structured [`Value`]s checked against a [`Type`], and back.
//!
//! Two surface encodings share one typed conversion path:
//! - CBOR (the compact form), where "not yet known" is a dedicated tag
//! - JSON (stored raw state), which cannot carry "not yet known"

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cachet_core::{AttributePath, PathStep, Type, Value};
use ciborium::value::{Integer, Value as Cbor};
use serde_json::{Number, Value as Json};

mod attributes;

pub use attributes::{Attributes, StringAttr};

/// CBOR tag wrapping a "not yet known" value.
pub const UNKNOWN_TAG: u64 = 0x6361_0000;

pub const DEFAULT_MAX_STATE_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_STATE_NODES: usize = 100_000;

/// Opaque value as it crosses the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicValue {
    Cbor(Vec<u8>),
    Json(Vec<u8>),
}

impl DynamicValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DynamicValue::Cbor(b) | DynamicValue::Json(b) => b,
        }
    }

    pub fn len(&self) -> usize { self.as_bytes().len() }
    pub fn is_empty(&self) -> bool { self.as_bytes().is_empty() }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload of {size} bytes exceeds the limit of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("value has more than {max} nodes")]
    TooComplex { max: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch { path: AttributePath, expected: String, found: &'static str },
    #[error("{path}: attribute is not part of the type")]
    UnexpectedAttribute { path: AttributePath },
    #[error("{path}: attribute missing from value")]
    MissingAttribute { path: AttributePath },
    #[error("{path}: number cannot be represented")]
    InvalidNumber { path: AttributePath },
}

impl DecodeError {
    /// Offending field, when the failure is tied to one.
    pub fn path(&self) -> Option<AttributePath> {
        match self {
            DecodeError::TypeMismatch { path, .. }
            | DecodeError::UnexpectedAttribute { path }
            | DecodeError::MissingAttribute { path }
            | DecodeError::InvalidNumber { path } => Some(path.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch { path: AttributePath, expected: String, found: &'static str },
    #[error("{path}: attribute is not part of the type")]
    UnexpectedAttribute { path: AttributePath },
    #[error("{path}: value is not yet known")]
    UnresolvedUnknown { path: AttributePath },
    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl EncodeError {
    pub fn path(&self) -> Option<AttributePath> {
        match self {
            EncodeError::TypeMismatch { path, .. }
            | EncodeError::UnexpectedAttribute { path }
            | EncodeError::UnresolvedUnknown { path } => Some(path.clone()),
            EncodeError::Serialize(_) => None,
        }
    }
}

/// Size budgets applied before and during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self { max_bytes: DEFAULT_MAX_STATE_BYTES, max_nodes: DEFAULT_MAX_STATE_NODES }
    }
}

impl CodecLimits {
    /// Read `CACHET_MAX_STATE_BYTES` / `CACHET_MAX_STATE_NODES`, falling back to defaults.
    pub fn from_env() -> Self {
        let max_bytes = std::env::var("CACHET_MAX_STATE_BYTES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_STATE_BYTES);
        let max_nodes = std::env::var("CACHET_MAX_STATE_NODES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_STATE_NODES);
        Self { max_bytes, max_nodes }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateCodec {
    limits: CodecLimits,
}

impl StateCodec {
    pub fn new(limits: CodecLimits) -> Self { Self { limits } }

    pub fn limits(&self) -> CodecLimits { self.limits }

    /// Decode `dv` as an instance of `ty`.
    ///
    /// Object attributes missing from the payload decode as explicit nulls.
    pub fn decode(&self, dv: &DynamicValue, ty: &Type) -> Result<Value, DecodeError> {
        let bytes = dv.as_bytes();
        if bytes.len() > self.limits.max_bytes {
            return Err(DecodeError::TooLarge { size: bytes.len(), max: self.limits.max_bytes });
        }
        let raw = match dv {
            DynamicValue::Cbor(b) => parse_cbor(b)?,
            DynamicValue::Json(b) => {
                let j: Json = serde_json::from_slice(b).map_err(|e| DecodeError::Malformed(e.to_string()))?;
                json_to_cbor(j)
            }
        };
        let mut dec = Decoder { remaining: self.limits.max_nodes, max: self.limits.max_nodes, path: AttributePath::new() };
        let v = dec.value(&raw, ty)?;
        tracing::trace!(bytes = bytes.len(), nodes = self.limits.max_nodes - dec.remaining, "state decoded");
        Ok(v)
    }

    /// Like [`decode`](Self::decode), with an absent payload meaning null.
    pub fn decode_opt(&self, dv: Option<&DynamicValue>, ty: &Type) -> Result<Value, DecodeError> {
        match dv {
            Some(dv) if !dv.is_empty() => self.decode(dv, ty),
            _ => Ok(Value::Null),
        }
    }

    /// Encode `value` as CBOR after checking it against `ty`.
    pub fn encode(&self, value: &Value, ty: &Type) -> Result<DynamicValue, EncodeError> {
        let raw = Encoder::default().value(value, ty)?;
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&raw, &mut buf).map_err(|e| EncodeError::Serialize(e.to_string()))?;
        Ok(DynamicValue::Cbor(buf))
    }

    /// Encode `value` as JSON. Fails on any "not yet known" marker.
    pub fn encode_json(&self, value: &Value, ty: &Type) -> Result<DynamicValue, EncodeError> {
        ensure_known(value)?;
        let raw = Encoder::default().value(value, ty)?;
        let j = cbor_to_json(raw)?;
        let buf = serde_json::to_vec(&j).map_err(|e| EncodeError::Serialize(e.to_string()))?;
        Ok(DynamicValue::Json(buf))
    }
}

/// Fails with the path of the first "not yet known" marker in `value`.
pub fn ensure_known(value: &Value) -> Result<(), EncodeError> {
    match value.first_unknown() {
        Some(path) => Err(EncodeError::UnresolvedUnknown { path }),
        None => Ok(()),
    }
}

fn parse_cbor(bytes: &[u8]) -> Result<Cbor, DecodeError> {
    let mut rd = bytes;
    let v: Cbor = ciborium::de::from_reader(&mut rd).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if !rd.is_empty() {
        return Err(DecodeError::Malformed(format!("{} trailing bytes after value", rd.len())));
    }
    Ok(v)
}

fn cbor_kind(c: &Cbor) -> &'static str {
    match c {
        Cbor::Integer(_) | Cbor::Float(_) => "number",
        Cbor::Bytes(_) => "bytes",
        Cbor::Text(_) => "string",
        Cbor::Bool(_) => "bool",
        Cbor::Null => "null",
        Cbor::Tag(..) => "tag",
        Cbor::Array(_) => "list",
        Cbor::Map(_) => "map",
        _ => "unsupported",
    }
}

// ---------------- decoding ----------------

struct Decoder {
    remaining: usize,
    max: usize,
    path: AttributePath,
}

impl Decoder {
    fn mismatch(&self, ty: &Type, found: &Cbor) -> DecodeError {
        DecodeError::TypeMismatch { path: self.path.clone(), expected: ty.to_string(), found: cbor_kind(found) }
    }

    fn value(&mut self, c: &Cbor, ty: &Type) -> Result<Value, DecodeError> {
        if self.remaining == 0 {
            return Err(DecodeError::TooComplex { max: self.max });
        }
        self.remaining -= 1;
        match c {
            Cbor::Tag(tag, _) if *tag == UNKNOWN_TAG => return Ok(Value::Unknown),
            Cbor::Tag(tag, _) => return Err(DecodeError::Malformed(format!("{}: unsupported tag {}", self.path, tag))),
            Cbor::Null => return Ok(Value::Null),
            _ => {}
        }
        match ty {
            Type::Dynamic => self.any(c),
            Type::Bool => match c {
                Cbor::Bool(b) => Ok(Value::Bool(*b)),
                other => Err(self.mismatch(ty, other)),
            },
            Type::Number => match c {
                Cbor::Integer(_) | Cbor::Float(_) => self.number(c),
                other => Err(self.mismatch(ty, other)),
            },
            Type::String => match c {
                Cbor::Text(s) => Ok(Value::String(s.clone())),
                other => Err(self.mismatch(ty, other)),
            },
            Type::List(elem) => match c {
                Cbor::Array(items) => self.list(items, elem),
                other => Err(self.mismatch(ty, other)),
            },
            Type::Map(elem) => match c {
                Cbor::Map(entries) => self.map(entries, |_| Some(elem.as_ref()), PathStep::ElementKey),
                other => Err(self.mismatch(ty, other)),
            },
            Type::Object(attrs) => match c {
                Cbor::Map(entries) => {
                    let mut out = self.map(entries, |k| attrs.get(k), PathStep::Attribute)?;
                    if let Value::Map(m) = &mut out {
                        for name in attrs.keys() {
                            m.entry(name.clone()).or_insert(Value::Null);
                        }
                    }
                    Ok(out)
                }
                other => Err(self.mismatch(ty, other)),
            },
        }
    }

    /// Self-describing decode for values of the any-type.
    fn any(&mut self, c: &Cbor) -> Result<Value, DecodeError> {
        match c {
            Cbor::Bool(b) => Ok(Value::Bool(*b)),
            Cbor::Integer(_) | Cbor::Float(_) => self.number(c),
            Cbor::Text(s) => Ok(Value::String(s.clone())),
            Cbor::Array(items) => self.list(items, &Type::Dynamic),
            Cbor::Map(entries) => self.map(entries, |_| Some(&Type::Dynamic), PathStep::ElementKey),
            other => Err(self.mismatch(&Type::Dynamic, other)),
        }
    }

    fn number(&self, c: &Cbor) -> Result<Value, DecodeError> {
        let n = match c {
            Cbor::Integer(i) => {
                let wide = i128::from(*i);
                if let Ok(v) = i64::try_from(wide) {
                    Some(Number::from(v))
                } else {
                    u64::try_from(wide).ok().map(Number::from)
                }
            }
            Cbor::Float(f) => Number::from_f64(*f),
            _ => None,
        };
        n.map(Value::Number).ok_or_else(|| DecodeError::InvalidNumber { path: self.path.clone() })
    }

    fn list(&mut self, items: &[Cbor], elem: &Type) -> Result<Value, DecodeError> {
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            self.path.push(PathStep::ElementIndex(i as u64));
            out.push(self.value(item, elem)?);
            self.path.pop();
        }
        Ok(Value::List(out))
    }

    fn map<'t>(
        &mut self,
        entries: &[(Cbor, Cbor)],
        type_for: impl Fn(&str) -> Option<&'t Type>,
        step: fn(String) -> PathStep,
    ) -> Result<Value, DecodeError> {
        let mut out = BTreeMap::new();
        for (k, v) in entries {
            let key = match k {
                Cbor::Text(s) => s,
                other => return Err(DecodeError::Malformed(format!("{}: map key must be a string, found {}", self.path, cbor_kind(other)))),
            };
            self.path.push(step(key.clone()));
            let ty = match type_for(key.as_str()) {
                Some(t) => t,
                None => return Err(DecodeError::UnexpectedAttribute { path: self.path.clone() }),
            };
            let decoded = self.value(v, ty)?;
            if out.insert(key.clone(), decoded).is_some() {
                return Err(DecodeError::Malformed(format!("{}: duplicate key", self.path)));
            }
            self.path.pop();
        }
        Ok(Value::Map(out))
    }
}

fn json_to_cbor(j: Json) -> Cbor {
    match j {
        Json::Null => Cbor::Null,
        Json::Bool(b) => Cbor::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Cbor::Integer(Integer::from(i))
            } else if let Some(u) = n.as_u64() {
                Cbor::Integer(Integer::from(u))
            } else {
                Cbor::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Cbor::Text(s),
        Json::Array(items) => Cbor::Array(items.into_iter().map(json_to_cbor).collect()),
        Json::Object(entries) => Cbor::Map(entries.into_iter().map(|(k, v)| (Cbor::Text(k), json_to_cbor(v))).collect()),
    }
}

// ---------------- encoding ----------------

#[derive(Default)]
struct Encoder {
    path: AttributePath,
}

impl Encoder {
    fn mismatch(&self, ty: &Type, found: &Value) -> EncodeError {
        EncodeError::TypeMismatch { path: self.path.clone(), expected: ty.to_string(), found: found.kind() }
    }

    fn value(&mut self, v: &Value, ty: &Type) -> Result<Cbor, EncodeError> {
        match v {
            Value::Unknown => return Ok(Cbor::Tag(UNKNOWN_TAG, Box::new(Cbor::Null))),
            Value::Null => return Ok(Cbor::Null),
            _ => {}
        }
        match (ty, v) {
            (Type::Dynamic, v) => self.any(v),
            (Type::Bool, Value::Bool(b)) => Ok(Cbor::Bool(*b)),
            (Type::Number, Value::Number(n)) => Ok(number_to_cbor(n)),
            (Type::String, Value::String(s)) => Ok(Cbor::Text(s.clone())),
            (Type::List(elem), Value::List(items)) => self.list(items, elem),
            (Type::Map(elem), Value::Map(entries)) => self.map(entries, elem),
            (Type::Object(attrs), Value::Map(entries)) => {
                if let Some(extra) = entries.keys().find(|k| !attrs.contains_key(*k)) {
                    self.path.push(PathStep::Attribute(extra.clone()));
                    return Err(EncodeError::UnexpectedAttribute { path: self.path.clone() });
                }
                let mut out = Vec::with_capacity(attrs.len());
                for (name, attr_ty) in attrs {
                    self.path.push(PathStep::Attribute(name.clone()));
                    let item = entries.get(name).unwrap_or(&Value::Null);
                    out.push((Cbor::Text(name.clone()), self.value(item, attr_ty)?));
                    self.path.pop();
                }
                Ok(Cbor::Map(out))
            }
            (ty, v) => Err(self.mismatch(ty, v)),
        }
    }

    fn any(&mut self, v: &Value) -> Result<Cbor, EncodeError> {
        match v {
            Value::Unknown => Ok(Cbor::Tag(UNKNOWN_TAG, Box::new(Cbor::Null))),
            Value::Null => Ok(Cbor::Null),
            Value::Bool(b) => Ok(Cbor::Bool(*b)),
            Value::Number(n) => Ok(number_to_cbor(n)),
            Value::String(s) => Ok(Cbor::Text(s.clone())),
            Value::List(items) => self.list(items, &Type::Dynamic),
            Value::Map(entries) => self.map(entries, &Type::Dynamic),
        }
    }

    fn map(&mut self, entries: &BTreeMap<String, Value>, elem: &Type) -> Result<Cbor, EncodeError> {
        let mut out = Vec::with_capacity(entries.len());
        for (k, item) in entries {
            self.path.push(PathStep::ElementKey(k.clone()));
            out.push((Cbor::Text(k.clone()), self.value(item, elem)?));
            self.path.pop();
        }
        Ok(Cbor::Map(out))
    }

    fn list(&mut self, items: &[Value], elem: &Type) -> Result<Cbor, EncodeError> {
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            self.path.push(PathStep::ElementIndex(i as u64));
            out.push(self.value(item, elem)?);
            self.path.pop();
        }
        Ok(Cbor::Array(out))
    }
}

fn number_to_cbor(n: &Number) -> Cbor {
    if let Some(i) = n.as_i64() {
        Cbor::Integer(Integer::from(i))
    } else if let Some(u) = n.as_u64() {
        Cbor::Integer(Integer::from(u))
    } else {
        // serde_json numbers are finite, so this is always a real float
        Cbor::Float(n.as_f64().unwrap_or_default())
    }
}

fn cbor_to_json(c: Cbor) -> Result<Json, EncodeError> {
    Ok(match c {
        Cbor::Null => Json::Null,
        Cbor::Bool(b) => Json::Bool(b),
        Cbor::Integer(i) => {
            let wide = i128::from(i);
            if let Ok(v) = i64::try_from(wide) {
                Json::Number(Number::from(v))
            } else if let Ok(v) = u64::try_from(wide) {
                Json::Number(Number::from(v))
            } else {
                return Err(EncodeError::Serialize(format!("integer {} out of range", wide)));
            }
        }
        Cbor::Float(f) => Number::from_f64(f)
            .map(Json::Number)
            .ok_or_else(|| EncodeError::Serialize(format!("non-finite float {}", f)))?,
        Cbor::Text(s) => Json::String(s),
        Cbor::Array(items) => Json::Array(items.into_iter().map(cbor_to_json).collect::<Result<_, _>>()?),
        Cbor::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                let Cbor::Text(k) = k else {
                    return Err(EncodeError::Serialize("non-string map key".into()));
                };
                out.insert(k, cbor_to_json(v)?);
            }
            Json::Object(out)
        }
        other => return Err(EncodeError::Serialize(format!("{} has no JSON form", cbor_kind(&other)))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_type() -> Type {
        Type::object([
            ("timestamp", Type::String),
            ("value", Type::Dynamic),
            ("keepers", Type::map(Type::Dynamic)),
        ])
    }

    #[test]
    fn cbor_round_trip_keeps_unknown_and_null() {
        let codec = StateCodec::default();
        let v = Value::object([
            ("timestamp", Value::Unknown),
            ("value", Value::List(vec![Value::from("a"), Value::from(2i64), Value::Null])),
            ("keepers", Value::Null),
        ]);
        let dv = codec.encode(&v, &record_type()).unwrap();
        assert!(matches!(dv, DynamicValue::Cbor(_)));
        assert_eq!(codec.decode(&dv, &record_type()).unwrap(), v);
    }

    #[test]
    fn missing_attributes_decode_as_null() {
        let codec = StateCodec::default();
        let dv = DynamicValue::Json(br#"{"value": "abc"}"#.to_vec());
        let v = codec.decode(&dv, &record_type()).unwrap();
        assert_eq!(v.get("timestamp"), Some(&Value::Null));
        assert_eq!(v.get("keepers"), Some(&Value::Null));
        assert_eq!(v.get("value"), Some(&Value::from("abc")));
    }

    #[test]
    fn unexpected_attribute_is_rejected_with_path() {
        let codec = StateCodec::default();
        let dv = DynamicValue::Json(br#"{"value": 1, "object": {}}"#.to_vec());
        let err = codec.decode(&dv, &record_type()).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedAttribute { path: AttributePath::root("object") });
    }

    #[test]
    fn type_mismatch_reports_nested_path() {
        let codec = StateCodec::default();
        let ty = Type::object([("tags", Type::map(Type::String))]);
        let dv = DynamicValue::Json(serde_json::to_vec(&json!({"tags": {"a": "x", "b": 3}})).unwrap());
        match codec.decode(&dv, &ty).unwrap_err() {
            DecodeError::TypeMismatch { path, expected, found } => {
                assert_eq!(path.to_string(), "tags[\"b\"]");
                assert_eq!(expected, "string");
                assert_eq!(found, "number");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn json_encoding_refuses_unknown() {
        let codec = StateCodec::default();
        let v = Value::object([("timestamp", Value::Unknown), ("value", Value::from("x")), ("keepers", Value::Null)]);
        let err = codec.encode_json(&v, &record_type()).unwrap_err();
        assert_eq!(err, EncodeError::UnresolvedUnknown { path: AttributePath::root("timestamp") });
    }

    #[test]
    fn json_encoding_emits_every_attribute() {
        let codec = StateCodec::default();
        let v = Value::object([("value", Value::from("x"))]);
        let dv = codec.encode_json(&v, &record_type()).unwrap();
        let j: Json = serde_json::from_slice(dv.as_bytes()).unwrap();
        assert_eq!(j, json!({"keepers": null, "timestamp": null, "value": "x"}));
    }

    #[test]
    fn encode_rejects_mismatched_shape() {
        let codec = StateCodec::default();
        let v = Value::object([("timestamp", Value::from(5i64))]);
        let err = codec.encode(&v, &record_type()).unwrap_err();
        assert_eq!(err.path(), Some(AttributePath::root("timestamp")));
        let extra = Value::object([("surprise", Value::Null)]);
        assert!(matches!(codec.encode(&extra, &record_type()), Err(EncodeError::UnexpectedAttribute { .. })));
    }

    #[test]
    fn limits_are_enforced() {
        let codec = StateCodec::new(CodecLimits { max_bytes: 8, max_nodes: 100 });
        let dv = DynamicValue::Json(br#"{"value": "0123456789"}"#.to_vec());
        assert!(matches!(codec.decode(&dv, &record_type()), Err(DecodeError::TooLarge { .. })));

        let codec = StateCodec::new(CodecLimits { max_bytes: 1024, max_nodes: 3 });
        let dv = DynamicValue::Json(br#"{"value": [1, 2, 3, 4]}"#.to_vec());
        assert_eq!(codec.decode(&dv, &record_type()), Err(DecodeError::TooComplex { max: 3 }));
    }

    #[test]
    fn malformed_and_trailing_bytes() {
        let codec = StateCodec::default();
        assert!(matches!(codec.decode(&DynamicValue::Json(b"{".to_vec()), &record_type()), Err(DecodeError::Malformed(_))));
        let DynamicValue::Cbor(mut bytes) = codec.encode(&Value::Null, &record_type()).unwrap() else { unreachable!() };
        bytes.push(0xf6);
        assert!(matches!(codec.decode(&DynamicValue::Cbor(bytes), &record_type()), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn absent_payload_is_null() {
        let codec = StateCodec::default();
        assert_eq!(codec.decode_opt(None, &record_type()).unwrap(), Value::Null);
        assert_eq!(codec.decode_opt(Some(&DynamicValue::Cbor(Vec::new())), &record_type()).unwrap(), Value::Null);
    }
}
