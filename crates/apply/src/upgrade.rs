//! Schema upgrade: carry a stored record forward one version at a time until
//! it matches the latest schema.

use std::time::Instant;

use cachet_codec::{DecodeError, DynamicValue, EncodeError, StateCodec};
use cachet_core::{IntoDiagnostic, Value};
use cachet_schema::attr::KEEPERS;
use cachet_schema::{type_of, ProviderSchemas, SchemaError, SchemaVersion};
use metrics::{counter, histogram};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("old state: {0}")]
    Decode(DecodeError),
    #[error("cannot upgrade a {found} value from version {from}; expected an object")]
    Step { from: i64, found: &'static str },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl IntoDiagnostic for UpgradeError {
    fn summary(&self) -> &'static str {
        match self {
            UpgradeError::Schema(SchemaError::UnknownType(_)) => "Failed to determine resource type",
            UpgradeError::Schema(SchemaError::UnknownVersion { .. }) | UpgradeError::Step { .. } => {
                "Failed to upgrade the schema of the resource"
            }
            UpgradeError::Decode(_) => "Failed to decode old state during upgrade",
            UpgradeError::Encode(_) => "Failed to encode new state during upgrade",
        }
    }

    fn attribute(&self) -> Option<cachet_core::AttributePath> {
        match self {
            UpgradeError::Decode(e) => e.path(),
            UpgradeError::Encode(e) => e.path(),
            _ => None,
        }
    }
}

/// Transition from `from` to the version right after it.
fn step(from: SchemaVersion, state: Value) -> Result<Value, UpgradeError> {
    match from {
        SchemaVersion::V1 => add_keepers(state),
        SchemaVersion::V2 => Ok(state),
    }
}

fn add_keepers(state: Value) -> Result<Value, UpgradeError> {
    match state {
        Value::Null => Ok(Value::Null),
        Value::Map(mut m) => {
            m.insert(KEEPERS.to_string(), Value::empty_map());
            Ok(Value::Map(m))
        }
        other => Err(UpgradeError::Step { from: SchemaVersion::V1.number(), found: other.kind() }),
    }
}

/// Apply every single-version transition from `from` up to the latest version.
pub fn upgrade_value(from: SchemaVersion, mut state: Value) -> Result<(Value, usize), UpgradeError> {
    let mut v = from;
    let mut steps = 0usize;
    while let Some(next) = v.next() {
        state = step(v, state)?;
        v = next;
        steps += 1;
    }
    Ok((state, steps))
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeEngine {
    codec: StateCodec,
}

impl UpgradeEngine {
    pub fn new(codec: StateCodec) -> Self { Self { codec } }

    /// Re-encode `raw`, recorded under schema `from_version`, in the latest shape.
    ///
    /// Versions at or above the current one pass through unchanged.
    pub fn upgrade(
        &self,
        schemas: &ProviderSchemas,
        type_name: &str,
        raw: &DynamicValue,
        from_version: i64,
    ) -> Result<DynamicValue, UpgradeError> {
        let t0 = Instant::now();
        let current = schemas.current_version(type_name)?;
        let latest_ty = schemas.resource_type(type_name)?;

        let (state, steps) = if from_version >= current {
            let state = self.codec.decode_opt(Some(raw), &latest_ty).map_err(UpgradeError::Decode)?;
            (state, 0)
        } else {
            let old_schema = schemas.schema_at_version(type_name, from_version)?;
            let from = SchemaVersion::from_number(from_version)
                .ok_or_else(|| SchemaError::UnknownVersion { type_name: type_name.to_string(), version: from_version })?;
            let old = self.codec.decode_opt(Some(raw), &type_of(old_schema)).map_err(UpgradeError::Decode)?;
            upgrade_value(from, old)?
        };
        let out = self.codec.encode(&state, &latest_ty)?;

        counter!("upgrade_total", 1u64);
        counter!("upgrade_steps_total", steps as u64);
        histogram!("upgrade_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if steps > 0 {
            info!(type_name, from_version, to_version = current, steps, "state upgraded");
        } else {
            debug!(type_name, from_version, "state already current");
        }
        Ok(out)
    }
}
