//! Apply phase: finalize computed attributes of a planned state.

use std::sync::Arc;
use std::time::Instant;

use cachet_codec::{ensure_known, Attributes, DecodeError, DynamicValue, EncodeError, StateCodec, StringAttr};
use cachet_core::{AttributePath, IntoDiagnostic, Value};
use cachet_schema::attr::TIMESTAMP;
use cachet_schema::{ProviderSchemas, SchemaError};
use metrics::{counter, histogram};
use tracing::debug;

use crate::{Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    ResourceType(#[from] SchemaError),
    #[error("planned state: {0}")]
    DecodePlanned(DecodeError),
    #[error("prior state: {0}")]
    DecodePrior(DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl IntoDiagnostic for ApplyError {
    fn summary(&self) -> &'static str {
        match self {
            ApplyError::ResourceType(_) => "Failed to determine planned resource type",
            ApplyError::DecodePlanned(_) => "Failed to unmarshal planned resource state",
            ApplyError::DecodePrior(_) => "Failed to unmarshal prior resource state",
            ApplyError::Encode(_) => "Failed to assemble proposed state during apply",
        }
    }

    fn attribute(&self) -> Option<AttributePath> {
        match self {
            ApplyError::ResourceType(_) => None,
            ApplyError::DecodePlanned(e) | ApplyError::DecodePrior(e) => e.path(),
            ApplyError::Encode(e) => e.path(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyEngine {
    codec: StateCodec,
    clock: Arc<dyn Clock>,
}

impl ApplyEngine {
    pub fn new(codec: StateCodec) -> Self { Self::with_clock(codec, Arc::new(SystemClock)) }

    pub fn with_clock(codec: StateCodec, clock: Arc<dyn Clock>) -> Self { Self { codec, clock } }

    /// Resolve the "not yet known" markers of `planned` into a concrete state.
    ///
    /// Only `timestamp` is ever computed here; a null plan means the record is gone.
    pub fn finalize(&self, planned: Value) -> Result<Value, ApplyError> {
        if planned.is_null() {
            return Ok(Value::Null);
        }
        let mut attrs = Attributes::from_value(planned).map_err(ApplyError::DecodePlanned)?;
        let pending = matches!(attrs.string_attr(TIMESTAMP).map_err(ApplyError::DecodePlanned)?, StringAttr::Unknown);
        if pending {
            attrs.set(TIMESTAMP, Value::String(self.clock.now_unix().to_string()));
        }
        let state = attrs.into_value();
        ensure_known(&state)?;
        Ok(state)
    }

    pub fn apply(
        &self,
        schemas: &ProviderSchemas,
        type_name: &str,
        planned: Option<&DynamicValue>,
        prior: Option<&DynamicValue>,
    ) -> Result<Option<DynamicValue>, ApplyError> {
        let t0 = Instant::now();
        let ty = schemas.resource_type(type_name)?;
        let planned = self.codec.decode_opt(planned, &ty).map_err(ApplyError::DecodePlanned)?;
        let prior = self.codec.decode_opt(prior, &ty).map_err(ApplyError::DecodePrior)?;

        let state = self.finalize(planned)?;
        let out = if state.is_null() { None } else { Some(self.codec.encode(&state, &ty)?) };

        counter!("apply_total", 1u64);
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(type_name, destroyed = out.is_none(), had_prior = !prior.is_null(), "apply done");
        Ok(out)
    }
}
