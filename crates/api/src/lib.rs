//! Cachet provider boundary (in-process).
//!
//! This crate defines the calls a host runtime makes against the provider and
//! an implementation that dispatches them to the engines. Engine failures are
//! carried back as diagnostics on an otherwise successful response; only the
//! unsupported calls fail at the transport level.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use cachet_apply::{
    ApplyEngine, Clock, DiffSummary, KeepPrior, PlanAction, PlanEngine, ReplaceOnKeepersChange, SystemClock,
    UpdatePolicy, UpgradeEngine,
};
use cachet_codec::{CodecLimits, DecodeError, DynamicValue, StateCodec};
use cachet_core::{AttributePath, Diagnostics, IntoDiagnostic};
use cachet_schema::{validate_config, ProviderSchemas, Schema, SchemaError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Transport-level failures. Everything else travels as a diagnostic.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// What planning does when an existing record's `keepers` change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepersPolicy {
    /// Keep the prior state; nothing is recreated.
    #[default]
    Noop,
    /// Recreate the record.
    Replace,
}

impl KeepersPolicy {
    fn update_policy(self) -> Box<dyn UpdatePolicy> {
        match self {
            KeepersPolicy::Noop => Box::new(KeepPrior),
            KeepersPolicy::Replace => Box::new(ReplaceOnKeepersChange),
        }
    }
}

impl FromStr for KeepersPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "noop" | "no-op" => Ok(KeepersPolicy::Noop),
            "replace" => Ok(KeepersPolicy::Replace),
            other => Err(format!("unknown keepers policy {:?} (expected noop|replace)", other)),
        }
    }
}

/// Runtime knobs of the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    pub limits: CodecLimits,
    pub keepers_policy: KeepersPolicy,
}

impl ProviderConfig {
    /// Read `CACHET_MAX_STATE_BYTES`, `CACHET_MAX_STATE_NODES` and `CACHET_KEEPERS_POLICY`.
    pub fn from_env() -> Self {
        let keepers_policy = std::env::var("CACHET_KEEPERS_POLICY")
            .ok()
            .and_then(|s| s.parse::<KeepersPolicy>().ok())
            .unwrap_or_default();
        Self { limits: CodecLimits::from_env(), keepers_policy }
    }
}

// ----------------- Requests / responses -----------------

#[derive(Debug, Clone, Serialize)]
pub struct GetProviderSchemaResponse {
    pub provider: Schema,
    pub resource_schemas: BTreeMap<String, Schema>,
    pub data_source_schemas: BTreeMap<String, Schema>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareProviderConfigRequest {
    pub config: Option<DynamicValue>,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareProviderConfigResponse {
    pub prepared_config: Option<DynamicValue>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ValidateResourceTypeConfigRequest {
    pub type_name: String,
    pub config: Option<DynamicValue>,
}

#[derive(Debug, Clone)]
pub struct ValidateDataSourceConfigRequest {
    pub type_name: String,
    pub config: Option<DynamicValue>,
}

/// Response of both validation calls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidateConfigResponse {
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct UpgradeResourceStateRequest {
    pub type_name: String,
    /// Schema version the raw state was recorded under.
    pub version: i64,
    pub raw_state: DynamicValue,
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeResourceStateResponse {
    pub upgraded_state: Option<DynamicValue>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ReadResourceRequest {
    pub type_name: String,
    pub current_state: Option<DynamicValue>,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadResourceResponse {
    pub new_state: Option<DynamicValue>,
    pub private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct PlanResourceChangeRequest {
    pub type_name: String,
    pub prior_state: Option<DynamicValue>,
    pub proposed_new_state: Option<DynamicValue>,
    pub config: Option<DynamicValue>,
    pub prior_private: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanResourceChangeResponse {
    pub planned_state: Option<DynamicValue>,
    pub requires_replace: Vec<AttributePath>,
    pub planned_private: Vec<u8>,
    /// `None` when planning failed.
    pub action: Option<PlanAction>,
    pub summary: DiffSummary,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ApplyResourceChangeRequest {
    pub type_name: String,
    pub prior_state: Option<DynamicValue>,
    pub planned_state: Option<DynamicValue>,
    pub config: Option<DynamicValue>,
    pub planned_private: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyResourceChangeResponse {
    pub new_state: Option<DynamicValue>,
    pub private: Vec<u8>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ReadDataSourceRequest {
    pub type_name: String,
    pub config: Option<DynamicValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadDataSourceResponse {
    pub state: Option<DynamicValue>,
    pub diagnostics: Diagnostics,
}

/// Provider surface as seen by a host runtime.
#[async_trait::async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get_provider_schema(&self) -> ProviderResult<GetProviderSchemaResponse>;

    /// Provider configuration is accepted as-is.
    async fn prepare_provider_config(&self, req: PrepareProviderConfigRequest) -> ProviderResult<PrepareProviderConfigResponse>;

    async fn validate_resource_type_config(
        &self,
        req: ValidateResourceTypeConfigRequest,
    ) -> ProviderResult<ValidateConfigResponse>;

    async fn validate_data_source_config(&self, req: ValidateDataSourceConfigRequest) -> ProviderResult<ValidateConfigResponse>;

    /// Bring stored state recorded under an older schema up to the latest one.
    async fn upgrade_resource_state(&self, req: UpgradeResourceStateRequest) -> ProviderResult<UpgradeResourceStateResponse>;

    /// Refresh; a cached value has no outside source, so a decodable state comes back unchanged.
    async fn read_resource(&self, req: ReadResourceRequest) -> ProviderResult<ReadResourceResponse>;

    async fn plan_resource_change(&self, req: PlanResourceChangeRequest) -> ProviderResult<PlanResourceChangeResponse>;

    async fn apply_resource_change(&self, req: ApplyResourceChangeRequest) -> ProviderResult<ApplyResourceChangeResponse>;

    /// Unsupported: always [`ProviderError::Unimplemented`].
    async fn read_data_source(&self, req: ReadDataSourceRequest) -> ProviderResult<ReadDataSourceResponse>;

    /// Unsupported: always [`ProviderError::Unimplemented`].
    async fn stop_provider(&self) -> ProviderResult<()>;
}

// ----------------- In-process implementation -----------------

#[derive(Debug, thiserror::Error)]
enum CheckError {
    #[error(transparent)]
    ResourceType(#[from] SchemaError),
    #[error("{0}")]
    Decode(DecodeError),
}

impl IntoDiagnostic for CheckError {
    fn summary(&self) -> &'static str {
        match self {
            CheckError::ResourceType(_) => "Failed to determine resource type",
            CheckError::Decode(_) => "Failed to unmarshal resource state",
        }
    }

    fn attribute(&self) -> Option<AttributePath> {
        match self {
            CheckError::ResourceType(_) => None,
            CheckError::Decode(e) => e.path(),
        }
    }
}

/// In-process provider calling the engines directly.
#[derive(Debug)]
pub struct InProcProvider {
    schemas: Arc<ProviderSchemas>,
    codec: StateCodec,
    plan: PlanEngine,
    apply: ApplyEngine,
    upgrade: UpgradeEngine,
    config: ProviderConfig,
}

impl InProcProvider {
    pub fn new(config: ProviderConfig) -> Self { Self::with_clock(config, Arc::new(SystemClock)) }

    pub fn with_clock(config: ProviderConfig, clock: Arc<dyn Clock>) -> Self {
        let codec = StateCodec::new(config.limits);
        Self {
            schemas: Arc::new(ProviderSchemas::new()),
            plan: PlanEngine::with_policy(codec.clone(), config.keepers_policy.update_policy()),
            apply: ApplyEngine::with_clock(codec.clone(), clock),
            upgrade: UpgradeEngine::new(codec.clone()),
            codec,
            config,
        }
    }

    pub fn config(&self) -> ProviderConfig { self.config }

    pub fn schemas(&self) -> &ProviderSchemas { &self.schemas }

    fn report<E: IntoDiagnostic>(call: &'static str, e: &E) -> Diagnostics {
        let d = e.to_diagnostic();
        counter!("diagnostics_error_total", 1u64);
        warn!(call, diagnostic = %d, "api: call returned error diagnostic");
        vec![d]
    }

    fn check_state(&self, type_name: &str, state: Option<&DynamicValue>) -> Result<(), CheckError> {
        let ty = self.schemas.resource_type(type_name)?;
        self.codec.decode_opt(state, &ty).map_err(CheckError::Decode)?;
        Ok(())
    }

    fn validate(&self, type_name: &str, config: Option<&DynamicValue>) -> Result<Diagnostics, CheckError> {
        let schema = self.schemas.latest_schema(type_name)?;
        let ty = cachet_schema::type_of(schema);
        let value = self.codec.decode_opt(config, &ty).map_err(CheckError::Decode)?;
        Ok(validate_config(schema, &value).iter().map(IntoDiagnostic::to_diagnostic).collect())
    }
}

#[async_trait::async_trait]
impl CacheProvider for InProcProvider {
    async fn get_provider_schema(&self) -> ProviderResult<GetProviderSchemaResponse> {
        let mut resource_schemas = BTreeMap::new();
        for name in self.schemas.type_names() {
            let schema = self.schemas.latest_schema(name).map_err(|e| ProviderError::Internal(e.to_string()))?;
            resource_schemas.insert(name.to_string(), schema.clone());
        }
        info!(resources = resource_schemas.len(), "api: get_provider_schema ok");
        Ok(GetProviderSchemaResponse {
            provider: self.schemas.provider_schema().clone(),
            resource_schemas,
            data_source_schemas: BTreeMap::new(),
            diagnostics: Vec::new(),
        })
    }

    async fn prepare_provider_config(&self, req: PrepareProviderConfigRequest) -> ProviderResult<PrepareProviderConfigResponse> {
        Ok(PrepareProviderConfigResponse { prepared_config: req.config, diagnostics: Vec::new() })
    }

    async fn validate_resource_type_config(
        &self,
        req: ValidateResourceTypeConfigRequest,
    ) -> ProviderResult<ValidateConfigResponse> {
        let t0 = Instant::now();
        let diagnostics = match self.validate(&req.type_name, req.config.as_ref()) {
            Ok(d) => d,
            Err(e) => Self::report("validate_resource_type_config", &e),
        };
        histogram!("validate_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(type_name = %req.type_name, diagnostics = diagnostics.len(), took_ms = %t0.elapsed().as_millis(), "api: validate done");
        Ok(ValidateConfigResponse { diagnostics })
    }

    async fn validate_data_source_config(&self, req: ValidateDataSourceConfigRequest) -> ProviderResult<ValidateConfigResponse> {
        info!(type_name = %req.type_name, "api: validate_data_source_config ok");
        Ok(ValidateConfigResponse::default())
    }

    async fn upgrade_resource_state(&self, req: UpgradeResourceStateRequest) -> ProviderResult<UpgradeResourceStateResponse> {
        let t0 = Instant::now();
        info!(type_name = %req.type_name, version = req.version, bytes = req.raw_state.len(), "api: upgrade start");
        let resp = match self.upgrade.upgrade(&self.schemas, &req.type_name, &req.raw_state, req.version) {
            Ok(state) => UpgradeResourceStateResponse { upgraded_state: Some(state), diagnostics: Vec::new() },
            Err(e) => UpgradeResourceStateResponse { upgraded_state: None, diagnostics: Self::report("upgrade_resource_state", &e) },
        };
        info!(ok = resp.diagnostics.is_empty(), took_ms = %t0.elapsed().as_millis(), "api: upgrade done");
        Ok(resp)
    }

    async fn read_resource(&self, req: ReadResourceRequest) -> ProviderResult<ReadResourceResponse> {
        if let Err(e) = self.check_state(&req.type_name, req.current_state.as_ref()) {
            return Ok(ReadResourceResponse { diagnostics: Self::report("read_resource", &e), ..Default::default() });
        }
        Ok(ReadResourceResponse { new_state: req.current_state, private: req.private, diagnostics: Vec::new() })
    }

    async fn plan_resource_change(&self, req: PlanResourceChangeRequest) -> ProviderResult<PlanResourceChangeResponse> {
        let t0 = Instant::now();
        info!(type_name = %req.type_name, destroy = req.proposed_new_state.is_none(), "api: plan start");
        let resp = match self.plan.plan(&self.schemas, &req.type_name, req.proposed_new_state.as_ref(), req.prior_state.as_ref()) {
            Ok(change) => PlanResourceChangeResponse {
                planned_state: change.planned_state,
                requires_replace: change.requires_replace,
                planned_private: req.prior_private,
                action: Some(change.action),
                summary: change.summary,
                diagnostics: Vec::new(),
            },
            Err(e) => PlanResourceChangeResponse {
                diagnostics: Self::report("plan_resource_change", &e),
                ..Default::default()
            },
        };
        info!(action = ?resp.action, took_ms = %t0.elapsed().as_millis(), "api: plan done");
        Ok(resp)
    }

    async fn apply_resource_change(&self, req: ApplyResourceChangeRequest) -> ProviderResult<ApplyResourceChangeResponse> {
        let t0 = Instant::now();
        info!(type_name = %req.type_name, destroy = req.planned_state.is_none(), "api: apply start");
        let resp = match self.apply.apply(&self.schemas, &req.type_name, req.planned_state.as_ref(), req.prior_state.as_ref()) {
            Ok(new_state) => ApplyResourceChangeResponse { new_state, private: req.planned_private, diagnostics: Vec::new() },
            Err(e) => ApplyResourceChangeResponse { diagnostics: Self::report("apply_resource_change", &e), ..Default::default() },
        };
        info!(ok = resp.diagnostics.is_empty(), took_ms = %t0.elapsed().as_millis(), "api: apply done");
        Ok(resp)
    }

    async fn read_data_source(&self, req: ReadDataSourceRequest) -> ProviderResult<ReadDataSourceResponse> {
        warn!(type_name = %req.type_name, "api: read_data_source is not supported");
        Err(ProviderError::Unimplemented("method ReadDataSource not implemented".into()))
    }

    async fn stop_provider(&self) -> ProviderResult<()> {
        Err(ProviderError::Unimplemented("method Stop not implemented".into()))
    }
}
