//! Cachet schemas: the versioned `cache_store` record shapes, the process-wide
//! registry built once at startup, and the schema -> type resolver.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cachet_core::{IntoDiagnostic, Type};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

pub mod validate;

pub use validate::{validate_config, ValidationIssue};

/// Type name of the only managed resource.
pub const CACHE_STORE: &str = "cache_store";

/// Attribute names of `cache_store`.
pub mod attr {
    pub const TIMESTAMP: &str = "timestamp";
    pub const VALUE: &str = "value";
    pub const KEEPERS: &str = "keepers";
}

/// Schema versions of `cache_store`. Adding a version means adding a variant;
/// every exhaustive match over versions then has to account for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// `timestamp`, `value`
    V1,
    /// adds `keepers`
    V2,
}

impl SchemaVersion {
    pub const LATEST: SchemaVersion = SchemaVersion::V2;
    pub const ALL: [SchemaVersion; 2] = [SchemaVersion::V1, SchemaVersion::V2];

    pub fn number(self) -> i64 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
        }
    }

    pub fn from_number(n: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.number() == n)
    }

    /// The version directly after this one, `None` for the latest.
    pub fn next(self) -> Option<Self> {
        match self {
            SchemaVersion::V1 => Some(SchemaVersion::V2),
            SchemaVersion::V2 => None,
        }
    }
}

/// Who supplies an attribute's value. Exactly one mode per attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Caller must supply a non-null value.
    Required,
    /// Caller may omit it.
    Optional,
    /// Caller may omit it, in which case the engine decides it.
    OptionalComputed,
    /// Engine decides it; callers never set it.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    pub presence: Presence,
    pub description: String,
    #[serde(default)]
    pub sensitive: bool,
}

impl Attribute {
    fn new(name: &str, ty: Type, presence: Presence, description: &str) -> Self {
        Self { name: name.to_string(), ty, presence, description: description.to_string(), sensitive: false }
    }

    pub fn required(name: &str, ty: Type, description: &str) -> Self { Self::new(name, ty, Presence::Required, description) }
    pub fn optional(name: &str, ty: Type, description: &str) -> Self { Self::new(name, ty, Presence::Optional, description) }
    pub fn computed(name: &str, ty: Type, description: &str) -> Self { Self::new(name, ty, Presence::Computed, description) }

    pub fn is_required(&self) -> bool { self.presence == Presence::Required }
    pub fn is_optional(&self) -> bool { matches!(self.presence, Presence::Optional | Presence::OptionalComputed) }
    pub fn is_computed(&self) -> bool { matches!(self.presence, Presence::Computed | Presence::OptionalComputed) }
}

/// Named nested block; surfaces in the record type as `list(object)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedBlock {
    pub type_name: String,
    pub block: Block,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub attributes: Vec<Attribute>,
    pub block_types: Vec<NestedBlock>,
    #[serde(default)]
    pub description: String,
}

impl Block {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: i64,
    pub block: Block,
}

/// Structural type that wholly represents instances of `schema`.
///
/// Attributes map to their own types; each nested block becomes a
/// `list(object)` of the block's attributes. Only one level of nesting is
/// expanded.
pub fn type_of(schema: &Schema) -> Type {
    let mut attrs = attribute_types(&schema.block);
    for nb in &schema.block.block_types {
        attrs.insert(nb.type_name.clone(), Type::list(Type::Object(attribute_types(&nb.block))));
    }
    Type::Object(attrs)
}

fn attribute_types(block: &Block) -> BTreeMap<String, Type> {
    block.attributes.iter().map(|a| (a.name.clone(), a.ty.clone())).collect()
}

// ---------------- cache_store ----------------

fn timestamp_attribute() -> Attribute {
    Attribute::computed(attr::TIMESTAMP, Type::String, "The timestamp this cached value was created")
}

fn value_attribute() -> Attribute {
    Attribute::required(attr::VALUE, Type::Dynamic, "The value to cache.")
}

fn keepers_attribute() -> Attribute {
    Attribute::optional(
        attr::KEEPERS,
        Type::map(Type::Dynamic),
        "Arbitrary map of values that, when changed, will trigger recreation of resource.",
    )
}

/// `cache_store` schema as recorded at `version`.
pub fn cache_store_schema(version: SchemaVersion) -> Schema {
    let attributes = match version {
        SchemaVersion::V1 => vec![timestamp_attribute(), value_attribute()],
        SchemaVersion::V2 => vec![timestamp_attribute(), value_attribute(), keepers_attribute()],
    };
    Schema {
        version: version.number(),
        block: Block { attributes, block_types: Vec::new(), description: "A single cached value.".to_string() },
    }
}

// ---------------- registry ----------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown resource {0} - cannot find schema")]
    UnknownType(String),
    #[error("resource {type_name} has no schema version {version}")]
    UnknownVersion { type_name: String, version: i64 },
}

impl IntoDiagnostic for SchemaError {
    fn summary(&self) -> &'static str {
        match self {
            SchemaError::UnknownType(_) => "Failed to determine resource type",
            SchemaError::UnknownVersion { .. } => "Unsupported schema version",
        }
    }
}

#[derive(Debug, Clone)]
struct ResourceSchemas {
    latest: Schema,
    by_version: BTreeMap<i64, Schema>,
}

/// Immutable set of schemas the provider serves. Built once and shared by
/// reference; lookups never depend on map iteration order.
#[derive(Debug, Clone)]
pub struct ProviderSchemas {
    provider: Schema,
    resources: FxHashMap<String, ResourceSchemas>,
}

impl Default for ProviderSchemas {
    fn default() -> Self { Self::new() }
}

impl ProviderSchemas {
    pub fn new() -> Self {
        let by_version: BTreeMap<i64, Schema> = SchemaVersion::ALL
            .into_iter()
            .map(|v| (v.number(), cache_store_schema(v)))
            .collect();
        let mut resources = FxHashMap::default();
        let latest = cache_store_schema(SchemaVersion::LATEST);
        resources.insert(CACHE_STORE.to_string(), ResourceSchemas { latest, by_version });
        tracing::debug!(types = resources.len(), "schema registry built");
        Self { provider: Schema { version: 0, block: Block::default() }, resources }
    }

    /// Schema of the provider's own configuration (empty).
    pub fn provider_schema(&self) -> &Schema { &self.provider }

    fn resource(&self, type_name: &str) -> Result<&ResourceSchemas, SchemaError> {
        self.resources.get(type_name).ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))
    }

    pub fn latest_schema(&self, type_name: &str) -> Result<&Schema, SchemaError> {
        Ok(&self.resource(type_name)?.latest)
    }

    pub fn schema_at_version(&self, type_name: &str, version: i64) -> Result<&Schema, SchemaError> {
        self.resource(type_name)?
            .by_version
            .get(&version)
            .ok_or_else(|| SchemaError::UnknownVersion { type_name: type_name.to_string(), version })
    }

    pub fn current_version(&self, type_name: &str) -> Result<i64, SchemaError> {
        Ok(self.resource(type_name)?.latest.version)
    }

    /// Type descriptor of the latest schema for `type_name`.
    pub fn resource_type(&self, type_name: &str) -> Result<Type, SchemaError> {
        Ok(type_of(self.latest_schema(type_name)?))
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.resources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
