//! Plan phase: decide what happens to a record and which state to persist as
//! the plan.
//!
//! - null proposal: destroy, allowed only once the prior record was created
//! - proposal without `timestamp`: create, with `timestamp` left unknown
//! - proposal with `timestamp`: update, delegated to an [`UpdatePolicy`]

use std::fmt;
use std::time::Instant;

use cachet_codec::{Attributes, DecodeError, DynamicValue, EncodeError, StateCodec, StringAttr};
use cachet_core::{AttributePath, IntoDiagnostic, Value};
use cachet_schema::attr::{KEEPERS, TIMESTAMP};
use cachet_schema::{ProviderSchemas, SchemaError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    NoOp,
    Replace,
    Destroy,
}

impl PlanAction {
    fn metric_name(self) -> &'static str {
        match self {
            PlanAction::Create => "plan_create_total",
            PlanAction::NoOp => "plan_update_total",
            PlanAction::Replace => "plan_replace_total",
            PlanAction::Destroy => "plan_destroy_total",
        }
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanAction::Create => "create",
            PlanAction::NoOp => "no-op",
            PlanAction::Replace => "replace",
            PlanAction::Destroy => "destroy",
        })
    }
}

/// Outcome of planning over decoded values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub action: PlanAction,
    /// `Value::Null` for a destroy.
    pub state: Value,
    pub requires_replace: Vec<AttributePath>,
}

impl Plan {
    fn keep(prior: &Value) -> Self {
        Plan { action: PlanAction::NoOp, state: prior.clone(), requires_replace: Vec::new() }
    }
}

/// Decides the plan for a record that already exists.
pub trait UpdatePolicy: Send + Sync + fmt::Debug {
    fn plan_update(&self, proposed: &Value, prior: &Value) -> Plan;
}

/// Updates never change anything: the prior state is the plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepPrior;

impl UpdatePolicy for KeepPrior {
    fn plan_update(&self, _proposed: &Value, prior: &Value) -> Plan { Plan::keep(prior) }
}

/// Recreate the record when `keepers` changed; otherwise behave like [`KeepPrior`].
///
/// Null and empty `keepers` compare equal, so a record upgraded from a
/// schema without keepers is not recreated on its first plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceOnKeepersChange;

impl UpdatePolicy for ReplaceOnKeepersChange {
    fn plan_update(&self, proposed: &Value, prior: &Value) -> Plan {
        if same_keepers(proposed, prior) {
            return Plan::keep(prior);
        }
        let mut state = proposed.clone();
        if let Value::Map(m) = &mut state {
            m.insert(TIMESTAMP.to_string(), Value::Unknown);
        }
        Plan { action: PlanAction::Replace, state, requires_replace: vec![AttributePath::root(KEEPERS)] }
    }
}

fn same_keepers(a: &Value, b: &Value) -> bool {
    fn norm(v: &Value) -> Option<&Value> {
        match v.get(KEEPERS) {
            None | Some(Value::Null) => None,
            Some(Value::Map(m)) if m.is_empty() => None,
            other => other,
        }
    }
    norm(a) == norm(b)
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    ResourceType(#[from] SchemaError),
    #[error("proposed state: {0}")]
    DecodeProposed(DecodeError),
    #[error("prior state: {0}")]
    DecodePrior(DecodeError),
    #[error("prior state has no timestamp; the record was never fully created")]
    InvalidPriorState,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl IntoDiagnostic for PlanError {
    fn summary(&self) -> &'static str {
        match self {
            PlanError::ResourceType(_) => "Failed to determine planned resource type",
            PlanError::DecodeProposed(_) => "Failed to unmarshal planned resource state",
            PlanError::DecodePrior(_) => "Failed to unmarshal prior resource state",
            PlanError::InvalidPriorState => "Invalid prior state while planning for destroy",
            PlanError::Encode(_) => "Failed to assemble proposed state during plan",
        }
    }

    fn attribute(&self) -> Option<AttributePath> {
        match self {
            PlanError::ResourceType(_) => None,
            PlanError::DecodeProposed(e) | PlanError::DecodePrior(e) => e.path(),
            PlanError::InvalidPriorState => Some(AttributePath::root(TIMESTAMP)),
            PlanError::Encode(e) => e.path(),
        }
    }
}

/// Plan over decoded values. `Value::Null` stands for "no state".
///
/// An absent `timestamp` and an explicit null one mean the same thing.
pub fn plan_values(proposed: &Value, prior: &Value, policy: &dyn UpdatePolicy) -> Result<Plan, PlanError> {
    if proposed.is_null() {
        let created = Attributes::from_value(prior.clone())
            .map(|a| matches!(a.string_attr(TIMESTAMP), Ok(StringAttr::Known(_) | StringAttr::Unknown)))
            .unwrap_or(false);
        if !created {
            return Err(PlanError::InvalidPriorState);
        }
        return Ok(Plan { action: PlanAction::Destroy, state: Value::Null, requires_replace: Vec::new() });
    }

    let mut attrs = Attributes::from_value(proposed.clone()).map_err(PlanError::DecodeProposed)?;
    let creating = matches!(attrs.string_attr(TIMESTAMP).map_err(PlanError::DecodeProposed)?, StringAttr::Null);
    if creating {
        attrs.set(TIMESTAMP, Value::Unknown);
        return Ok(Plan { action: PlanAction::Create, state: attrs.into_value(), requires_replace: Vec::new() });
    }
    Ok(policy.plan_update(proposed, prior))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Count attribute-level differences of `target` against `base`.
///
/// Inside objects and maps a null entry counts as absent.
pub fn diff_summary(target: &Value, base: &Value) -> DiffSummary {
    fn present(v: Option<&Value>) -> Option<&Value> { v.filter(|v| !v.is_null()) }
    fn walk(a: &Value, b: &Value, s: &mut DiffSummary) {
        match (a, b) {
            (Value::Map(am), Value::Map(bm)) => {
                for (k, av) in am {
                    match (present(Some(av)), present(bm.get(k))) {
                        (Some(av), Some(bv)) if av != bv => walk(av, bv, s),
                        (Some(_), None) => s.adds += 1,
                        (None, Some(_)) => s.removes += 1,
                        _ => {}
                    }
                }
                for (k, bv) in bm {
                    if !am.contains_key(k) && !bv.is_null() { s.removes += 1; }
                }
            }
            (Value::List(al), Value::List(bl)) => {
                let common = al.len().min(bl.len());
                s.updates += al.iter().zip(bl).take(common).filter(|(x, y)| x != y).count();
                if al.len() > bl.len() { s.adds += al.len() - bl.len(); }
                if bl.len() > al.len() { s.removes += bl.len() - al.len(); }
            }
            (Value::Null, Value::Map(bm)) => s.removes += bm.values().filter(|v| !v.is_null()).count(),
            (Value::Map(am), Value::Null) => s.adds += am.values().filter(|v| !v.is_null()).count(),
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Encoded plan returned at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub action: PlanAction,
    /// `None` when the record is to be destroyed.
    pub planned_state: Option<DynamicValue>,
    pub requires_replace: Vec<AttributePath>,
    pub summary: DiffSummary,
}

#[derive(Debug)]
pub struct PlanEngine {
    codec: StateCodec,
    policy: Box<dyn UpdatePolicy>,
}

impl PlanEngine {
    pub fn new(codec: StateCodec) -> Self { Self::with_policy(codec, Box::new(KeepPrior)) }

    pub fn with_policy(codec: StateCodec, policy: Box<dyn UpdatePolicy>) -> Self { Self { codec, policy } }

    pub fn plan(
        &self,
        schemas: &ProviderSchemas,
        type_name: &str,
        proposed: Option<&DynamicValue>,
        prior: Option<&DynamicValue>,
    ) -> Result<PlannedChange, PlanError> {
        let t0 = Instant::now();
        let ty = schemas.resource_type(type_name)?;
        let proposed = self.codec.decode_opt(proposed, &ty).map_err(PlanError::DecodeProposed)?;
        let prior = self.codec.decode_opt(prior, &ty).map_err(PlanError::DecodePrior)?;

        let plan = plan_values(&proposed, &prior, self.policy.as_ref())?;
        let summary = diff_summary(&plan.state, &prior);
        let planned_state = if plan.state.is_null() { None } else { Some(self.codec.encode(&plan.state, &ty)?) };

        counter!("plan_total", 1u64);
        counter!(plan.action.metric_name(), 1u64);
        histogram!("plan_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(
            type_name,
            action = %plan.action,
            adds = summary.adds,
            updates = summary.updates,
            removes = summary.removes,
            "plan ready"
        );
        Ok(PlannedChange { action: plan.action, planned_state, requires_replace: plan.requires_replace, summary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_schema::CACHE_STORE;

    fn record(value: Value, timestamp: Value, keepers: Value) -> Value {
        Value::object([("value", value), ("timestamp", timestamp), ("keepers", keepers)])
    }

    #[test]
    fn create_marks_timestamp_unknown() {
        let proposed = record(Value::from("abc"), Value::Null, Value::Null);
        let plan = plan_values(&proposed, &Value::Null, &KeepPrior).unwrap();
        assert_eq!(plan.action, PlanAction::Create);
        assert_eq!(plan.state, record(Value::from("abc"), Value::Unknown, Value::Null));
    }

    #[test]
    fn absent_timestamp_is_a_create_too() {
        let proposed = Value::object([("value", Value::from("abc"))]);
        let plan = plan_values(&proposed, &Value::empty_map(), &KeepPrior).unwrap();
        assert_eq!(plan.action, PlanAction::Create);
        assert_eq!(plan.state.get("timestamp"), Some(&Value::Unknown));
    }

    #[test]
    fn update_returns_prior_verbatim() {
        let proposed = record(Value::from("abc"), Value::from("1700000000"), Value::object([("k", Value::from("v"))]));
        let prior = record(Value::from("xyz"), Value::from("1700000000"), Value::empty_map());
        let plan = plan_values(&proposed, &prior, &KeepPrior).unwrap();
        assert_eq!(plan, Plan { action: PlanAction::NoOp, state: prior, requires_replace: vec![] });
    }

    #[test]
    fn destroy_requires_created_prior() {
        let prior = record(Value::from("abc"), Value::Null, Value::Null);
        let err = plan_values(&Value::Null, &prior, &KeepPrior).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPriorState));
        let d = err.to_diagnostic();
        assert_eq!(d.summary, "Invalid prior state while planning for destroy");
        assert_eq!(d.attribute, Some(AttributePath::root("timestamp")));

        assert!(plan_values(&Value::Null, &Value::Null, &KeepPrior).is_err());
        assert!(plan_values(&Value::Null, &Value::empty_map(), &KeepPrior).is_err());

        let created = record(Value::from("abc"), Value::from("1"), Value::Null);
        let plan = plan_values(&Value::Null, &created, &KeepPrior).unwrap();
        assert_eq!(plan.action, PlanAction::Destroy);
        assert!(plan.state.is_null());
    }

    #[test]
    fn replace_policy_recreates_on_keepers_change() {
        let prior = record(Value::from("xyz"), Value::from("1"), Value::object([("rev", Value::from(1i64))]));
        let proposed = record(Value::from("abc"), Value::from("1"), Value::object([("rev", Value::from(2i64))]));
        let plan = plan_values(&proposed, &prior, &ReplaceOnKeepersChange).unwrap();
        assert_eq!(plan.action, PlanAction::Replace);
        assert_eq!(plan.requires_replace, vec![AttributePath::root("keepers")]);
        assert_eq!(plan.state.get("timestamp"), Some(&Value::Unknown));
        assert_eq!(plan.state.get("value"), Some(&Value::from("abc")));
    }

    #[test]
    fn replace_policy_treats_null_and_empty_keepers_alike() {
        let prior = record(Value::from("xyz"), Value::from("1"), Value::empty_map());
        let proposed = record(Value::from("abc"), Value::from("1"), Value::Null);
        let plan = plan_values(&proposed, &prior, &ReplaceOnKeepersChange).unwrap();
        assert_eq!(plan.action, PlanAction::NoOp);
        assert_eq!(plan.state, prior);
    }

    #[test]
    fn diff_summary_counts_attribute_changes() {
        let base = record(Value::from("xyz"), Value::from("1"), Value::Null);
        let target = record(Value::from("abc"), Value::Null, Value::object([("k", Value::from("v"))]));
        assert_eq!(diff_summary(&target, &base), DiffSummary { adds: 1, updates: 1, removes: 1 });
        assert_eq!(diff_summary(&Value::Null, &base), DiffSummary { adds: 0, updates: 0, removes: 2 });
        assert_eq!(diff_summary(&base, &Value::Null), DiffSummary { adds: 2, updates: 0, removes: 0 });
    }

    #[test]
    fn engine_round_trips_through_the_codec() {
        let schemas = ProviderSchemas::new();
        let codec = StateCodec::default();
        let ty = schemas.resource_type(CACHE_STORE).unwrap();
        let proposed = codec.encode(&record(Value::from("abc"), Value::Null, Value::Null), &ty).unwrap();

        let engine = PlanEngine::new(codec.clone());
        let change = engine.plan(&schemas, CACHE_STORE, Some(&proposed), None).unwrap();
        assert_eq!(change.action, PlanAction::Create);
        let planned = codec.decode(change.planned_state.as_ref().unwrap(), &ty).unwrap();
        assert_eq!(planned, record(Value::from("abc"), Value::Unknown, Value::Null));

        let err = engine.plan(&schemas, "cache_fetch", Some(&proposed), None).unwrap_err();
        assert_eq!(err.to_diagnostic().summary, "Failed to determine planned resource type");
    }

    #[test]
    fn engine_reports_undecodable_prior() {
        let schemas = ProviderSchemas::new();
        let engine = PlanEngine::new(StateCodec::default());
        let prior = DynamicValue::Json(br#"{"value": "x", "timestamp": 7}"#.to_vec());
        let err = engine.plan(&schemas, CACHE_STORE, None, Some(&prior)).unwrap_err();
        let d = err.to_diagnostic();
        assert_eq!(d.summary, "Failed to unmarshal prior resource state");
        assert_eq!(d.attribute, Some(AttributePath::root("timestamp")));
    }
}
