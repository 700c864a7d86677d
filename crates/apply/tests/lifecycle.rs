use std::sync::Arc;

use cachet_apply::{ApplyEngine, FixedClock, PlanAction, PlanEngine, ReplaceOnKeepersChange, UpgradeEngine};
use cachet_codec::{DynamicValue, StateCodec};
use cachet_core::{IntoDiagnostic, Type, Value};
use cachet_schema::{ProviderSchemas, CACHE_STORE};

struct Harness {
    schemas: ProviderSchemas,
    codec: StateCodec,
    ty: Type,
}

impl Harness {
    fn new() -> Self {
        let schemas = ProviderSchemas::new();
        let ty = schemas.resource_type(CACHE_STORE).unwrap();
        Self { schemas, codec: StateCodec::default(), ty }
    }

    fn enc(&self, v: &Value) -> DynamicValue { self.codec.encode(v, &self.ty).unwrap() }
    fn dec(&self, dv: &DynamicValue) -> Value { self.codec.decode(dv, &self.ty).unwrap() }
}

fn record(value: &str, timestamp: Value, keepers: Value) -> Value {
    Value::object([("value", Value::from(value)), ("timestamp", timestamp), ("keepers", keepers)])
}

#[test]
fn create_then_update_then_destroy() {
    let h = Harness::new();
    let plan = PlanEngine::new(h.codec.clone());
    let apply = ApplyEngine::with_clock(h.codec.clone(), Arc::new(FixedClock(1_700_000_000)));

    // create
    let proposed = h.enc(&record("abc", Value::Null, Value::Null));
    let empty_prior = h.enc(&Value::empty_map());
    let change = plan.plan(&h.schemas, CACHE_STORE, Some(&proposed), Some(&empty_prior)).unwrap();
    assert_eq!(change.action, PlanAction::Create);
    let planned = change.planned_state.unwrap();
    assert_eq!(h.dec(&planned), record("abc", Value::Unknown, Value::Null));

    let created = apply.apply(&h.schemas, CACHE_STORE, Some(&planned), None).unwrap().unwrap();
    assert_eq!(h.dec(&created), record("abc", Value::from("1700000000"), Value::Null));

    // update attempt changing value and keepers is a no-op
    let proposed = h.enc(&record("xyz", Value::from("1700000000"), Value::object([("k", Value::from("v"))])));
    let change = plan.plan(&h.schemas, CACHE_STORE, Some(&proposed), Some(&created)).unwrap();
    assert_eq!(change.action, PlanAction::NoOp);
    assert_eq!(change.planned_state.as_ref().map(|dv| h.dec(dv)), Some(h.dec(&created)));
    let kept = apply.apply(&h.schemas, CACHE_STORE, change.planned_state.as_ref(), Some(&created)).unwrap().unwrap();
    assert_eq!(h.dec(&kept), h.dec(&created));

    // destroy
    let change = plan.plan(&h.schemas, CACHE_STORE, None, Some(&created)).unwrap();
    assert_eq!(change.action, PlanAction::Destroy);
    assert!(change.planned_state.is_none());
    assert!(apply.apply(&h.schemas, CACHE_STORE, None, Some(&created)).unwrap().is_none());
}

#[test]
fn destroy_of_uncreated_record_is_rejected() {
    let h = Harness::new();
    let plan = PlanEngine::new(h.codec.clone());
    let prior = h.enc(&Value::object([("value", Value::from("abc")), ("timestamp", Value::Null)]));
    let err = plan.plan(&h.schemas, CACHE_STORE, None, Some(&prior)).unwrap_err();
    assert_eq!(err.to_diagnostic().summary, "Invalid prior state while planning for destroy");
}

#[test]
fn keepers_change_forces_replacement_under_replace_policy() {
    let h = Harness::new();
    let plan = PlanEngine::with_policy(h.codec.clone(), Box::new(ReplaceOnKeepersChange));
    let apply = ApplyEngine::with_clock(h.codec.clone(), Arc::new(FixedClock(1_800_000_000)));

    let prior = h.enc(&record("abc", Value::from("1700000000"), Value::object([("rev", Value::from(1i64))])));
    let proposed = h.enc(&record("abc", Value::from("1700000000"), Value::object([("rev", Value::from(2i64))])));
    let change = plan.plan(&h.schemas, CACHE_STORE, Some(&proposed), Some(&prior)).unwrap();
    assert_eq!(change.action, PlanAction::Replace);
    assert_eq!(change.requires_replace.len(), 1);

    let out = apply.apply(&h.schemas, CACHE_STORE, change.planned_state.as_ref(), Some(&prior)).unwrap().unwrap();
    assert_eq!(h.dec(&out), record("abc", Value::from("1800000000"), Value::object([("rev", Value::from(2i64))])));
}

#[test]
fn upgraded_v1_state_plans_as_a_no_op() {
    let h = Harness::new();
    let raw = DynamicValue::Json(br#"{"timestamp":"1600000000","value":"cached"}"#.to_vec());
    let upgraded = UpgradeEngine::new(h.codec.clone()).upgrade(&h.schemas, CACHE_STORE, &raw, 1).unwrap();
    assert_eq!(h.dec(&upgraded), record("cached", Value::from("1600000000"), Value::empty_map()));

    let plan = PlanEngine::with_policy(h.codec.clone(), Box::new(ReplaceOnKeepersChange));
    let proposed = h.enc(&record("cached", Value::from("1600000000"), Value::Null));
    let change = plan.plan(&h.schemas, CACHE_STORE, Some(&proposed), Some(&upgraded)).unwrap();
    assert_eq!(change.action, PlanAction::NoOp);
}
