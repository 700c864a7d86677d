//! Cachet engines (plan / apply / upgrade) over `cache_store` records.
//!
//! Every engine is a synchronous, in-memory transformation: bytes in, bytes
//! (or null) out, with failures reported as typed errors the boundary turns
//! into diagnostics.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

pub mod apply;
pub mod plan;
pub mod upgrade;

pub use apply::{ApplyEngine, ApplyError};
pub use plan::{
    diff_summary, plan_values, DiffSummary, KeepPrior, Plan, PlanAction, PlanEngine, PlanError, PlannedChange,
    ReplaceOnKeepersChange, UpdatePolicy,
};
pub use upgrade::{upgrade_value, UpgradeEngine, UpgradeError};

/// Source of wall-clock time for computed attributes.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Seconds since the unix epoch.
    fn now_unix(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 { chrono::Utc::now().timestamp() }
}

/// Clock pinned to one instant, for tests and reproducible runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 { self.0 }
}

pub fn system_clock() -> Arc<dyn Clock> { Arc::new(SystemClock) }
