//! Signal Rules - Adaptive Timing Rule Library
//!
//! Rule-based green-duration selection for the signal arbiter:
//! - Versioned, prioritized rule store with lock-free snapshot reads
//! - Applicability predicate (vehicle count, time-of-day window, day type)
//! - Deterministic selection (ascending priority, stable on insertion order)
//! - Two-stage duration clamp (rule bounds, then the global safety band)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  snapshot  ┌──────────────┐  RuleSelection  ┌─────────────┐
//! │  RuleStore  │──────────▶│ select_rule  │───────────────▶│   Arbiter   │
//! │ (ArcSwap)   │            │   (pure)     │                 │  (caller)   │
//! └─────────────┘            └──────────────┘                 └─────────────┘
//! ```
//!
//! Selection has no side effects. The caller records the application and
//! derives `timesApplied` from its own ledger.

mod error;
pub mod selector;
mod store;
pub mod types;

// Re-export public API
pub use error::{Result, RuleError};
pub use selector::{
    applicable_rules, compute_duration, density_level, select_manual, select_rule, DensityBoost,
    DensityLevel, RuleCandidate, RuleSelection, SelectorConfig,
};
pub use store::{default_rules, RuleSet, RuleStore};
pub use types::{DayType, RuleAction, RuleCondition, RuleId, RuleType, TrafficRule};
