//! Signal Arbiter - Traffic-Signal Arbitration Core
//!
//! Reconciles three authorities over each intersection's signal phases:
//! - Phase sequencing (fixed cycle, skip-on-no-demand, conflict metadata)
//! - Rule-based adaptive timing (via `signal-rules`)
//! - Emergency-vehicle preemption (group override, queued requests, reversion)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐ counts ┌──────────────────────────────────────────┐
//! │ Supervisor    │───────▶│ Arbiter                                  │
//! │ (tick tasks,  │ tick   │  ├─ RuleStore snapshot ─▶ select_rule    │
//! │  timers)      │───────▶│  ├─ PhasePlan (ArcSwap) ─▶ next_phase    │
//! └───────────────┘        │  ├─ per-group preemption + queue         │
//!        ▲ expire_override │  └─ per-intersection runtime (Mutex)     │
//!        └─────────────────┤                                          │
//!                          └──────────────────┬───────────────────────┘
//!                                             │ append
//!                                             ▼
//!                                       ┌──────────────┐
//!                                       │ EventLedger  │──▶ LedgerSink
//!                                       └──────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Effective durations always lie within the phase's own `[min, max]`
//! - At most one override per coordination group; other members red-held
//! - Every override reverts exactly once (clear, timer or tick)
//! - Rule defects fall back to default timing; cycling never halts on them
//! - Corrupt sequencing data holds the last safe phase

pub mod arbiter;
pub mod clock;
mod error;
pub mod ledger;
pub mod model;
pub mod preemption;
pub mod runtime;
pub mod sequencer;
pub mod supervisor;

// Re-export public API
pub use arbiter::{
    Arbiter, ArbiterSettings, OptimizationOutcome, OptimizationRequest, PerformanceMetrics,
    TickOutcome, DEFAULT_OVERRIDE_DURATION_SECS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ArbiterError, Result};
pub use ledger::{
    ApplicationSource, AppliedRuleRecord, EmergencyEvent, EmergencyEventType, EventFilter,
    EventLedger, JsonLinesSink, LedgerEntry, LedgerEvent, LedgerSink, PhaseTransitionEvent,
    TransitionTrigger,
};
pub use model::{
    Direction, GroupId, Intersection, IntersectionConfig, IntersectionId, Phase, PhaseNumber,
    VehicleType,
};
pub use preemption::{
    Activation, AffectedIntersection, ClearOutcome, EmergencyDisposition, EmergencyOutcome,
    EmergencyRequest, EmergencyStatus, EmergencyVehicle, ImpactSummary, RestoredPhase, Reversion,
    ReversionCause, TimeInfo,
};
pub use runtime::{AppliedTiming, RuntimeSnapshot, SignalMode};
pub use sequencer::{Advance, PhasePlan};
pub use supervisor::{ArbiterSupervisor, DEFAULT_TICK_INTERVAL};
