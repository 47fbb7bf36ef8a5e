//! Per-intersection runtime state
//!
//! Owned and mutated only by the arbiter under the intersection's mutex.
//! External readers get a [`RuntimeSnapshot`] copy.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_secs;
use crate::ledger::ApplicationSource;
use crate::model::{GroupId, IntersectionId, PhaseNumber};
use signal_rules::RuleId;

/// Signal control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalMode {
    /// Regular cycling under rule-based timing
    Normal,
    /// Green-favored intersection of an active preemption
    EmergencyOverride,
    /// Held all-red while another group member is preempted
    RedHold,
}

impl SignalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalMode::Normal => "NORMAL",
            SignalMode::EmergencyOverride => "EMERGENCY_OVERRIDE",
            SignalMode::RedHold => "RED_HOLD",
        }
    }
}

/// Rule timing in force for the current cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedTiming {
    pub rule_id: Option<RuleId>,
    pub rule_name: Option<String>,
    /// Selector output before the phase clamp
    pub duration: u32,
    pub source: ApplicationSource,
    pub applied_at: NaiveDateTime,
}

/// Cycling position frozen while preempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Suspension {
    pub phase: PhaseNumber,
    pub elapsed_secs: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct IntersectionRuntime {
    pub current_phase: PhaseNumber,
    pub phase_started_at: NaiveDateTime,
    pub mode: SignalMode,
    /// Present only in `EmergencyOverride`
    pub active_emergency_vehicle_id: Option<String>,
    /// Vehicle that caused the red hold
    pub red_hold_vehicle_id: Option<String>,
    pub override_deadline: Option<NaiveDateTime>,
    pub suspension: Option<Suspension>,
    pub applied: Option<AppliedTiming>,
    /// Rule selection already ran for the current cycle
    pub timing_selected: bool,
    /// Last rule defect seen; cleared on the next good selection
    pub rule_fault: Option<String>,
    /// Sequencing defect; the intersection holds its phase while set
    pub sequence_fault: Option<String>,
    /// Pending calls for skippable phases
    pub demands: BTreeSet<PhaseNumber>,
}

impl IntersectionRuntime {
    pub fn new(initial_phase: PhaseNumber, now: NaiveDateTime) -> Self {
        Self {
            current_phase: initial_phase,
            phase_started_at: now,
            mode: SignalMode::Normal,
            active_emergency_vehicle_id: None,
            red_hold_vehicle_id: None,
            override_deadline: None,
            suspension: None,
            applied: None,
            timing_selected: false,
            rule_fault: None,
            sequence_fault: None,
            demands: BTreeSet::new(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.mode == SignalMode::Normal
    }

    pub fn elapsed(&self, now: NaiveDateTime) -> u32 {
        elapsed_secs(self.phase_started_at, now)
    }

    pub fn rule_duration(&self) -> Option<u32> {
        self.applied.as_ref().map(|a| a.duration)
    }

    /// Phase the cycle stands on, whether running or frozen by an override
    pub fn cycling_phase(&self) -> Option<PhaseNumber> {
        match (self.suspension, self.mode) {
            (Some(suspension), _) => Some(suspension.phase),
            (None, SignalMode::Normal) => Some(self.current_phase),
            (None, _) => None,
        }
    }

    /// Drop the cycle's rule timing so the next selection starts fresh
    pub fn reset_cycle_timing(&mut self) {
        self.applied = None;
        self.timing_selected = false;
    }

    /// Freeze cycling; a nested call keeps the first suspension
    pub fn suspend(&mut self, now: NaiveDateTime) {
        if self.suspension.is_none() {
            self.suspension = Some(Suspension {
                phase: self.current_phase,
                elapsed_secs: self.elapsed(now),
            });
        }
    }

    /// Suspend cycling and hold all-red for another member's override
    pub fn hold_red(&mut self, now: NaiveDateTime, vehicle_id: &str, deadline: NaiveDateTime) {
        self.suspend(now);
        self.mode = SignalMode::RedHold;
        self.phase_started_at = now;
        self.active_emergency_vehicle_id = None;
        self.red_hold_vehicle_id = Some(vehicle_id.to_string());
        self.override_deadline = Some(deadline);
    }

    /// Resume cycling where it stopped; override time is not counted
    pub fn resume(&mut self, now: NaiveDateTime) -> Option<Suspension> {
        let suspension = self.suspension.take()?;
        self.current_phase = suspension.phase;
        self.phase_started_at = now - chrono::TimeDelta::seconds(i64::from(suspension.elapsed_secs));
        self.mode = SignalMode::Normal;
        self.active_emergency_vehicle_id = None;
        self.red_hold_vehicle_id = None;
        self.override_deadline = None;
        Some(suspension)
    }
}

/// Read-only copy of an intersection's runtime state
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub intersection_id: IntersectionId,
    pub name: String,
    pub group: GroupId,
    pub mode: SignalMode,
    /// `None` while red-held (no phase is green)
    pub current_phase: Option<PhaseNumber>,
    pub phase_name: Option<String>,
    pub phase_elapsed_secs: u32,
    pub effective_duration: Option<u32>,
    pub active_emergency_vehicle_id: Option<String>,
    pub red_hold_vehicle_id: Option<String>,
    pub override_remaining_secs: Option<u32>,
    pub applied_rule: Option<AppliedTiming>,
    pub pending_demands: Vec<PhaseNumber>,
    pub fault: Option<String>,
}
