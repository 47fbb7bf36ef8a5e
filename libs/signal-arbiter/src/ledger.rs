//! Event Ledger - append-only audit log
//!
//! Records every phase transition, rule application and emergency event.
//! Appends are serialized by a short write lock that only assigns the sequence
//! number and pushes; export sinks run after the lock is released.
//!
//! ```text
//! Arbiter ──append──▶ EventLedger ──▶ Vec<LedgerEntry> (seq-ordered)
//!                          │
//!                          └──▶ LedgerSink* (JSON lines, ...)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::model::{IntersectionId, PhaseNumber};
use signal_rules::RuleId;

// ============================================================================
// Events
// ============================================================================

/// What caused a phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionTrigger {
    Startup,
    Cycle,
    /// Stepped together with a conflicting group member
    Coordination,
    EmergencyOverride,
    RedHold,
    Reversion,
    PlanReload,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTransitionEvent {
    pub intersection_id: IntersectionId,
    pub previous_phase: Option<PhaseNumber>,
    /// `None` when the intersection went all-red
    pub new_phase: Option<PhaseNumber>,
    /// Effective duration of the new phase (or hold length)
    pub duration: u32,
    pub trigger: TransitionTrigger,
    pub success: bool,
    pub reason: String,
}

/// Where a rule application came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSource {
    Tick,
    Optimization,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRuleRecord {
    pub intersection_id: IntersectionId,
    pub rule_id: Option<RuleId>,
    pub rule_name: Option<String>,
    pub vehicle_count: u32,
    pub previous_duration: u32,
    /// Effective duration after the phase clamp
    pub new_duration: u32,
    /// Selector output before the phase clamp
    pub rule_duration: Option<u32>,
    pub source: ApplicationSource,
    pub success: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyEventType {
    EmergencyDetected,
    EmergencyQueued,
    GreenLightActivated,
    RedLightActivated,
    EmergencyCleared,
    NormalOperationResumed,
    EmergencyCancelled,
}

impl EmergencyEventType {
    pub const ALL: [EmergencyEventType; 7] = [
        EmergencyEventType::EmergencyDetected,
        EmergencyEventType::EmergencyQueued,
        EmergencyEventType::GreenLightActivated,
        EmergencyEventType::RedLightActivated,
        EmergencyEventType::EmergencyCleared,
        EmergencyEventType::NormalOperationResumed,
        EmergencyEventType::EmergencyCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyEventType::EmergencyDetected => "EMERGENCY_DETECTED",
            EmergencyEventType::EmergencyQueued => "EMERGENCY_QUEUED",
            EmergencyEventType::GreenLightActivated => "GREEN_LIGHT_ACTIVATED",
            EmergencyEventType::RedLightActivated => "RED_LIGHT_ACTIVATED",
            EmergencyEventType::EmergencyCleared => "EMERGENCY_CLEARED",
            EmergencyEventType::NormalOperationResumed => "NORMAL_OPERATION_RESUMED",
            EmergencyEventType::EmergencyCancelled => "EMERGENCY_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyEvent {
    pub vehicle_id: String,
    pub intersection_id: IntersectionId,
    pub event_type: EmergencyEventType,
    pub description: String,
    pub previous_phase: Option<PhaseNumber>,
    pub new_phase: Option<PhaseNumber>,
    pub duration: Option<u32>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    PhaseTransition(PhaseTransitionEvent),
    RuleApplied(AppliedRuleRecord),
    Emergency(EmergencyEvent),
}

impl LedgerEvent {
    pub fn intersection_id(&self) -> IntersectionId {
        match self {
            LedgerEvent::PhaseTransition(e) => e.intersection_id,
            LedgerEvent::RuleApplied(e) => e.intersection_id,
            LedgerEvent::Emergency(e) => e.intersection_id,
        }
    }

    pub fn vehicle_id(&self) -> Option<&str> {
        match self {
            LedgerEvent::Emergency(e) => Some(&e.vehicle_id),
            _ => None,
        }
    }
}

/// Sequenced ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// Strictly increasing, gap-free, starting at 1
    pub seq: u64,
    pub recorded_at: NaiveDateTime,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

/// Selects entries for [`EventLedger::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Intersection(IntersectionId),
    Vehicle(String),
    All,
}

impl EventFilter {
    fn matches(&self, event: &LedgerEvent) -> bool {
        match self {
            EventFilter::Intersection(id) => event.intersection_id() == *id,
            EventFilter::Vehicle(vehicle) => event.vehicle_id() == Some(vehicle.as_str()),
            EventFilter::All => true,
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives every appended entry, in sequence order per appender
pub trait LedgerSink: Send + Sync {
    fn write(&self, entry: &LedgerEntry) -> Result<()>;
}

/// Appends one JSON object per line to a file
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerSink for JsonLinesSink {
    fn write(&self, entry: &LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.lock().write_all(&line)?;
        Ok(())
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Default)]
pub struct EventLedger {
    entries: RwLock<Vec<LedgerEntry>>,
    sinks: RwLock<Vec<Arc<dyn LedgerSink>>>,
}

impl EventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn LedgerSink>) {
        self.sinks.write().push(sink);
    }

    /// Append an event and return its sequence number
    pub fn append(&self, recorded_at: NaiveDateTime, event: LedgerEvent) -> u64 {
        let entry = {
            let mut entries = self.entries.write();
            let entry = LedgerEntry {
                seq: entries.len() as u64 + 1,
                recorded_at,
                event,
            };
            entries.push(entry.clone());
            entry
        };

        for sink in self.sinks.read().iter() {
            if let Err(e) = sink.write(&entry) {
                warn!("Ledger sink write failed (seq {}): {}", entry.seq, e);
            }
        }
        entry.seq
    }

    /// Matching entries in sequence order; `since` is inclusive
    pub fn list(&self, filter: &EventFilter, since: Option<NaiveDateTime>) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| since.map_or(true, |since| e.recorded_at >= since))
            .filter(|e| filter.matches(&e.event))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Successful applications of a rule
    pub fn times_applied(&self, rule_id: RuleId) -> u64 {
        self.entries
            .read()
            .iter()
            .filter(|e| {
                matches!(
                    &e.event,
                    LedgerEvent::RuleApplied(r) if r.success && r.rule_id == Some(rule_id)
                )
            })
            .count() as u64
    }
}
