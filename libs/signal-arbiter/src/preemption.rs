//! Preemption Controller - emergency override and reversion
//!
//! One override per coordination group at a time. The target intersection
//! goes green on the phase serving the vehicle's approach; every other member
//! is red-held. Competing requests queue by `(priority_level, detected_at)`
//! and are promoted when the running override reverts.
//!
//! ```text
//!   DETECTED ──activate──▶ IN_PROGRESS ──clear / timeout──▶ CLEARED
//!      │                                                      ▲
//!      ├──────────────────────clear (queued)──────────────────┘
//!      └──shutdown──▶ CANCELLED
//! ```
//!
//! Every activation gets a fresh epoch. Reversion consumes the active
//! override under the group lock, so a timer firing with a stale epoch is a
//! no-op and a clear racing the timer reverts exactly once.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeDelta};
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arbiter::{Arbiter, GroupSlot, IntersectionSlot};
use crate::error::{ArbiterError, Result};
use crate::ledger::{
    EmergencyEvent, EmergencyEventType, LedgerEvent, PhaseTransitionEvent, TransitionTrigger,
};
use crate::model::{Direction, GroupId, IntersectionId, PhaseNumber, VehicleType};
use crate::runtime::{IntersectionRuntime, SignalMode};

/// Lowest accepted explicit priority level
pub const MAX_PRIORITY_LEVEL: u8 = 5;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyStatus {
    Detected,
    InProgress,
    Cleared,
    Cancelled,
}

impl EmergencyStatus {
    /// Still able to hold or claim control
    pub fn is_open(&self) -> bool {
        matches!(self, EmergencyStatus::Detected | EmergencyStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyStatus::Detected => "DETECTED",
            EmergencyStatus::InProgress => "IN_PROGRESS",
            EmergencyStatus::Cleared => "CLEARED",
            EmergencyStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Input for [`Arbiter::trigger_emergency`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub vehicle_id: String,
    pub vehicle_type: VehicleType,
    pub intersection_id: IntersectionId,
    pub direction: Direction,
    #[serde(default)]
    pub notes: Option<String>,
    /// Overrides the vehicle-type priority (1 = highest)
    #[serde(default)]
    pub priority_level: Option<u8>,
}

/// Emergency vehicle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyVehicle {
    pub vehicle_id: String,
    pub vehicle_type: VehicleType,
    pub intersection_id: IntersectionId,
    pub direction: Direction,
    pub notes: Option<String>,
    pub priority_level: u8,
    pub status: EmergencyStatus,
    pub group: GroupId,
    pub detected_at: NaiveDateTime,
    pub activated_at: Option<NaiveDateTime>,
    pub resolved_at: Option<NaiveDateTime>,
    /// Override epoch while (or after) in progress
    pub epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyDisposition {
    Activated,
    /// Waiting behind the running override; position 1 is next
    Queued { position: usize },
    /// Same vehicle already open; returned as-is
    AlreadyActive,
}

/// Effect of an override on one intersection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffectedIntersection {
    pub intersection_id: IntersectionId,
    pub name: String,
    pub mode: SignalMode,
    /// Phase held green (target only)
    pub green_phase: Option<PhaseNumber>,
    pub previous_phase: PhaseNumber,
    pub hold_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpactSummary {
    pub affected_count: usize,
    /// Red-hold seconds summed over held intersections
    pub total_wait_secs: u32,
    pub green_intersection: Option<IntersectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeInfo {
    pub detected_at: NaiveDateTime,
    pub override_secs: u32,
    /// Known once the override is active
    pub resume_normal_at: Option<NaiveDateTime>,
}

/// A started override; the caller arms a reversion timer for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub vehicle_id: String,
    pub group: GroupId,
    pub epoch: u64,
    pub deadline: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyOutcome {
    pub vehicle: EmergencyVehicle,
    pub disposition: EmergencyDisposition,
    pub affected_intersections: Vec<AffectedIntersection>,
    pub impact: ImpactSummary,
    pub time_info: TimeInfo,
    /// What was done, one line per step
    pub actions: Vec<String>,
    pub activation: Option<Activation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReversionCause {
    Cleared,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredPhase {
    pub intersection_id: IntersectionId,
    pub phase: PhaseNumber,
    /// Elapsed seconds carried over from before the override
    pub elapsed_secs: u32,
}

/// Result of ending an override
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reversion {
    pub vehicle_id: String,
    pub group: GroupId,
    pub epoch: u64,
    pub cause: ReversionCause,
    pub reverted_at: NaiveDateTime,
    pub restored: Vec<RestoredPhase>,
    /// Queued request promoted right after reversion
    pub next_activation: Option<Activation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClearOutcome {
    Cleared {
        vehicle_id: String,
        message: String,
        reversion: Option<Reversion>,
    },
    /// Already resolved; nothing changed
    NotActive {
        vehicle_id: String,
        status: EmergencyStatus,
    },
}

impl ClearOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ClearOutcome::Cleared { .. })
    }
}

// ============================================================================
// Group state
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct ActiveOverride {
    pub vehicle_id: String,
    pub epoch: u64,
    pub deadline: NaiveDateTime,
}

/// Queue key: (priority_level, detected_at, arrival)
type QueueKey = (u8, NaiveDateTime, u64);

#[derive(Debug, Default)]
pub(crate) struct GroupPreemption {
    pub active: Option<ActiveOverride>,
    pub queue: BTreeMap<QueueKey, String>,
}

impl GroupPreemption {
    fn position_of(&self, vehicle_id: &str) -> Option<usize> {
        self.queue
            .values()
            .position(|v| v == vehicle_id)
            .map(|i| i + 1)
    }

    fn dequeue(&mut self, vehicle_id: &str) -> bool {
        let key = self
            .queue
            .iter()
            .find(|(_, v)| v.as_str() == vehicle_id)
            .map(|(k, _)| *k);
        key.and_then(|k| self.queue.remove(&k)).is_some()
    }
}

// ============================================================================
// Operations
// ============================================================================

impl Arbiter {
    /// Detect an emergency vehicle and activate or queue its override
    pub fn trigger_emergency(&self, request: EmergencyRequest) -> Result<EmergencyOutcome> {
        let vehicle_id = request.vehicle_id.trim().to_string();
        if vehicle_id.is_empty() {
            return Err(ArbiterError::validation("vehicle_id must not be empty"));
        }
        if let Some(level) = request.priority_level {
            if level == 0 || level > MAX_PRIORITY_LEVEL {
                return Err(ArbiterError::validation(format!(
                    "priority_level must be within 1..={}, got {}",
                    MAX_PRIORITY_LEVEL, level
                )));
            }
        }

        let slot = self.slot(request.intersection_id)?;
        let group = self.group(&slot.group)?;
        let mut preemption = group.preemption.lock();
        let now = self.now();
        let override_secs = self.settings.override_duration_secs;

        if let Some(existing) = self.emergency(&vehicle_id) {
            if existing.status.is_open() {
                debug!("Emergency {} already {}", vehicle_id, existing.status.as_str());
                let resume_normal_at = preemption
                    .active
                    .as_ref()
                    .filter(|a| a.vehicle_id == vehicle_id)
                    .map(|a| a.deadline);
                let action = format!(
                    "{} already {}; nothing changed",
                    vehicle_id,
                    existing.status.as_str()
                );
                return Ok(EmergencyOutcome {
                    time_info: TimeInfo {
                        detected_at: existing.detected_at,
                        override_secs,
                        resume_normal_at,
                    },
                    vehicle: existing,
                    disposition: EmergencyDisposition::AlreadyActive,
                    affected_intersections: Vec::new(),
                    actions: vec![action],
                    impact: ImpactSummary {
                        affected_count: 0,
                        total_wait_secs: 0,
                        green_intersection: None,
                    },
                    activation: None,
                });
            }
        }

        let priority_level = request
            .priority_level
            .unwrap_or_else(|| request.vehicle_type.priority_level());
        let vehicle = EmergencyVehicle {
            vehicle_id: vehicle_id.clone(),
            vehicle_type: request.vehicle_type,
            intersection_id: request.intersection_id,
            direction: request.direction,
            notes: request.notes.clone(),
            priority_level,
            status: EmergencyStatus::Detected,
            group: group.id.clone(),
            detected_at: now,
            activated_at: None,
            resolved_at: None,
            epoch: None,
        };
        self.emergencies.insert(vehicle_id.clone(), vehicle.clone());
        self.record_emergency(
            now,
            &vehicle,
            EmergencyEventType::EmergencyDetected,
            format!(
                "{} {} approaching from {}{}",
                vehicle.vehicle_type,
                vehicle_id,
                vehicle.direction,
                request
                    .notes
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            ),
            (None, None, None),
        );

        if preemption.active.is_none() {
            let (activation, affected) =
                self.activate_locked(&group, &mut preemption, &vehicle_id, now)?;
            let vehicle = self.emergency(&vehicle_id).unwrap_or(vehicle);
            return Ok(EmergencyOutcome {
                impact: summarize(&affected),
                time_info: TimeInfo {
                    detected_at: now,
                    override_secs,
                    resume_normal_at: Some(activation.deadline),
                },
                vehicle,
                disposition: EmergencyDisposition::Activated,
                actions: describe_actions(&affected),
                affected_intersections: affected,
                activation: Some(activation),
            });
        }

        let key = (priority_level, now, self.next_queue_seq());
        preemption.queue.insert(key, vehicle_id.clone());
        let position = preemption.position_of(&vehicle_id).unwrap_or(preemption.queue.len());
        let holder = preemption
            .active
            .as_ref()
            .map(|a| a.vehicle_id.clone())
            .unwrap_or_default();
        self.record_emergency(
            now,
            &vehicle,
            EmergencyEventType::EmergencyQueued,
            format!(
                "group {} held by {}; queued at position {}",
                group.id, holder, position
            ),
            (None, None, None),
        );
        info!(
            "Emergency {} queued in group {} at position {} (held by {})",
            vehicle_id, group.id, position, holder
        );

        Ok(EmergencyOutcome {
            vehicle,
            disposition: EmergencyDisposition::Queued { position },
            affected_intersections: Vec::new(),
            actions: vec![format!(
                "Queued at position {} behind {} in group {}",
                position, holder, group.id
            )],
            impact: ImpactSummary {
                affected_count: 0,
                total_wait_secs: 0,
                green_intersection: None,
            },
            time_info: TimeInfo {
                detected_at: now,
                override_secs,
                resume_normal_at: None,
            },
            activation: None,
        })
    }

    /// End the override of `vehicle_id` now, or drop it from the queue
    ///
    /// Idempotent: a resolved vehicle yields [`ClearOutcome::NotActive`].
    pub fn clear_emergency(&self, vehicle_id: &str) -> Result<ClearOutcome> {
        let vehicle = self
            .emergency(vehicle_id)
            .ok_or_else(|| ArbiterError::not_found(format!("emergency vehicle {}", vehicle_id)))?;
        if !vehicle.status.is_open() {
            return Ok(ClearOutcome::NotActive {
                vehicle_id: vehicle_id.to_string(),
                status: vehicle.status,
            });
        }
        let group = self.group(&vehicle.group)?;

        let mut last_error = None;
        for attempt in 0..2 {
            let mut preemption = group.preemption.lock();
            let now = self.now();
            // Re-read under the group lock; a timer may have resolved it
            let Some(current) = self.emergency(vehicle_id) else {
                return Err(ArbiterError::not_found(format!(
                    "emergency vehicle {}",
                    vehicle_id
                )));
            };

            match current.status {
                EmergencyStatus::Cleared | EmergencyStatus::Cancelled => {
                    return Ok(ClearOutcome::NotActive {
                        vehicle_id: vehicle_id.to_string(),
                        status: current.status,
                    });
                },
                EmergencyStatus::Detected => {
                    preemption.dequeue(vehicle_id);
                    let cleared = self.resolve(vehicle_id, EmergencyStatus::Cleared, now);
                    if let Some(cleared) = cleared {
                        self.record_emergency(
                            now,
                            &cleared,
                            EmergencyEventType::EmergencyCleared,
                            "cleared before activation".to_string(),
                            (None, None, None),
                        );
                    }
                    info!("Queued emergency {} cleared", vehicle_id);
                    return Ok(ClearOutcome::Cleared {
                        vehicle_id: vehicle_id.to_string(),
                        message: format!("Queued emergency {} cleared", vehicle_id),
                        reversion: None,
                    });
                },
                EmergencyStatus::InProgress => {
                    let owns = preemption
                        .active
                        .as_ref()
                        .is_some_and(|a| a.vehicle_id == vehicle_id);
                    if owns {
                        let reversion =
                            self.revert_locked(&group, &mut preemption, now, ReversionCause::Cleared)?;
                        return Ok(ClearOutcome::Cleared {
                            vehicle_id: vehicle_id.to_string(),
                            message: format!(
                                "Emergency {} cleared; {} intersection(s) resumed normal operation",
                                vehicle_id,
                                reversion.restored.len()
                            ),
                            reversion: Some(reversion),
                        });
                    }
                    let e = ArbiterError::TransientState(format!(
                        "emergency {} is in progress but does not hold group {}",
                        vehicle_id, group.id
                    ));
                    warn!("Clear attempt {} for {}: {}", attempt + 1, vehicle_id, e);
                    last_error = Some(e);
                },
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ArbiterError::TransientState(format!("emergency {} could not be cleared", vehicle_id))
        }))
    }

    /// Timer entry point: revert the override identified by `epoch`
    ///
    /// Returns `None` when that override already ended.
    pub fn expire_override(
        &self,
        group_id: &str,
        epoch: u64,
        now: NaiveDateTime,
    ) -> Result<Option<Reversion>> {
        let group = self.group(group_id)?;
        let mut preemption = group.preemption.lock();
        let current = preemption
            .active
            .as_ref()
            .is_some_and(|active| active.epoch == epoch);
        if !current {
            debug!("Override epoch {} in group {} already ended", epoch, group_id);
            return Ok(None);
        }
        let reversion = self.revert_locked(&group, &mut preemption, now, ReversionCause::Timeout)?;
        Ok(Some(reversion))
    }

    /// Cancel every queued (never activated) request; returns their ids
    pub fn cancel_pending(&self) -> Vec<String> {
        let mut cancelled = Vec::new();
        for group in self.all_groups() {
            let mut preemption = group.preemption.lock();
            let now = self.now();
            let queued = std::mem::take(&mut preemption.queue);
            for vehicle_id in queued.into_values() {
                if let Some(vehicle) = self.resolve(&vehicle_id, EmergencyStatus::Cancelled, now) {
                    self.record_emergency(
                        now,
                        &vehicle,
                        EmergencyEventType::EmergencyCancelled,
                        "cancelled at shutdown before activation".to_string(),
                        (None, None, None),
                    );
                    cancelled.push(vehicle_id);
                }
            }
        }
        if !cancelled.is_empty() {
            info!("Cancelled {} queued emergencies", cancelled.len());
        }
        cancelled
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_emergency(&self, vehicle_id: &str) -> Result<EmergencyVehicle> {
        self.emergency(vehicle_id)
            .ok_or_else(|| ArbiterError::not_found(format!("emergency vehicle {}", vehicle_id)))
    }

    /// Open emergencies, oldest detection first
    pub fn list_active_emergencies(&self) -> Vec<EmergencyVehicle> {
        let mut open: Vec<_> = self
            .emergencies
            .iter()
            .filter(|e| e.status.is_open())
            .map(|e| e.value().clone())
            .collect();
        open.sort_by(|a, b| {
            (a.detected_at, &a.vehicle_id).cmp(&(b.detected_at, &b.vehicle_id))
        });
        open
    }

    /// Every emergency (any status) that targeted an intersection
    pub fn emergencies_at(&self, intersection_id: IntersectionId) -> Result<Vec<EmergencyVehicle>> {
        self.slot(intersection_id)?;
        let mut found: Vec<_> = self
            .emergencies
            .iter()
            .filter(|e| e.intersection_id == intersection_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| {
            (a.detected_at, &a.vehicle_id).cmp(&(b.detected_at, &b.vehicle_id))
        });
        Ok(found)
    }

    pub fn emergency_event_types(&self) -> &'static [EmergencyEventType] {
        &EmergencyEventType::ALL
    }

    // ------------------------------------------------------------------------
    // Locked internals (caller holds the group lock)
    // ------------------------------------------------------------------------

    fn activate_locked(
        &self,
        group: &GroupSlot,
        preemption: &mut GroupPreemption,
        vehicle_id: &str,
        now: NaiveDateTime,
    ) -> Result<(Activation, Vec<AffectedIntersection>)> {
        let vehicle = self.get_emergency(vehicle_id)?;
        let override_secs = self.settings.override_duration_secs;
        let epoch = self.next_epoch();
        let deadline = now + TimeDelta::seconds(i64::from(override_secs));

        let members = self.member_slots(group);
        let mut guards: Vec<(&IntersectionSlot, MutexGuard<'_, IntersectionRuntime>)> = members
            .iter()
            .map(|s| (s.as_ref(), s.state.lock()))
            .collect();

        let mut affected = Vec::with_capacity(guards.len());
        for (slot, state) in guards.iter_mut() {
            let previous = state.current_phase;
            state.suspend(now);
            state.override_deadline = Some(deadline);
            state.phase_started_at = now;

            if slot.id == vehicle.intersection_id {
                let plan = slot.plan.load();
                let green = plan
                    .phase_for_approach(vehicle.direction)
                    .map(|p| p.number)
                    .unwrap_or(previous);
                state.current_phase = green;
                state.mode = SignalMode::EmergencyOverride;
                state.active_emergency_vehicle_id = Some(vehicle_id.to_string());
                state.red_hold_vehicle_id = None;

                self.record_transition(
                    now,
                    PhaseTransitionEvent {
                        intersection_id: slot.id,
                        previous_phase: Some(previous),
                        new_phase: Some(green),
                        duration: override_secs,
                        trigger: TransitionTrigger::EmergencyOverride,
                        success: true,
                        reason: format!("emergency override for {}", vehicle_id),
                    },
                );
                self.record_emergency(
                    now,
                    &vehicle,
                    EmergencyEventType::GreenLightActivated,
                    format!(
                        "green on phase {} for {} approach at intersection {}",
                        green, vehicle.direction, slot.id
                    ),
                    (Some(previous), Some(green), Some(override_secs)),
                );
                affected.push(AffectedIntersection {
                    intersection_id: slot.id,
                    name: slot.name.clone(),
                    mode: SignalMode::EmergencyOverride,
                    green_phase: Some(green),
                    previous_phase: previous,
                    hold_secs: override_secs,
                });
            } else {
                state.hold_red(now, vehicle_id, deadline);

                self.record_transition(
                    now,
                    PhaseTransitionEvent {
                        intersection_id: slot.id,
                        previous_phase: Some(previous),
                        new_phase: None,
                        duration: override_secs,
                        trigger: TransitionTrigger::RedHold,
                        success: true,
                        reason: format!("red hold for emergency {}", vehicle_id),
                    },
                );
                self.ledger.append(
                    now,
                    LedgerEvent::Emergency(EmergencyEvent {
                        vehicle_id: vehicle_id.to_string(),
                        intersection_id: slot.id,
                        event_type: EmergencyEventType::RedLightActivated,
                        description: format!(
                            "red hold while intersection {} is preempted",
                            vehicle.intersection_id
                        ),
                        previous_phase: Some(previous),
                        new_phase: None,
                        duration: Some(override_secs),
                        success: true,
                    }),
                );
                affected.push(AffectedIntersection {
                    intersection_id: slot.id,
                    name: slot.name.clone(),
                    mode: SignalMode::RedHold,
                    green_phase: None,
                    previous_phase: previous,
                    hold_secs: override_secs,
                });
            }
        }
        drop(guards);

        if let Some(mut entry) = self.emergencies.get_mut(vehicle_id) {
            entry.status = EmergencyStatus::InProgress;
            entry.activated_at = Some(now);
            entry.epoch = Some(epoch);
        }
        preemption.active = Some(ActiveOverride {
            vehicle_id: vehicle_id.to_string(),
            epoch,
            deadline,
        });
        info!(
            "Emergency override {} active in group {} (epoch {}, until {})",
            vehicle_id, group.id, epoch, deadline
        );

        Ok((
            Activation {
                vehicle_id: vehicle_id.to_string(),
                group: group.id.clone(),
                epoch,
                deadline,
            },
            affected,
        ))
    }

    /// Consume the active override, restore the group, promote the next request
    pub(crate) fn revert_locked(
        &self,
        group: &GroupSlot,
        preemption: &mut GroupPreemption,
        now: NaiveDateTime,
        cause: ReversionCause,
    ) -> Result<Reversion> {
        let Some(active) = preemption.active.take() else {
            return Err(ArbiterError::TransientState(format!(
                "group {} has no active override",
                group.id
            )));
        };

        let mut restored = Vec::new();
        {
            let members = self.member_slots(group);
            for slot in &members {
                let mut state = slot.state.lock();
                let previous = match state.mode {
                    SignalMode::RedHold => None,
                    _ => Some(state.current_phase),
                };
                let Some(suspension) = state.resume(now) else {
                    continue;
                };
                let plan = slot.plan.load();
                let duration = self.current_effective(&plan, &state);
                self.record_transition(
                    now,
                    PhaseTransitionEvent {
                        intersection_id: slot.id,
                        previous_phase: previous,
                        new_phase: Some(suspension.phase),
                        duration,
                        trigger: TransitionTrigger::Reversion,
                        success: true,
                        reason: format!(
                            "resumed phase {} with {}s already served",
                            suspension.phase, suspension.elapsed_secs
                        ),
                    },
                );
                restored.push(RestoredPhase {
                    intersection_id: slot.id,
                    phase: suspension.phase,
                    elapsed_secs: suspension.elapsed_secs,
                });
            }
        }

        if let Some(vehicle) = self.resolve(&active.vehicle_id, EmergencyStatus::Cleared, now) {
            let description = match cause {
                ReversionCause::Cleared => "cleared by request".to_string(),
                ReversionCause::Timeout => "override expired".to_string(),
            };
            self.record_emergency(
                now,
                &vehicle,
                EmergencyEventType::EmergencyCleared,
                description,
                (None, None, None),
            );
            self.record_emergency(
                now,
                &vehicle,
                EmergencyEventType::NormalOperationResumed,
                format!("{} intersection(s) back to normal cycling", restored.len()),
                (None, None, None),
            );
        }
        info!(
            "Emergency {} reverted in group {} ({:?})",
            active.vehicle_id, group.id, cause
        );

        let next_activation = self.promote_next(group, preemption, now)?;
        Ok(Reversion {
            vehicle_id: active.vehicle_id,
            group: group.id.clone(),
            epoch: active.epoch,
            cause,
            reverted_at: now,
            restored,
            next_activation,
        })
    }

    fn promote_next(
        &self,
        group: &GroupSlot,
        preemption: &mut GroupPreemption,
        now: NaiveDateTime,
    ) -> Result<Option<Activation>> {
        while let Some((_, vehicle_id)) = preemption.queue.pop_first() {
            let pending = self
                .emergency(&vehicle_id)
                .is_some_and(|v| v.status == EmergencyStatus::Detected);
            if !pending {
                continue;
            }
            let (activation, _) = self.activate_locked(group, preemption, &vehicle_id, now)?;
            return Ok(Some(activation));
        }
        Ok(None)
    }

    fn emergency(&self, vehicle_id: &str) -> Option<EmergencyVehicle> {
        self.emergencies.get(vehicle_id).map(|e| e.value().clone())
    }

    /// Move an open emergency to a final status
    fn resolve(
        &self,
        vehicle_id: &str,
        status: EmergencyStatus,
        now: NaiveDateTime,
    ) -> Option<EmergencyVehicle> {
        let mut entry = self.emergencies.get_mut(vehicle_id)?;
        if !entry.status.is_open() {
            return None;
        }
        entry.status = status;
        entry.resolved_at = Some(now);
        Some(entry.value().clone())
    }

    fn record_emergency(
        &self,
        now: NaiveDateTime,
        vehicle: &EmergencyVehicle,
        event_type: EmergencyEventType,
        description: String,
        (previous_phase, new_phase, duration): (Option<PhaseNumber>, Option<PhaseNumber>, Option<u32>),
    ) {
        self.ledger.append(
            now,
            LedgerEvent::Emergency(EmergencyEvent {
                vehicle_id: vehicle.vehicle_id.clone(),
                intersection_id: vehicle.intersection_id,
                event_type,
                description,
                previous_phase,
                new_phase,
                duration,
                success: true,
            }),
        );
    }
}

fn summarize(affected: &[AffectedIntersection]) -> ImpactSummary {
    ImpactSummary {
        affected_count: affected.len(),
        total_wait_secs: affected
            .iter()
            .filter(|a| a.mode == SignalMode::RedHold)
            .map(|a| a.hold_secs)
            .sum(),
        green_intersection: affected
            .iter()
            .find(|a| a.mode == SignalMode::EmergencyOverride)
            .map(|a| a.intersection_id),
    }
}

fn describe_actions(affected: &[AffectedIntersection]) -> Vec<String> {
    let mut actions: Vec<String> = affected
        .iter()
        .map(|a| match (a.mode, a.green_phase) {
            (SignalMode::EmergencyOverride, Some(green)) => format!(
                "{}: switched to green on phase {} for {}s",
                a.name, green, a.hold_secs
            ),
            _ => format!("{}: held red for safety ({}s)", a.name, a.hold_secs),
        })
        .collect();
    if affected.len() > 1 {
        actions.push("Cycling suspended across the coordination group".to_string());
    }
    actions
}
