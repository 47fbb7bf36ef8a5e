//! Arbitration Core - one authoritative phase per intersection
//!
//! Composes the rule selector, the phase sequencer and the preemption
//! controller. Preemption wins unconditionally; rule timing only shapes
//! durations; the sequencer decides which phase comes next.
//!
//! # Locking
//!
//! ```text
//! group.preemption (Mutex)            one per coordination group
//!   └─ member.state (Mutex) ...       ascending intersection id
//! ```
//!
//! Every operation that touches more than one intersection takes the group
//! lock first and then member locks in ascending id order. The intersection
//! and group registries are only read to clone `Arc`s and are never held
//! while waiting on another lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use signal_rules::{
    density_level, select_manual, select_rule, DensityLevel, RuleCandidate, RuleError, RuleId,
    RuleSelection, RuleStore, SelectorConfig,
};

use crate::clock::{elapsed_secs, Clock};
use crate::error::{ArbiterError, Result};
use crate::ledger::{
    ApplicationSource, AppliedRuleRecord, EmergencyEvent, EmergencyEventType, EventFilter,
    EventLedger, LedgerEntry, LedgerEvent, PhaseTransitionEvent, TransitionTrigger,
};
use crate::model::{GroupId, Intersection, IntersectionConfig, IntersectionId, Phase, PhaseNumber};
use crate::preemption::{EmergencyVehicle, GroupPreemption, Reversion, ReversionCause};
use crate::runtime::{AppliedTiming, IntersectionRuntime, RuntimeSnapshot, SignalMode};
use crate::sequencer::{Advance, PhasePlan};

/// Default emergency override length (seconds)
pub const DEFAULT_OVERRIDE_DURATION_SECS: u32 = 60;

/// Arbiter tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterSettings {
    #[serde(default = "default_override_duration")]
    pub override_duration_secs: u32,

    #[serde(default)]
    pub selector: SelectorConfig,
}

fn default_override_duration() -> u32 {
    DEFAULT_OVERRIDE_DURATION_SECS
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            override_duration_secs: DEFAULT_OVERRIDE_DURATION_SECS,
            selector: SelectorConfig::default(),
        }
    }
}

impl ArbiterSettings {
    pub fn validate(&self) -> Result<()> {
        if self.override_duration_secs == 0 {
            return Err(ArbiterError::configuration(
                "override_duration_secs must be greater than zero",
            ));
        }
        self.selector.validate()?;
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Current phase keeps running
    Holding {
        phase: PhaseNumber,
        elapsed_secs: u32,
        effective_duration: u32,
        /// A new rule timing was applied this tick
        rule_applied: bool,
    },
    Advanced {
        from: PhaseNumber,
        to: PhaseNumber,
        duration: u32,
        skipped: Vec<PhaseNumber>,
    },
    /// Due to advance, but the next phase conflicts with a green group member
    Deferred {
        phase: PhaseNumber,
        candidate: PhaseNumber,
        blocked_by: IntersectionId,
    },
    /// Under emergency control; cycling suspended
    Preempted { mode: SignalMode },
    /// Override expired on this tick
    Reverted(Reversion),
    /// Sequencing data is corrupt; last safe phase held
    Faulted { phase: PhaseNumber, reason: String },
}

/// Input for [`Arbiter::apply_optimization`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub intersection_id: IntersectionId,
    pub vehicle_count: i64,
    #[serde(default)]
    pub average_speed: Option<f64>,
    /// Force a specific rule (bypasses the applicability predicate)
    #[serde(default)]
    pub rule_id: Option<RuleId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationOutcome {
    pub intersection_id: IntersectionId,
    pub selected_rule: Option<RuleCandidate>,
    /// Every applicable rule in selection order
    pub applicable_rules: Vec<RuleCandidate>,
    pub density_level: DensityLevel,
    pub vehicle_count: u32,
    pub average_speed: Option<f64>,
    pub previous_duration: u32,
    /// Effective duration after the phase clamp
    pub new_duration: u32,
    /// Selector output before the phase clamp
    pub rule_duration: Option<u32>,
    pub applied: bool,
    pub applied_at: NaiveDateTime,
    pub performance: PerformanceMetrics,
    pub message: String,
}

/// Rough effect estimate of a green-time change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformanceMetrics {
    /// Seconds added to (or taken from) the current phase
    pub adjustment_secs: i64,
    /// Estimated change in average wait, percent; negative is better
    pub wait_time_change_pct: i64,
    /// Estimated change in throughput, percent
    pub flow_change_pct: i64,
    /// 0..=100
    pub efficiency_score: u8,
    pub recommendation: String,
}

impl PerformanceMetrics {
    /// Linear estimate: each added second trims wait 2% and lifts flow 3%
    pub fn estimate(previous_duration: u32, new_duration: u32) -> Self {
        let adjustment = i64::from(new_duration) - i64::from(previous_duration);
        let gain = adjustment.max(0);
        let efficiency_score = (50 + adjustment * 5).clamp(0, 100) as u8;
        let recommendation = if adjustment > 0 {
            format!("Keep the extended timing for about {} minutes", adjustment * 15)
        } else {
            "No extension applied; normal timing continues".to_string()
        };
        Self {
            adjustment_secs: adjustment,
            wait_time_change_pct: -(gain * 2),
            flow_change_pct: gain * 3,
            efficiency_score,
            recommendation,
        }
    }
}

// ============================================================================
// Registry slots
// ============================================================================

pub(crate) struct IntersectionSlot {
    pub id: IntersectionId,
    pub name: String,
    pub config: IntersectionConfig,
    pub group: GroupId,
    pub plan: ArcSwap<PhasePlan>,
    pub state: Mutex<IntersectionRuntime>,
}

pub(crate) struct GroupSlot {
    pub id: GroupId,
    /// Sorted ascending; defines lock order
    pub members: RwLock<Vec<IntersectionId>>,
    pub preemption: Mutex<GroupPreemption>,
}

// ============================================================================
// Arbiter
// ============================================================================

pub struct Arbiter {
    pub(crate) settings: ArbiterSettings,
    pub(crate) rules: Arc<RuleStore>,
    pub(crate) ledger: Arc<EventLedger>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) intersections: RwLock<BTreeMap<IntersectionId, Arc<IntersectionSlot>>>,
    pub(crate) groups: RwLock<BTreeMap<GroupId, Arc<GroupSlot>>>,
    pub(crate) emergencies: DashMap<String, EmergencyVehicle>,
    pub(crate) epochs: AtomicU64,
    pub(crate) queue_seq: AtomicU64,
}

impl Arbiter {
    pub fn new(
        settings: ArbiterSettings,
        rules: Arc<RuleStore>,
        ledger: Arc<EventLedger>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            rules,
            ledger,
            clock,
            intersections: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            emergencies: DashMap::new(),
            epochs: AtomicU64::new(0),
            queue_seq: AtomicU64::new(0),
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn settings(&self) -> &ArbiterSettings {
        &self.settings
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn ledger(&self) -> &Arc<EventLedger> {
        &self.ledger
    }

    pub fn intersection_ids(&self) -> Vec<IntersectionId> {
        self.intersections.read().keys().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register an intersection and start it on its first phase
    pub fn register_intersection(&self, intersection: Intersection) -> Result<()> {
        let plan = PhasePlan::new(intersection.phases.clone()).map_err(|e| {
            error!("Intersection {} rejected: {}", intersection.id, e);
            e
        })?;
        if self.intersections.read().contains_key(&intersection.id) {
            return Err(ArbiterError::Conflict(format!(
                "intersection {} is already registered",
                intersection.id
            )));
        }

        let now = self.now();
        let group_id = intersection.group_id();
        let initial = plan.initial().clone();
        let group = {
            let mut groups = self.groups.write();
            Arc::clone(groups.entry(group_id.clone()).or_insert_with(|| {
                Arc::new(GroupSlot {
                    id: group_id.clone(),
                    members: RwLock::new(Vec::new()),
                    preemption: Mutex::new(GroupPreemption::default()),
                })
            }))
        };

        let preemption = group.preemption.lock();
        for member in self.member_slots(&group) {
            if !(intersection.config.coordination_enabled || member.config.coordination_enabled) {
                continue;
            }
            let state = member.state.lock();
            let Some(cycling) = state.cycling_phase() else {
                continue;
            };
            let plan = member.plan.load();
            if let Some(green) = plan.phase(cycling) {
                if initial.conflicts_with(green) {
                    return Err(ArbiterError::Conflict(format!(
                        "initial phase {} of intersection {} conflicts with phase {} at intersection {}",
                        initial.number, intersection.id, green.number, member.id
                    )));
                }
            }
        }

        // Joining mid-override: red until the group reverts
        let mut runtime = IntersectionRuntime::new(initial.number, now);
        let red_hold = preemption
            .active
            .as_ref()
            .map(|active| (active.vehicle_id.clone(), active.deadline));
        if let Some((vehicle_id, deadline)) = &red_hold {
            runtime.hold_red(now, vehicle_id, *deadline);
        }

        let slot = Arc::new(IntersectionSlot {
            id: intersection.id,
            name: intersection.name.clone(),
            config: intersection.config.clone(),
            group: group_id.clone(),
            plan: ArcSwap::from_pointee(plan),
            state: Mutex::new(runtime),
        });
        {
            let mut intersections = self.intersections.write();
            if intersections.contains_key(&intersection.id) {
                return Err(ArbiterError::Conflict(format!(
                    "intersection {} is already registered",
                    intersection.id
                )));
            }
            intersections.insert(intersection.id, slot);
        }
        {
            let mut members = group.members.write();
            members.push(intersection.id);
            members.sort_unstable();
        }

        if let Some((vehicle_id, deadline)) = red_hold {
            let hold_secs = elapsed_secs(now, deadline);
            self.record_transition(
                now,
                PhaseTransitionEvent {
                    intersection_id: intersection.id,
                    previous_phase: None,
                    new_phase: None,
                    duration: hold_secs,
                    trigger: TransitionTrigger::RedHold,
                    success: true,
                    reason: format!(
                        "registered during emergency {}; phase {} waits for reversion",
                        vehicle_id, initial.number
                    ),
                },
            );
            self.ledger.append(
                now,
                LedgerEvent::Emergency(EmergencyEvent {
                    vehicle_id: vehicle_id.clone(),
                    intersection_id: intersection.id,
                    event_type: EmergencyEventType::RedLightActivated,
                    description: format!(
                        "red hold on joining group {} during override",
                        group_id
                    ),
                    previous_phase: None,
                    new_phase: None,
                    duration: Some(hold_secs),
                    success: true,
                }),
            );
            info!(
                "Intersection {} '{}' registered red-held in group {} ({} active)",
                intersection.id, intersection.name, group_id, vehicle_id
            );
            return Ok(());
        }

        self.record_transition(
            now,
            PhaseTransitionEvent {
                intersection_id: intersection.id,
                previous_phase: None,
                new_phase: Some(initial.number),
                duration: initial.default_duration,
                trigger: TransitionTrigger::Startup,
                success: true,
                reason: format!("started on phase {}", initial.number),
            },
        );
        info!(
            "Intersection {} '{}' registered in group {} ({} phases)",
            intersection.id,
            intersection.name,
            group_id,
            intersection.phases.len()
        );
        Ok(())
    }

    /// Validate and swap an intersection's phase plan
    ///
    /// An invalid plan is rejected and the running plan stays in force.
    pub fn update_phase_plan(&self, id: IntersectionId, phases: Vec<Phase>) -> Result<()> {
        let slot = self.slot(id)?;
        let now = self.now();

        let plan = match PhasePlan::new(phases) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Phase plan for intersection {} rejected: {}", id, e);
                let state = slot.state.lock();
                self.record_transition(
                    now,
                    PhaseTransitionEvent {
                        intersection_id: id,
                        previous_phase: Some(state.current_phase),
                        new_phase: Some(state.current_phase),
                        duration: 0,
                        trigger: TransitionTrigger::PlanReload,
                        success: false,
                        reason: e.to_string(),
                    },
                );
                return Err(e);
            },
        };

        let group = self.group(&slot.group)?;
        let _preemption = group.preemption.lock();
        let mut state = slot.state.lock();
        let initial = plan.initial().clone();

        if let Some(suspension) = state.suspension.as_mut() {
            if plan.phase(suspension.phase).is_none() {
                suspension.phase = initial.number;
                suspension.elapsed_secs = 0;
            }
        }
        if state.is_normal() && plan.phase(state.current_phase).is_none() {
            let previous = state.current_phase;
            state.current_phase = initial.number;
            state.phase_started_at = now;
            self.record_transition(
                now,
                PhaseTransitionEvent {
                    intersection_id: id,
                    previous_phase: Some(previous),
                    new_phase: Some(initial.number),
                    duration: plan.effective_duration(&initial, state.rule_duration()),
                    trigger: TransitionTrigger::PlanReload,
                    success: true,
                    reason: format!("phase {} removed by plan reload", previous),
                },
            );
        }
        state.demands.retain(|p| plan.phase(*p).is_some());
        state.sequence_fault = None;
        slot.plan.store(Arc::new(plan));
        info!("Phase plan for intersection {} reloaded", id);
        Ok(())
    }

    /// Register a call (e.g. pedestrian request) for a skippable phase
    pub fn register_demand(&self, id: IntersectionId, phase: PhaseNumber) -> Result<()> {
        let slot = self.slot(id)?;
        if slot.plan.load().phase(phase).is_none() {
            return Err(ArbiterError::not_found(format!(
                "phase {} at intersection {}",
                phase, id
            )));
        }
        slot.state.lock().demands.insert(phase);
        debug!("Demand registered for phase {} at intersection {}", phase, id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Advance one intersection's arbitration by one step
    pub fn tick(
        &self,
        id: IntersectionId,
        now: NaiveDateTime,
        vehicle_count: u32,
    ) -> Result<TickOutcome> {
        let slot = self.slot(id)?;
        let group = self.group(&slot.group)?;
        let mut preemption = group.preemption.lock();

        let expired = preemption
            .active
            .as_ref()
            .is_some_and(|active| now >= active.deadline);
        if expired {
            let reversion =
                self.revert_locked(&group, &mut preemption, now, ReversionCause::Timeout)?;
            return Ok(TickOutcome::Reverted(reversion));
        }

        // Conflict checks read every member; lock them all in id order
        let slots = self.member_slots(&group);
        let mut guards: Vec<(&IntersectionSlot, MutexGuard<'_, IntersectionRuntime>)> = slots
            .iter()
            .map(|s| (s.as_ref(), s.state.lock()))
            .collect();
        let Some(pos) = guards.iter().position(|(s, _)| s.id == id) else {
            return Err(ArbiterError::not_found(format!("intersection {}", id)));
        };
        let (_, mut state) = guards.remove(pos);
        let mut others = guards;

        if !state.is_normal() {
            return Ok(TickOutcome::Preempted { mode: state.mode });
        }

        let plan = slot.plan.load_full();
        let rule_applied = if slot.config.adaptive_timing_enabled {
            self.refresh_rule_timing(&slot, &plan, &mut state, now, vehicle_count)
        } else {
            false
        };

        let current = state.current_phase;
        let Some(phase) = plan.phase(current) else {
            return Ok(self.hold_on_fault(
                id,
                &mut state,
                now,
                format!("current phase {} is not in the plan", current),
            ));
        };
        let effective = plan.effective_duration(phase, state.rule_duration());
        let elapsed = state.elapsed(now);
        if elapsed < effective {
            return Ok(TickOutcome::Holding {
                phase: current,
                elapsed_secs: elapsed,
                effective_duration: effective,
                rule_applied,
            });
        }

        let advance = match plan.next_phase(current, &state.demands) {
            Ok(advance) => advance,
            Err(e) => return Ok(self.hold_on_fault(id, &mut state, now, e.to_string())),
        };
        let Some(next) = plan.phase(advance.next) else {
            return Ok(self.hold_on_fault(
                id,
                &mut state,
                now,
                format!("phase {} vanished from the plan", advance.next),
            ));
        };

        let blockers: Vec<usize> = others
            .iter()
            .enumerate()
            .filter(|(_, (other, other_state))| {
                coordinated(&slot, other)
                    && other_state.is_normal()
                    && other
                        .plan
                        .load()
                        .phase(other_state.current_phase)
                        .is_some_and(|green| next.conflicts_with(green))
            })
            .map(|(i, _)| i)
            .collect();

        let mut joint = Vec::new();
        if let Some(&first) = blockers.first() {
            let at_max = elapsed >= phase.max_duration;
            match self.plan_joint_step(&slot, next, at_max, &others, &blockers, now) {
                Some(steps) => joint = steps,
                None if at_max => {
                    return Ok(self.hold_on_fault(
                        id,
                        &mut state,
                        now,
                        format!(
                            "phase {} at its {}s maximum; phase {} conflicts with intersection {} and no joint step exists",
                            current, phase.max_duration, next.number, others[first].0.id
                        ),
                    ));
                },
                None => {
                    debug!(
                        "Intersection {} defers phase {}: conflicts with intersection {}",
                        id, next.number, others[first].0.id
                    );
                    return Ok(TickOutcome::Deferred {
                        phase: current,
                        candidate: next.number,
                        blocked_by: others[first].0.id,
                    });
                },
            }
        }

        let next_number = next.number;
        let reason = if advance.skipped.is_empty() {
            format!("phase {} completed after {}s", current, elapsed)
        } else {
            format!(
                "phase {} completed after {}s, skipped {:?}",
                current, elapsed, advance.skipped
            )
        };
        let duration = self.commit_advance(
            &slot,
            &plan,
            &mut state,
            &advance,
            now,
            TransitionTrigger::Cycle,
            reason,
            rule_applied,
            Some(vehicle_count),
        );
        debug!(
            "Intersection {}: phase {} -> {} ({}s)",
            id, current, next_number, duration
        );

        for (i, other_plan, other_advance) in joint {
            let (other, other_state) = &mut others[i];
            let reason = format!(
                "advanced with intersection {} to clear a cross-intersection conflict",
                id
            );
            self.commit_advance(
                *other,
                &other_plan,
                other_state,
                &other_advance,
                now,
                TransitionTrigger::Coordination,
                reason,
                false,
                None,
            );
            info!(
                "Intersection {} advanced to phase {} together with intersection {}",
                other.id, other_advance.next, id
            );
        }

        Ok(TickOutcome::Advanced {
            from: current,
            to: next_number,
            duration,
            skipped: advance.skipped,
        })
    }

    /// Blocking members that can step together with the caller
    ///
    /// A blocker joins when its own phase is due, or when the caller has hit
    /// its maximum and the blocker has served its minimum. The step is only
    /// taken if the resulting greens are pairwise conflict-free.
    fn plan_joint_step(
        &self,
        slot: &IntersectionSlot,
        next: &Phase,
        at_max: bool,
        others: &[(&IntersectionSlot, MutexGuard<'_, IntersectionRuntime>)],
        blockers: &[usize],
        now: NaiveDateTime,
    ) -> Option<Vec<(usize, Arc<PhasePlan>, Advance)>> {
        let mut steps = Vec::with_capacity(blockers.len());
        for &i in blockers {
            let (other, other_state) = &others[i];
            let plan = other.plan.load_full();
            let (green, min, effective) = {
                let green = plan.phase(other_state.current_phase)?;
                (
                    green.number,
                    green.min_duration,
                    plan.effective_duration(green, other_state.rule_duration()),
                )
            };
            let served = other_state.elapsed(now);
            if served < effective && !(at_max && served >= min) {
                return None;
            }
            let advance = plan.next_phase(green, &other_state.demands).ok()?;
            if advance.next == green {
                return None;
            }
            steps.push((i, plan, advance));
        }

        let mut proposed: Vec<(&IntersectionSlot, Phase)> = vec![(slot, next.clone())];
        for (i, (other, other_state)) in others.iter().enumerate() {
            if !other_state.is_normal() {
                continue;
            }
            let number = steps
                .iter()
                .find(|(j, ..)| *j == i)
                .map_or(other_state.current_phase, |(_, _, advance)| advance.next);
            let phase = other.plan.load().phase(number)?.clone();
            proposed.push((*other, phase));
        }
        for (a, (slot_a, phase_a)) in proposed.iter().enumerate() {
            for (slot_b, phase_b) in &proposed[a + 1..] {
                if coordinated(slot_a, slot_b) && phase_a.conflicts_with(phase_b) {
                    return None;
                }
            }
        }
        Some(steps)
    }

    /// Move to the sequencer's choice and record the transition
    ///
    /// A wrap ends the cycle's rule timing. With a vehicle count the next
    /// cycle selects immediately; otherwise the intersection's own next tick
    /// does.
    #[allow(clippy::too_many_arguments)]
    fn commit_advance(
        &self,
        slot: &IntersectionSlot,
        plan: &PhasePlan,
        state: &mut IntersectionRuntime,
        advance: &Advance,
        now: NaiveDateTime,
        trigger: TransitionTrigger,
        reason: String,
        timing_fresh: bool,
        vehicle_count: Option<u32>,
    ) -> u32 {
        let previous = state.current_phase;
        state.current_phase = advance.next;
        state.phase_started_at = now;
        state.demands.remove(&advance.next);
        state.sequence_fault = None;

        if advance.wrapped && !timing_fresh {
            state.reset_cycle_timing();
            if let Some(count) = vehicle_count {
                if slot.config.adaptive_timing_enabled {
                    self.refresh_rule_timing(slot, plan, state, now, count);
                }
            }
        }
        let duration = self.current_effective(plan, state);

        self.record_transition(
            now,
            PhaseTransitionEvent {
                intersection_id: slot.id,
                previous_phase: Some(previous),
                new_phase: Some(advance.next),
                duration,
                trigger,
                success: true,
                reason,
            },
        );
        duration
    }

    /// Select rule timing once per cycle; true when a timing was applied
    fn refresh_rule_timing(
        &self,
        slot: &IntersectionSlot,
        plan: &PhasePlan,
        state: &mut IntersectionRuntime,
        now: NaiveDateTime,
        vehicle_count: u32,
    ) -> bool {
        // Tick, optimization and manual timings all hold until the wrap
        if state.timing_selected {
            return false;
        }
        state.timing_selected = true;

        let snapshot = self.rules.snapshot();
        match select_rule(&snapshot.rules, vehicle_count, now, &self.settings.selector) {
            Ok(Some(selection)) => {
                state.rule_fault = None;
                let previous = self.current_effective(plan, state);
                self.apply_selection(
                    slot.id,
                    plan,
                    state,
                    &selection,
                    vehicle_count,
                    ApplicationSource::Tick,
                    now,
                    previous,
                );
                true
            },
            // Hold the current timing
            Ok(None) => {
                state.rule_fault = None;
                false
            },
            Err(e) => {
                let reason = e.to_string();
                let previous = self.current_effective(plan, state);
                state.applied = None;
                if state.rule_fault.as_deref() != Some(reason.as_str()) {
                    warn!(
                        "Intersection {}: rule selection failed, falling back to default timing: {}",
                        slot.id, reason
                    );
                    let fallback = self.current_effective(plan, state);
                    self.record_application(
                        now,
                        AppliedRuleRecord {
                            intersection_id: slot.id,
                            rule_id: None,
                            rule_name: None,
                            vehicle_count,
                            previous_duration: previous,
                            new_duration: fallback,
                            rule_duration: None,
                            source: ApplicationSource::Tick,
                            success: false,
                            reason: reason.clone(),
                        },
                    );
                    state.rule_fault = Some(reason);
                }
                false
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_selection(
        &self,
        intersection_id: IntersectionId,
        plan: &PhasePlan,
        state: &mut IntersectionRuntime,
        selection: &RuleSelection,
        vehicle_count: u32,
        source: ApplicationSource,
        now: NaiveDateTime,
        previous_duration: u32,
    ) -> u32 {
        state.timing_selected = true;
        state.applied = Some(AppliedTiming {
            rule_id: Some(selection.rule_id),
            rule_name: Some(selection.rule_name.clone()),
            duration: selection.new_duration,
            source,
            applied_at: now,
        });
        let new_duration = self.current_effective(plan, state);
        self.record_application(
            now,
            AppliedRuleRecord {
                intersection_id,
                rule_id: Some(selection.rule_id),
                rule_name: Some(selection.rule_name.clone()),
                vehicle_count,
                previous_duration,
                new_duration,
                rule_duration: Some(selection.new_duration),
                source,
                success: true,
                reason: format!(
                    "{} selected (base {}s, density boost {}s)",
                    selection.rule_name, selection.base_duration, selection.density_boost
                ),
            },
        );
        debug!(
            "Intersection {}: rule {} applied, {}s -> {}s",
            intersection_id, selection.rule_name, previous_duration, new_duration
        );
        new_duration
    }

    fn hold_on_fault(
        &self,
        id: IntersectionId,
        state: &mut IntersectionRuntime,
        now: NaiveDateTime,
        reason: String,
    ) -> TickOutcome {
        if state.sequence_fault.as_deref() != Some(reason.as_str()) {
            error!(
                "Intersection {}: sequencing fault, holding phase {}: {}",
                id, state.current_phase, reason
            );
            self.record_transition(
                now,
                PhaseTransitionEvent {
                    intersection_id: id,
                    previous_phase: Some(state.current_phase),
                    new_phase: Some(state.current_phase),
                    duration: 0,
                    trigger: TransitionTrigger::Fault,
                    success: false,
                    reason: reason.clone(),
                },
            );
            state.sequence_fault = Some(reason.clone());
        }
        TickOutcome::Faulted {
            phase: state.current_phase,
            reason,
        }
    }

    // ------------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------------

    /// Run rule selection for an intersection on request and apply the result
    pub fn apply_optimization(&self, request: OptimizationRequest) -> Result<OptimizationOutcome> {
        let vehicle_count = u32::try_from(request.vehicle_count).map_err(|_| {
            ArbiterError::validation(format!(
                "vehicle_count must be a non-negative count, got {}",
                request.vehicle_count
            ))
        })?;
        if let Some(speed) = request.average_speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(ArbiterError::validation(format!(
                    "average_speed must be a non-negative number, got {}",
                    speed
                )));
            }
        }

        let id = request.intersection_id;
        let slot = self.slot(id)?;
        let now = self.now();
        let snapshot = self.rules.snapshot();
        let source = if request.rule_id.is_some() {
            ApplicationSource::Manual
        } else {
            ApplicationSource::Optimization
        };

        let (selection, applicable, selection_error) = match request.rule_id {
            Some(rule_id) => {
                let selection =
                    select_manual(&snapshot.rules, rule_id, vehicle_count, &self.settings.selector)
                        .map_err(|e| match e {
                            RuleError::NotFound(_) | RuleError::Inactive(_) => {
                                ArbiterError::not_found(format!("active rule {}", rule_id))
                            },
                            other => ArbiterError::Rule(other),
                        });
                match selection {
                    Ok(selection) => {
                        let applicable = selection.candidates.clone();
                        (Some(selection), applicable, None)
                    },
                    Err(ArbiterError::Rule(e)) => {
                        self.record_failed_optimization(
                            &slot, now, vehicle_count, source, &e.to_string(),
                        );
                        return Err(ArbiterError::Rule(e));
                    },
                    Err(e) => return Err(e),
                }
            },
            None => {
                match select_rule(&snapshot.rules, vehicle_count, now, &self.settings.selector) {
                    Ok(Some(selection)) => {
                        let applicable = selection.candidates.clone();
                        (Some(selection), applicable, None)
                    },
                    Ok(None) => (None, Vec::new(), None),
                    Err(e) => {
                        warn!("Optimization for intersection {} fell back: {}", id, e);
                        let applicable = signal_rules::applicable_rules(
                            &snapshot.rules,
                            vehicle_count,
                            now,
                        )
                        .into_iter()
                        .map(RuleCandidate::from)
                        .collect();
                        (None, applicable, Some(e.to_string()))
                    },
                }
            },
        };

        let group = self.group(&slot.group)?;
        let _preemption = group.preemption.lock();
        let mut state = slot.state.lock();
        let plan = slot.plan.load_full();
        let previous_duration = self.current_effective(&plan, &state);

        let mut outcome = OptimizationOutcome {
            intersection_id: id,
            selected_rule: selection.as_ref().and_then(|s| s.candidates.first().cloned()),
            applicable_rules: applicable,
            density_level: density_level(vehicle_count),
            vehicle_count,
            average_speed: request.average_speed,
            previous_duration,
            new_duration: previous_duration,
            rule_duration: selection.as_ref().map(|s| s.new_duration),
            applied: false,
            applied_at: now,
            performance: PerformanceMetrics::estimate(previous_duration, previous_duration),
            message: String::new(),
        };

        if !state.is_normal() {
            let reason = format!(
                "intersection {} is in {} mode; rule timing not applied",
                id,
                state.mode.as_str()
            );
            self.record_application(
                now,
                AppliedRuleRecord {
                    intersection_id: id,
                    rule_id: selection.as_ref().map(|s| s.rule_id),
                    rule_name: selection.as_ref().map(|s| s.rule_name.clone()),
                    vehicle_count,
                    previous_duration,
                    new_duration: previous_duration,
                    rule_duration: outcome.rule_duration,
                    source,
                    success: false,
                    reason: reason.clone(),
                },
            );
            outcome.message = reason;
            return Ok(outcome);
        }

        match (selection, selection_error) {
            (Some(selection), _) => {
                state.rule_fault = None;
                outcome.new_duration = self.apply_selection(
                    id,
                    &plan,
                    &mut state,
                    &selection,
                    vehicle_count,
                    source,
                    now,
                    previous_duration,
                );
                outcome.applied = true;
                outcome.message = format!(
                    "{} applied: green {}s -> {}s",
                    selection.rule_name, previous_duration, outcome.new_duration
                );
            },
            (None, Some(reason)) => {
                state.applied = None;
                state.timing_selected = true;
                state.rule_fault = Some(reason.clone());
                outcome.new_duration = self.current_effective(&plan, &state);
                self.record_application(
                    now,
                    AppliedRuleRecord {
                        intersection_id: id,
                        rule_id: None,
                        rule_name: None,
                        vehicle_count,
                        previous_duration,
                        new_duration: outcome.new_duration,
                        rule_duration: None,
                        source,
                        success: false,
                        reason: reason.clone(),
                    },
                );
                outcome.message = format!("rule data defect, default timing in force: {}", reason);
            },
            (None, None) => {
                outcome.message = "No applicable rule; current timing held".to_string();
            },
        }

        outcome.performance = PerformanceMetrics::estimate(previous_duration, outcome.new_duration);
        info!("Optimization for intersection {}: {}", id, outcome.message);
        Ok(outcome)
    }

    fn record_failed_optimization(
        &self,
        slot: &IntersectionSlot,
        now: NaiveDateTime,
        vehicle_count: u32,
        source: ApplicationSource,
        reason: &str,
    ) {
        let state = slot.state.lock();
        let duration = self.current_effective(&slot.plan.load(), &state);
        warn!(
            "Optimization for intersection {} rejected: {}",
            slot.id, reason
        );
        self.record_application(
            now,
            AppliedRuleRecord {
                intersection_id: slot.id,
                rule_id: None,
                rule_name: None,
                vehicle_count,
                previous_duration: duration,
                new_duration: duration,
                rule_duration: None,
                source,
                success: false,
                reason: reason.to_string(),
            },
        );
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Read-only copy of an intersection's runtime state
    pub fn get_runtime_state(&self, id: IntersectionId) -> Result<RuntimeSnapshot> {
        let slot = self.slot(id)?;
        let now = self.now();
        let plan = slot.plan.load();
        let state = slot.state.lock();

        let (current_phase, effective_duration) = match state.mode {
            SignalMode::RedHold => (None, None),
            SignalMode::EmergencyOverride => (
                Some(state.current_phase),
                Some(self.settings.override_duration_secs),
            ),
            SignalMode::Normal => (
                Some(state.current_phase),
                plan.phase(state.current_phase)
                    .map(|p| plan.effective_duration(p, state.rule_duration())),
            ),
        };

        Ok(RuntimeSnapshot {
            intersection_id: id,
            name: slot.name.clone(),
            group: slot.group.clone(),
            mode: state.mode,
            current_phase,
            phase_name: current_phase
                .and_then(|n| plan.phase(n))
                .map(|p| p.name.clone()),
            phase_elapsed_secs: state.elapsed(now),
            effective_duration,
            active_emergency_vehicle_id: state.active_emergency_vehicle_id.clone(),
            red_hold_vehicle_id: state.red_hold_vehicle_id.clone(),
            override_remaining_secs: state.override_deadline.map(|d| elapsed_secs(now, d)),
            applied_rule: state.applied.clone(),
            pending_demands: state.demands.iter().copied().collect(),
            fault: state
                .sequence_fault
                .clone()
                .or_else(|| state.rule_fault.clone()),
        })
    }

    /// Ledger entries for an intersection or vehicle, oldest first
    pub fn list_events(
        &self,
        filter: &EventFilter,
        since: Option<NaiveDateTime>,
    ) -> Vec<LedgerEntry> {
        self.ledger.list(filter, since)
    }

    /// Successful applications of a rule, derived from the ledger
    pub fn times_applied(&self, rule_id: RuleId) -> u64 {
        self.ledger.times_applied(rule_id)
    }

    // ------------------------------------------------------------------------
    // Internals shared with the preemption controller
    // ------------------------------------------------------------------------

    pub(crate) fn slot(&self, id: IntersectionId) -> Result<Arc<IntersectionSlot>> {
        self.intersections
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ArbiterError::not_found(format!("intersection {}", id)))
    }

    pub(crate) fn group(&self, id: &str) -> Result<Arc<GroupSlot>> {
        self.groups
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ArbiterError::not_found(format!("coordination group {}", id)))
    }

    pub(crate) fn all_groups(&self) -> Vec<Arc<GroupSlot>> {
        self.groups.read().values().cloned().collect()
    }

    /// Group members in lock order
    pub(crate) fn member_slots(&self, group: &GroupSlot) -> Vec<Arc<IntersectionSlot>> {
        let members = group.members.read().clone();
        let registry = self.intersections.read();
        members
            .iter()
            .filter_map(|id| registry.get(id).cloned())
            .collect()
    }

    pub(crate) fn current_effective(&self, plan: &PhasePlan, state: &IntersectionRuntime) -> u32 {
        plan.phase(state.current_phase)
            .map(|p| plan.effective_duration(p, state.rule_duration()))
            .unwrap_or_default()
    }

    pub(crate) fn record_transition(&self, now: NaiveDateTime, event: PhaseTransitionEvent) {
        self.ledger.append(now, LedgerEvent::PhaseTransition(event));
    }

    fn record_application(&self, now: NaiveDateTime, record: AppliedRuleRecord) {
        self.ledger.append(now, LedgerEvent::RuleApplied(record));
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_queue_seq(&self) -> u64 {
        self.queue_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Cross-intersection conflicts bind a pair when either side coordinates
fn coordinated(a: &IntersectionSlot, b: &IntersectionSlot) -> bool {
    a.config.coordination_enabled || b.config.coordination_enabled
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Direction;
    use chrono::NaiveDate;
    use signal_rules::{RuleAction, RuleCondition, RuleType, TrafficRule};
    use std::collections::BTreeSet;
    use tracing_test::traced_test;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 5)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn intersection() -> Intersection {
        let phase = |number, order, approaches: Vec<Direction>| Phase {
            number,
            name: format!("Phase {}", number),
            sequence_order: order,
            min_duration: 15,
            max_duration: 60,
            default_duration: 30,
            priority_level: 1,
            can_skip: false,
            conflicting_phases: BTreeSet::new(),
            compatible_phases: BTreeSet::new(),
            approaches,
            next_phase: None,
            active: true,
        };
        Intersection {
            id: 1,
            name: "Main & 1st".to_string(),
            lane_count: 4,
            features: vec![],
            config: IntersectionConfig::default(),
            phases: vec![
                phase(1, 1, vec![Direction::North, Direction::South]),
                phase(2, 2, vec![Direction::East, Direction::West]),
            ],
        }
    }

    fn broken_rule() -> TrafficRule {
        TrafficRule {
            id: 9,
            name: "BROKEN_BOUNDS".to_string(),
            rule_type: RuleType::Custom,
            description: None,
            active: true,
            priority: 1,
            condition: RuleCondition::default(),
            action: RuleAction {
                base_green_duration: 30,
                green_duration_adjustment: 0,
                min_green_duration: Some(60),
                max_green_duration: Some(20),
            },
        }
    }

    fn arbiter(rules: RuleStore) -> (Arbiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let arbiter = Arbiter::new(
            ArbiterSettings::default(),
            Arc::new(rules),
            Arc::new(EventLedger::new()),
            clock.clone(),
        )
        .unwrap();
        arbiter.register_intersection(intersection()).unwrap();
        (arbiter, clock)
    }

    #[test]
    #[traced_test]
    fn test_rule_defect_falls_back_to_default_timing() {
        let (arbiter, clock) = arbiter(RuleStore::from_records(vec![broken_rule()]));

        let outcome = arbiter.tick(1, clock.now(), 10).unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Holding {
                phase: 1,
                elapsed_secs: 0,
                effective_duration: 30,
                rule_applied: false,
            }
        );
        assert!(logs_contain("falling back to default timing"));

        let snapshot = arbiter.get_runtime_state(1).unwrap();
        assert!(snapshot.fault.unwrap().contains("BROKEN_BOUNDS"));

        // Same defect is recorded once, and cycling carries on
        arbiter.tick(1, clock.advance_secs(10), 10).unwrap();
        let failures = arbiter
            .list_events(&EventFilter::Intersection(1), None)
            .into_iter()
            .filter(|e| matches!(&e.event, LedgerEvent::RuleApplied(r) if !r.success))
            .count();
        assert_eq!(failures, 1);
        assert!(matches!(
            arbiter.tick(1, clock.advance_secs(20), 10).unwrap(),
            TickOutcome::Advanced { from: 1, to: 2, .. }
        ));
    }

    #[test]
    #[traced_test]
    fn test_manual_selection_of_defective_rule_is_surfaced() {
        let (arbiter, _clock) = arbiter(RuleStore::from_records(vec![broken_rule()]));

        let err = arbiter
            .apply_optimization(OptimizationRequest {
                intersection_id: 1,
                vehicle_count: 5,
                average_speed: None,
                rule_id: Some(9),
            })
            .unwrap_err();
        assert!(matches!(err, ArbiterError::Rule(RuleError::InvalidRule { .. })));
        assert!(logs_contain("rejected"));
    }

    #[test]
    fn test_automatic_optimization_reports_defect() {
        let (arbiter, _clock) = arbiter(RuleStore::from_records(vec![broken_rule()]));

        let outcome = arbiter
            .apply_optimization(OptimizationRequest {
                intersection_id: 1,
                vehicle_count: 5,
                average_speed: None,
                rule_id: None,
            })
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.new_duration, 30);
        assert_eq!(outcome.applicable_rules.len(), 1);
        assert_eq!(arbiter.times_applied(9), 0);
    }

    #[test]
    fn test_settings_validation() {
        let settings = ArbiterSettings {
            override_duration_secs: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        assert!(ArbiterSettings::default().validate().is_ok());
    }

    #[test]
    fn test_performance_estimate() {
        let extended = PerformanceMetrics::estimate(30, 45);
        assert_eq!(extended.adjustment_secs, 15);
        assert_eq!(extended.wait_time_change_pct, -30);
        assert_eq!(extended.flow_change_pct, 45);
        assert_eq!(extended.efficiency_score, 100);
        assert!(extended.recommendation.contains("225 minutes"));

        let unchanged = PerformanceMetrics::estimate(30, 30);
        assert_eq!(unchanged.wait_time_change_pct, 0);
        assert_eq!(unchanged.efficiency_score, 50);

        let shortened = PerformanceMetrics::estimate(30, 20);
        assert_eq!(shortened.adjustment_secs, -10);
        assert_eq!(shortened.flow_change_pct, 0);
        assert_eq!(shortened.efficiency_score, 0);
    }

    #[test]
    fn test_duplicate_registration_conflicts() {
        let (arbiter, _clock) = arbiter(RuleStore::new(vec![]).unwrap());
        let err = arbiter.register_intersection(intersection()).unwrap_err();
        assert!(matches!(err, ArbiterError::Conflict(_)));
    }
}
