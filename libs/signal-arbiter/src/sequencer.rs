//! Phase Sequencer - validated phase cycle for one intersection
//!
//! States are the active phases in `sequence_order`. Advancing follows the
//! explicit `next_phase` pointer when present, otherwise the next phase in
//! order, wrapping after the last. A `can_skip` phase is bypassed unless it
//! has pending demand. Corrupt sequencing data is rejected at build time and
//! every runtime walk is bounded, so a bad plan holds the current phase
//! instead of spinning.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{ArbiterError, Result};
use crate::model::{Direction, Phase, PhaseNumber};

/// Result of asking the sequencer for the next phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub next: PhaseNumber,
    /// Skippable phases bypassed on the way
    pub skipped: Vec<PhaseNumber>,
    /// The walk passed the start of the cycle
    pub wrapped: bool,
}

/// Validated, immutable phase plan
#[derive(Debug, Clone)]
pub struct PhasePlan {
    /// Active phases in sequence order
    order: Vec<Phase>,
    /// Phase number -> index into `order`
    index: HashMap<PhaseNumber, usize>,
}

impl PhasePlan {
    pub fn new(phases: Vec<Phase>) -> Result<Self> {
        validate_phases(&phases)?;

        let mut order: Vec<Phase> = phases.into_iter().filter(|p| p.active).collect();
        order.sort_by_key(|p| p.sequence_order);
        let index = order
            .iter()
            .enumerate()
            .map(|(i, p)| (p.number, i))
            .collect();

        let plan = Self { order, index };
        plan.check_pointer_cycle()?;
        Ok(plan)
    }

    /// First active phase by sequence order
    pub fn initial(&self) -> &Phase {
        &self.order[0]
    }

    pub fn phase(&self, number: PhaseNumber) -> Option<&Phase> {
        self.index.get(&number).map(|&i| &self.order[i])
    }

    pub fn phases(&self) -> &[Phase] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Effective green for a phase: rule output if any, else the default,
    /// always clamped to the phase's own bounds
    pub fn effective_duration(&self, phase: &Phase, rule_duration: Option<u32>) -> u32 {
        phase.clamp_duration(rule_duration.unwrap_or(phase.default_duration))
    }

    /// First phase in sequence that serves `direction`
    pub fn phase_for_approach(&self, direction: Direction) -> Option<&Phase> {
        self.order.iter().find(|p| p.serves(direction))
    }

    fn successor(&self, number: PhaseNumber) -> Result<PhaseNumber> {
        let &i = self.index.get(&number).ok_or_else(|| {
            ArbiterError::configuration(format!("phase {} is not part of the plan", number))
        })?;
        match self.order[i].next_phase {
            Some(next) if self.index.contains_key(&next) => Ok(next),
            Some(next) => Err(ArbiterError::configuration(format!(
                "phase {} points to unknown next phase {}",
                number, next
            ))),
            None => Ok(self.order[(i + 1) % self.order.len()].number),
        }
    }

    /// Next eligible phase after `current`
    ///
    /// Returns `current` itself when every other phase was skipped.
    pub fn next_phase(
        &self,
        current: PhaseNumber,
        demands: &BTreeSet<PhaseNumber>,
    ) -> Result<Advance> {
        let first = self.initial().number;
        let mut candidate = self.successor(current)?;
        let mut skipped = Vec::new();
        let mut wrapped = false;

        for _ in 0..self.order.len() {
            wrapped |= candidate == first;
            if candidate == current {
                return Ok(Advance {
                    next: current,
                    skipped,
                    wrapped,
                });
            }

            let phase = self.phase(candidate).ok_or_else(|| {
                ArbiterError::configuration(format!("phase {} vanished from the plan", candidate))
            })?;
            if phase.can_skip && !demands.contains(&candidate) {
                debug!("Skipping phase {} (no demand)", candidate);
                skipped.push(candidate);
                candidate = self.successor(candidate)?;
                continue;
            }

            return Ok(Advance {
                next: candidate,
                skipped,
                wrapped,
            });
        }

        Err(ArbiterError::configuration(format!(
            "sequencing walk from phase {} did not return within {} steps",
            current,
            self.order.len()
        )))
    }

    /// Explicit pointers must form one cycle over every active phase
    fn check_pointer_cycle(&self) -> Result<()> {
        if self.order.iter().all(|p| p.next_phase.is_none()) {
            return Ok(());
        }

        let start = self.initial().number;
        let mut seen = BTreeSet::new();
        let mut current = start;
        for _ in 0..self.order.len() {
            if !seen.insert(current) {
                return Err(ArbiterError::configuration(format!(
                    "next-phase pointers cycle back to phase {} before covering the plan",
                    current
                )));
            }
            current = self.successor(current)?;
        }
        if current != start || seen.len() != self.order.len() {
            return Err(ArbiterError::configuration(
                "next-phase pointers do not return to the first phase",
            ));
        }
        Ok(())
    }
}

fn validate_phases(phases: &[Phase]) -> Result<()> {
    if !phases.iter().any(|p| p.active) {
        return Err(ArbiterError::configuration("no active phase (missing first phase)"));
    }

    let mut numbers = BTreeSet::new();
    let mut orders = BTreeSet::new();
    for phase in phases {
        let n = phase.number;
        if n == 0 {
            return Err(ArbiterError::configuration("phase number must be >= 1"));
        }
        if !numbers.insert(n) {
            return Err(ArbiterError::configuration(format!("duplicate phase number {}", n)));
        }
        if phase.active && !orders.insert(phase.sequence_order) {
            return Err(ArbiterError::configuration(format!(
                "duplicate sequence order {} (phase {})",
                phase.sequence_order, n
            )));
        }
        if phase.min_duration == 0
            || phase.min_duration > phase.default_duration
            || phase.default_duration > phase.max_duration
        {
            return Err(ArbiterError::configuration(format!(
                "phase {} durations violate 0 < min <= default <= max ({}/{}/{})",
                n, phase.min_duration, phase.default_duration, phase.max_duration
            )));
        }
        if phase.conflicting_phases.contains(&n) {
            return Err(ArbiterError::configuration(format!("phase {} conflicts with itself", n)));
        }
        if let Some(both) = phase
            .conflicting_phases
            .intersection(&phase.compatible_phases)
            .next()
        {
            return Err(ArbiterError::configuration(format!(
                "phase {} lists {} as both conflicting and compatible",
                n, both
            )));
        }
    }

    for phase in phases {
        if let Some(unknown) = phase
            .conflicting_phases
            .iter()
            .chain(phase.compatible_phases.iter())
            .find(|other| !numbers.contains(*other))
        {
            return Err(ArbiterError::configuration(format!(
                "phase {} references unknown phase {}",
                phase.number, unknown
            )));
        }
    }
    Ok(())
}
