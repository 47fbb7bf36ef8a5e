//! Shared fixtures for arbiter integration tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use signal_arbiter::{
    Arbiter, ArbiterSettings, Direction, EventLedger, Intersection, IntersectionConfig,
    ManualClock, Phase, PhaseNumber,
};
use signal_rules::{default_rules, RuleStore};

/// June 2024: the 5th is a Wednesday, the 8th a Saturday
pub fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

pub fn phase(
    number: PhaseNumber,
    order: u32,
    bounds: (u32, u32, u32),
    approaches: &[Direction],
) -> Phase {
    let (min, default, max) = bounds;
    Phase {
        number,
        name: format!("Phase {}", number),
        sequence_order: order,
        min_duration: min,
        max_duration: max,
        default_duration: default,
        priority_level: 1,
        can_skip: false,
        conflicting_phases: BTreeSet::new(),
        compatible_phases: BTreeSet::new(),
        approaches: approaches.to_vec(),
        next_phase: None,
        active: true,
    }
}

/// North-south phase 1, east-west phase 2, each 15..=60 default 30
pub fn two_phase(id: i64, group: Option<&str>) -> Intersection {
    let mut ns = phase(1, 1, (15, 30, 60), &[Direction::North, Direction::South]);
    ns.name = "North-South Through".to_string();
    ns.conflicting_phases.insert(2);
    let mut ew = phase(2, 2, (15, 30, 60), &[Direction::East, Direction::West]);
    ew.name = "East-West Through".to_string();
    ew.conflicting_phases.insert(1);

    Intersection {
        id,
        name: format!("Intersection {}", id),
        lane_count: 4,
        features: vec![],
        config: IntersectionConfig {
            coordination_group: group.map(str::to_string),
            ..Default::default()
        },
        phases: vec![ns, ew],
    }
}

pub struct Harness {
    pub arbiter: Arc<Arbiter>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(rules: RuleStore, start: NaiveDateTime) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let arbiter = Arbiter::new(
            ArbiterSettings::default(),
            Arc::new(rules),
            Arc::new(EventLedger::new()),
            clock.clone(),
        )
        .unwrap();
        Self {
            arbiter: Arc::new(arbiter),
            clock,
        }
    }

    pub fn with_default_rules(start: NaiveDateTime) -> Self {
        Self::new(RuleStore::new(default_rules()).unwrap(), start)
    }

    pub fn without_rules(start: NaiveDateTime) -> Self {
        Self::new(RuleStore::new(vec![]).unwrap(), start)
    }

    pub fn register(&self, intersection: Intersection) {
        self.arbiter.register_intersection(intersection).unwrap();
    }

    /// Advance the clock and tick
    pub fn tick_after(&self, id: i64, secs: i64, count: u32) -> signal_arbiter::TickOutcome {
        let now = self.clock.advance_secs(secs);
        self.arbiter.tick(id, now, count).unwrap()
    }
}
