//! Arbitration core integration tests
//!
//! Tick-driven cycling, rule timing, optimization requests, skip/demand,
//! cross-intersection conflicts and phase plan validation.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use common::{at, phase, two_phase, Harness};
use signal_arbiter::{
    ApplicationSource, ArbiterError, EventFilter, LedgerEvent, OptimizationRequest, SignalMode,
    TickOutcome, TransitionTrigger,
};
use signal_rules::DensityLevel;

fn optimize(intersection_id: i64, vehicle_count: i64) -> OptimizationRequest {
    OptimizationRequest {
        intersection_id,
        vehicle_count,
        average_speed: Some(32.5),
        rule_id: None,
    }
}

// ============================================================================
// Optimization
// ============================================================================

#[test]
fn test_high_density_optimization_example() {
    // Saturday noon: only HIGH_DENSITY_BOOST applies to 45 vehicles
    let h = Harness::with_default_rules(at(8, 12, 0, 0));
    h.register(two_phase(1, None));

    let outcome = h.arbiter.apply_optimization(optimize(1, 45)).unwrap();

    let rule = outcome.selected_rule.unwrap();
    assert_eq!(rule.rule_name, "HIGH_DENSITY_BOOST");
    assert_eq!(outcome.previous_duration, 30);
    // 30 + 20 in [25, 75], +10 boost => 60; phase [15, 60] keeps 60
    assert_eq!(outcome.rule_duration, Some(60));
    assert_eq!(outcome.new_duration, 60);
    assert_eq!(outcome.density_level, DensityLevel::High);
    assert!(outcome.applied);
    assert_eq!(h.arbiter.times_applied(rule.rule_id), 1);
    assert_eq!(outcome.performance.adjustment_secs, 30);
    assert_eq!(outcome.performance.wait_time_change_pct, -60);

    let snapshot = h.arbiter.get_runtime_state(1).unwrap();
    assert_eq!(snapshot.effective_duration, Some(60));
}

#[test]
fn test_phase_bounds_are_final_authority() {
    let h = Harness::with_default_rules(at(8, 12, 0, 0));
    let mut intersection = two_phase(1, None);
    intersection.phases[0].max_duration = 45;
    h.register(intersection);

    let outcome = h.arbiter.apply_optimization(optimize(1, 45)).unwrap();
    assert_eq!(outcome.rule_duration, Some(60));
    assert_eq!(outcome.new_duration, 45);

    for count in [0, 12, 26, 41, 80, 500] {
        let outcome = h.arbiter.apply_optimization(optimize(1, count)).unwrap();
        assert!((15..=45).contains(&outcome.new_duration), "count {}", count);
    }
}

#[test]
fn test_no_applicable_rule_holds_timing() {
    let h = Harness::with_default_rules(at(5, 12, 0, 0));
    h.register(two_phase(1, None));

    let outcome = h.arbiter.apply_optimization(optimize(1, 20)).unwrap();
    assert!(outcome.selected_rule.is_none());
    assert!(!outcome.applied);
    assert_eq!(outcome.new_duration, outcome.previous_duration);
}

#[test]
fn test_manual_rule_selection_pins_timing_for_the_cycle() {
    let h = Harness::with_default_rules(at(8, 12, 0, 0));
    h.register(two_phase(1, None));

    let outcome = h
        .arbiter
        .apply_optimization(OptimizationRequest {
            rule_id: Some(3),
            ..optimize(1, 45)
        })
        .unwrap();
    // NIGHT_MODE_QUICK: 30 - 10 in [15, 25] => 20, +10 boost => 30
    assert_eq!(outcome.rule_duration, Some(30));

    // The tick would pick HIGH_DENSITY_BOOST, but manual timing holds
    h.tick_after(1, 1, 45);
    let applied = h.arbiter.get_runtime_state(1).unwrap().applied_rule.unwrap();
    assert_eq!(applied.rule_id, Some(3));
    assert_eq!(applied.source, ApplicationSource::Manual);
}

#[test]
fn test_optimization_request_validation() {
    let h = Harness::with_default_rules(at(8, 12, 0, 0));
    h.register(two_phase(1, None));

    let err = h.arbiter.apply_optimization(optimize(1, -3)).unwrap_err();
    assert!(matches!(err, ArbiterError::Validation(_)));

    let err = h.arbiter.apply_optimization(optimize(99, 10)).unwrap_err();
    assert!(matches!(err, ArbiterError::NotFound { .. }));

    let err = h
        .arbiter
        .apply_optimization(OptimizationRequest {
            rule_id: Some(99),
            ..optimize(1, 10)
        })
        .unwrap_err();
    assert!(matches!(err, ArbiterError::NotFound { .. }));

    h.arbiter.rules().set_active(2, false).unwrap();
    let err = h
        .arbiter
        .apply_optimization(OptimizationRequest {
            rule_id: Some(2),
            ..optimize(1, 10)
        })
        .unwrap_err();
    assert!(err.is_client_error());
}

// ============================================================================
// Tick
// ============================================================================

#[test]
fn test_default_cycle_without_rules() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    h.register(two_phase(1, None));

    assert_eq!(
        h.tick_after(1, 29, 0),
        TickOutcome::Holding {
            phase: 1,
            elapsed_secs: 29,
            effective_duration: 30,
            rule_applied: false,
        }
    );
    assert_eq!(
        h.tick_after(1, 1, 0),
        TickOutcome::Advanced {
            from: 1,
            to: 2,
            duration: 30,
            skipped: vec![],
        }
    );
    assert!(matches!(
        h.tick_after(1, 30, 0),
        TickOutcome::Advanced { from: 2, to: 1, .. }
    ));

    let transitions: Vec<_> = h
        .arbiter
        .list_events(&EventFilter::Intersection(1), None)
        .into_iter()
        .filter_map(|e| match e.event {
            LedgerEvent::PhaseTransition(t) => Some(t.trigger),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            TransitionTrigger::Startup,
            TransitionTrigger::Cycle,
            TransitionTrigger::Cycle
        ]
    );
}

#[test]
fn test_tick_applies_rule_once_per_cycle() {
    let h = Harness::with_default_rules(at(8, 12, 0, 0));
    h.register(two_phase(1, None));

    let now = h.clock.advance_secs(0);
    assert_eq!(
        h.arbiter.tick(1, now, 45).unwrap(),
        TickOutcome::Holding {
            phase: 1,
            elapsed_secs: 0,
            effective_duration: 60,
            rule_applied: true,
        }
    );
    assert!(matches!(
        h.tick_after(1, 59, 45),
        TickOutcome::Holding {
            rule_applied: false,
            ..
        }
    ));
    assert_eq!(
        h.tick_after(1, 1, 45),
        TickOutcome::Advanced {
            from: 1,
            to: 2,
            duration: 60,
            skipped: vec![],
        }
    );
    assert_eq!(h.arbiter.times_applied(2), 1);

    // Wrapping starts a new cycle, which selects afresh
    assert!(matches!(
        h.tick_after(1, 60, 45),
        TickOutcome::Advanced {
            from: 2,
            to: 1,
            duration: 60,
            ..
        }
    ));
    assert_eq!(h.arbiter.times_applied(2), 2);
}

#[test]
fn test_rule_timing_holds_while_count_moves_mid_cycle() {
    // Wednesday 08:00: PEAK_HOUR_EXTENSION covers 25+ vehicles
    let h = Harness::with_default_rules(at(5, 8, 0, 0));
    h.register(two_phase(1, None));

    // 30 vehicles: 30 + 15 => 45, +5 boost => 50
    let mut durations = Vec::new();
    for count in [30, 45, 30, 12] {
        match h.tick_after(1, 1, count) {
            TickOutcome::Holding {
                effective_duration,
                ..
            } => durations.push(effective_duration),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(durations, vec![50, 50, 50, 50]);
    assert_eq!(h.arbiter.times_applied(1), 1);

    assert_eq!(
        h.tick_after(1, 46, 45),
        TickOutcome::Advanced {
            from: 1,
            to: 2,
            duration: 50,
            skipped: vec![],
        }
    );
    assert_eq!(h.arbiter.times_applied(1), 1);

    // The next cycle sees 45 vehicles: +10 boost => 55
    assert_eq!(
        h.tick_after(1, 50, 45),
        TickOutcome::Advanced {
            from: 2,
            to: 1,
            duration: 55,
            skipped: vec![],
        }
    );
    assert_eq!(h.arbiter.times_applied(1), 2);
}

#[test]
fn test_adaptive_timing_switch() {
    let h = Harness::with_default_rules(at(8, 12, 0, 0));
    let mut intersection = two_phase(1, None);
    intersection.config.adaptive_timing_enabled = false;
    h.register(intersection);

    assert!(matches!(
        h.tick_after(1, 1, 45),
        TickOutcome::Holding {
            effective_duration: 30,
            rule_applied: false,
            ..
        }
    ));

    // Explicit optimization still works
    let outcome = h.arbiter.apply_optimization(optimize(1, 45)).unwrap();
    assert_eq!(outcome.new_duration, 60);
}

#[test]
fn test_skippable_phase_needs_demand() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    let mut intersection = two_phase(1, None);
    let mut walk = phase(3, 3, (10, 10, 20), &[]);
    walk.name = "Pedestrian Walk".to_string();
    walk.can_skip = true;
    intersection.phases.push(walk);
    h.register(intersection);

    assert!(matches!(
        h.tick_after(1, 30, 0),
        TickOutcome::Advanced { from: 1, to: 2, .. }
    ));
    assert_eq!(
        h.tick_after(1, 30, 0),
        TickOutcome::Advanced {
            from: 2,
            to: 1,
            duration: 30,
            skipped: vec![3],
        }
    );

    h.arbiter.register_demand(1, 3).unwrap();
    assert_eq!(h.arbiter.get_runtime_state(1).unwrap().pending_demands, vec![3]);
    h.tick_after(1, 30, 0);
    assert_eq!(
        h.tick_after(1, 30, 0),
        TickOutcome::Advanced {
            from: 2,
            to: 3,
            duration: 10,
            skipped: vec![],
        }
    );
    assert!(h.arbiter.get_runtime_state(1).unwrap().pending_demands.is_empty());

    let err = h.arbiter.register_demand(1, 9).unwrap_err();
    assert!(matches!(err, ArbiterError::NotFound { .. }));
}

#[test]
fn test_coordinated_group_never_shows_conflicting_greens() {
    let h = Harness::without_rules(at(5, 12, 0, 0));

    // A: phase 2 conflicts with phase 1
    let mut a = two_phase(1, Some("corridor"));
    a.config.coordination_enabled = true;
    // B: phases 1 (40s) and 3, no declared conflicts of its own
    let mut b = two_phase(2, Some("corridor"));
    b.config.coordination_enabled = true;
    b.phases = vec![phase(1, 1, (15, 40, 60), &[]), phase(3, 2, (15, 30, 60), &[])];
    h.register(a);
    h.register(b);

    let mut deferred = 0;
    let mut advanced = [0, 0];
    for _ in 0..300 {
        let now = h.clock.advance_secs(1);
        for (i, id) in [1, 2].into_iter().enumerate() {
            match h.arbiter.tick(id, now, 0).unwrap() {
                TickOutcome::Deferred { blocked_by, .. } => {
                    assert_ne!(blocked_by, id);
                    deferred += 1;
                },
                TickOutcome::Advanced { .. } => advanced[i] += 1,
                _ => {},
            }
            let green_a = h.arbiter.get_runtime_state(1).unwrap().current_phase;
            let green_b = h.arbiter.get_runtime_state(2).unwrap().current_phase;
            assert!(
                !(green_a == Some(2) && green_b == Some(1)),
                "conflicting greens at {}",
                now
            );
        }
    }

    assert!(deferred > 0);
    assert!(advanced[0] >= 4 && advanced[1] >= 4, "{:?}", advanced);
}

fn coordination_steps(h: &Harness, id: i64) -> usize {
    h.arbiter
        .list_events(&EventFilter::Intersection(id), None)
        .into_iter()
        .filter(|e| {
            matches!(
                &e.event,
                LedgerEvent::PhaseTransition(t) if t.trigger == TransitionTrigger::Coordination
            )
        })
        .count()
}

#[test]
fn test_identical_coordinated_plans_step_together() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    for id in [1, 2] {
        let mut intersection = two_phase(id, Some("corridor"));
        intersection.config.coordination_enabled = true;
        h.register(intersection);
    }

    let mut advanced = [0, 0];
    for _ in 0..300 {
        let now = h.clock.advance_secs(1);
        for (i, id) in [1, 2].into_iter().enumerate() {
            if let TickOutcome::Advanced { .. } = h.arbiter.tick(id, now, 0).unwrap() {
                advanced[i] += 1;
            }
            let a = h.arbiter.get_runtime_state(1).unwrap();
            let b = h.arbiter.get_runtime_state(2).unwrap();
            assert!(a.phase_elapsed_secs <= 60 && b.phase_elapsed_secs <= 60, "stuck at {}", now);
            // Phases 1 and 2 conflict, so the pair must always agree
            assert_eq!(a.current_phase, b.current_phase, "conflicting greens at {}", now);
        }
    }

    // Intersection 1 leads each step and 2 moves with it
    assert_eq!(advanced, [10, 0]);
    assert_eq!(coordination_steps(&h, 2), 10);
}

#[test]
fn test_uncoordinated_member_defers_to_coordinated_neighbour() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    let mut a = two_phase(1, Some("corridor"));
    a.config.coordination_enabled = true;
    let mut b = two_phase(2, Some("corridor"));
    b.phases[0].default_duration = 20;
    h.register(a);
    h.register(b);

    let now = h.clock.advance_secs(20);
    assert_eq!(
        h.arbiter.tick(1, now, 0).unwrap(),
        TickOutcome::Holding {
            phase: 1,
            elapsed_secs: 20,
            effective_duration: 30,
            rule_applied: false,
        }
    );
    assert_eq!(
        h.arbiter.tick(2, now, 0).unwrap(),
        TickOutcome::Deferred {
            phase: 1,
            candidate: 2,
            blocked_by: 1,
        }
    );

    // Once 1 is due, the waiting member steps with it
    assert!(matches!(
        h.tick_after(1, 10, 0),
        TickOutcome::Advanced { from: 1, to: 2, .. }
    ));
    assert_eq!(h.arbiter.get_runtime_state(2).unwrap().current_phase, Some(2));
    assert_eq!(coordination_steps(&h, 2), 1);
}

#[test]
fn test_phase_maximum_cuts_blocking_member_short() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    let mut a = two_phase(1, Some("corridor"));
    a.config.coordination_enabled = true;
    a.phases[0].max_duration = 40;
    let mut b = two_phase(2, Some("corridor"));
    b.config.coordination_enabled = true;
    b.phases[0].default_duration = 60;
    h.register(a);
    h.register(b);

    assert!(matches!(
        h.tick_after(1, 39, 0),
        TickOutcome::Deferred { blocked_by: 2, .. }
    ));
    // At its 40s maximum, 1 takes 2 along (2 has served its 15s minimum)
    assert!(matches!(
        h.tick_after(1, 1, 0),
        TickOutcome::Advanced { from: 1, to: 2, .. }
    ));
    let b = h.arbiter.get_runtime_state(2).unwrap();
    assert_eq!(b.current_phase, Some(2));
    assert_eq!(b.phase_elapsed_secs, 0);
}

// ============================================================================
// Phase plans
// ============================================================================

#[test]
fn test_cyclic_next_phase_pointers_rejected() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    let mut intersection = two_phase(1, None);
    intersection.phases.push(phase(3, 3, (15, 30, 60), &[]));
    intersection.phases[0].next_phase = Some(2);
    intersection.phases[1].next_phase = Some(3);
    intersection.phases[2].next_phase = Some(2);

    let err = h.arbiter.register_intersection(intersection).unwrap_err();
    assert!(matches!(err, ArbiterError::Configuration(_)));
    assert!(h.arbiter.get_runtime_state(1).is_err());
}

#[test]
fn test_invalid_plan_reload_keeps_running_plan() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    h.register(two_phase(1, None));

    let mut broken = two_phase(1, None).phases;
    broken[1].default_duration = 90;
    let err = h.arbiter.update_phase_plan(1, broken).unwrap_err();
    assert!(matches!(err, ArbiterError::Configuration(_)));

    let rejected = h
        .arbiter
        .list_events(&EventFilter::Intersection(1), None)
        .into_iter()
        .any(|e| {
            matches!(
                e.event,
                LedgerEvent::PhaseTransition(ref t)
                    if t.trigger == TransitionTrigger::PlanReload && !t.success
            )
        });
    assert!(rejected);

    // Old plan still cycles
    assert!(matches!(
        h.tick_after(1, 30, 0),
        TickOutcome::Advanced { from: 1, to: 2, duration: 30, .. }
    ));
}

#[test]
fn test_plan_reload_moves_off_removed_phase() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    h.register(two_phase(1, None));

    let phases = vec![
        phase(2, 1, (15, 20, 60), &[]),
        phase(4, 2, (15, 25, 60), &[]),
    ];
    h.arbiter.update_phase_plan(1, phases).unwrap();

    let snapshot = h.arbiter.get_runtime_state(1).unwrap();
    assert_eq!(snapshot.mode, SignalMode::Normal);
    assert_eq!(snapshot.current_phase, Some(2));
    assert_eq!(snapshot.effective_duration, Some(20));
    assert!(matches!(
        h.tick_after(1, 20, 0),
        TickOutcome::Advanced { from: 2, to: 4, .. }
    ));
}

#[test]
fn test_unknown_intersection_tick() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    let err = h.arbiter.tick(42, at(5, 12, 0, 0), 0).unwrap_err();
    assert!(matches!(err, ArbiterError::NotFound { .. }));
}
