//! Integration tests for rule selection
//!
//! Covers ordering, tie-breaking, time windows and the two-stage clamp
//! against the built-in rule set.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use chrono::{NaiveDate, NaiveDateTime};
use signal_rules::{
    default_rules, select_manual, select_rule, RuleAction, RuleCondition, RuleError, RuleStore,
    RuleType, SelectorConfig, TrafficRule,
};

/// 2024-06-05 is a Wednesday, 2024-06-08 a Saturday
fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn custom_rule(id: i64, name: &str, priority: u32, base: u32) -> TrafficRule {
    TrafficRule {
        id,
        name: name.to_string(),
        rule_type: RuleType::Custom,
        description: None,
        active: true,
        priority,
        condition: RuleCondition::default(),
        action: RuleAction {
            base_green_duration: base,
            ..Default::default()
        },
    }
}

#[test]
fn test_peak_hour_wins_on_weekday_morning() {
    let rules = default_rules();
    let selection = select_rule(&rules, 45, at(5, 8, 0), &SelectorConfig::default())
        .unwrap()
        .unwrap();

    assert_eq!(selection.rule_name, "PEAK_HOUR_EXTENSION");
    // 30 + 15 = 45, within [20, 60], +10 boost => 55
    assert_eq!(selection.new_duration, 55);
    let names: Vec<_> = selection
        .candidates
        .iter()
        .map(|c| c.rule_name.as_str())
        .collect();
    assert_eq!(names, vec!["PEAK_HOUR_EXTENSION", "HIGH_DENSITY_BOOST"]);
}

#[test]
fn test_peak_hour_skipped_on_weekend() {
    let rules = default_rules();
    let selection = select_rule(&rules, 45, at(8, 8, 0), &SelectorConfig::default())
        .unwrap()
        .unwrap();

    assert_eq!(selection.rule_name, "HIGH_DENSITY_BOOST");
    assert_eq!(selection.new_duration, 60);
}

#[test]
fn test_night_mode_duration() {
    let rules = default_rules();
    let selection = select_rule(&rules, 5, at(5, 3, 0), &SelectorConfig::default())
        .unwrap()
        .unwrap();

    assert_eq!(selection.rule_name, "NIGHT_MODE_QUICK");
    // 30 - 10 = 20, within [15, 25], no boost
    assert_eq!(selection.new_duration, 20);
}

#[test]
fn test_no_applicable_rule_is_not_an_error() {
    let rules = default_rules();
    let selection = select_rule(&rules, 20, at(5, 12, 0), &SelectorConfig::default()).unwrap();
    assert!(selection.is_none());
}

#[test]
fn test_priority_ties_broken_by_insertion_order() {
    let rules = vec![
        custom_rule(10, "LATE_PRIORITY", 2, 40),
        custom_rule(11, "FIRST_TIE", 1, 30),
        custom_rule(12, "SECOND_TIE", 1, 50),
    ];
    let config = SelectorConfig::default();

    for _ in 0..20 {
        let selection = select_rule(&rules, 0, at(5, 12, 0), &config)
            .unwrap()
            .unwrap();
        assert_eq!(selection.rule_id, 11);
        assert_eq!(selection.new_duration, 30);
    }
}

#[test]
fn test_selection_is_deterministic_for_fixed_inputs() {
    let store = RuleStore::new(default_rules()).unwrap();
    let snapshot = store.snapshot();
    let config = SelectorConfig::default();

    let first = select_rule(&snapshot.rules, 42, at(5, 7, 30), &config).unwrap();
    for _ in 0..50 {
        let again = select_rule(&snapshot.rules, 42, at(5, 7, 30), &config).unwrap();
        assert_eq!(first, again);
    }
}

#[test]
fn test_inactive_rules_ignored() {
    let store = RuleStore::new(default_rules()).unwrap();
    store.set_active(2, false).unwrap();
    let snapshot = store.snapshot();

    let selection = select_rule(&snapshot.rules, 45, at(8, 12, 0), &SelectorConfig::default())
        .unwrap();
    assert!(selection.is_none());
}

#[test]
fn test_manual_selection_bypasses_predicate() {
    let rules = default_rules();
    let selection = select_manual(&rules, 3, 45, &SelectorConfig::default()).unwrap();

    assert_eq!(selection.rule_name, "NIGHT_MODE_QUICK");
    // 30 - 10 = 20, +10 boost => 30
    assert_eq!(selection.new_duration, 30);
}

#[test]
fn test_manual_selection_unknown_rule() {
    let rules = default_rules();
    let result = select_manual(&rules, 99, 10, &SelectorConfig::default());
    assert!(matches!(result, Err(RuleError::NotFound(99))));
}

#[test]
fn test_malformed_winner_is_reported() {
    let mut broken = custom_rule(20, "BROKEN_BOUNDS", 1, 30);
    broken.action.min_green_duration = Some(60);
    broken.action.max_green_duration = Some(20);
    let store = RuleStore::from_records(vec![broken]);
    let snapshot = store.snapshot();

    let result = select_rule(&snapshot.rules, 10, at(5, 12, 0), &SelectorConfig::default());
    assert!(matches!(result, Err(RuleError::InvalidRule { .. })));
}

#[test]
fn test_rules_deserialize_from_json() {
    let json = serde_json::json!([{
        "id": 7,
        "name": "WEEKEND_RELAX",
        "rule_type": "WEEKEND",
        "priority": 4,
        "condition": { "day_type": "WEEKEND", "time_start": "10:00:00", "time_end": "18:00:00" },
        "action": { "base_green_duration": 25, "green_duration_adjustment": 5 }
    }]);
    let rules: Vec<TrafficRule> = serde_json::from_value(json).unwrap();
    assert!(rules[0].active);

    let selection = select_rule(&rules, 0, at(8, 12, 0), &SelectorConfig::default())
        .unwrap()
        .unwrap();
    assert_eq!(selection.new_duration, 30);
    assert!(select_rule(&rules, 0, at(5, 12, 0), &SelectorConfig::default())
        .unwrap()
        .is_none());
}
