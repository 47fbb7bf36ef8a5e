//! Rule Store - versioned rule set with lock-free snapshot reads
//!
//! Readers call [`RuleStore::snapshot`] and work on an immutable `Arc<RuleSet>`;
//! writers build a new set and swap it in, bumping the version. Insertion order
//! is preserved because the selector breaks priority ties on it.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::NaiveTime;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, RuleError};
use crate::types::{DayType, RuleAction, RuleCondition, RuleId, RuleType, TrafficRule};

/// Immutable rule set version
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub version: u64,
    /// Rules in insertion order
    pub rules: Vec<TrafficRule>,
}

impl RuleSet {
    pub fn get(&self, id: RuleId) -> Option<&TrafficRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.rules.iter().filter(|r| r.active).count()
    }
}

/// Read-mostly rule store
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
    /// Serializes writers; readers never take it
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// Create a store from validated rules
    pub fn new(rules: Vec<TrafficRule>) -> Result<Self> {
        check_all(&rules)?;
        Ok(Self::from_set(rules))
    }

    /// Create a store from rows read out of the external rule table.
    ///
    /// Malformed rows are admitted with a warning; the selector rejects them
    /// when they win a selection so the caller can fall back to default timing.
    pub fn from_records(rules: Vec<TrafficRule>) -> Self {
        for rule in &rules {
            if let Err(e) = rule.validate() {
                warn!("Rule record admitted with defect: {}", e);
            }
        }
        Self::from_set(rules)
    }

    fn from_set(rules: Vec<TrafficRule>) -> Self {
        info!("Rule store initialized with {} rules", rules.len());
        Self {
            current: ArcSwap::from_pointee(RuleSet { version: 1, rules }),
            write_lock: Mutex::new(()),
        }
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn get(&self, id: RuleId) -> Option<TrafficRule> {
        self.current.load().get(id).cloned()
    }

    /// Replace the whole set (hot reload); returns the new version
    pub fn replace(&self, rules: Vec<TrafficRule>) -> Result<u64> {
        check_all(&rules)?;
        let _guard = self.write_lock.lock();
        let version = self.current.load().version + 1;
        let count = rules.len();
        self.current.store(Arc::new(RuleSet { version, rules }));
        info!("Rule store reloaded: {} rules, version {}", count, version);
        Ok(version)
    }

    /// Insert a new rule or replace the one with the same id in place
    pub fn upsert(&self, rule: TrafficRule) -> Result<u64> {
        rule.validate()?;
        self.modify(|rules| {
            match rules.iter_mut().find(|r| r.id == rule.id) {
                Some(slot) => *slot = rule,
                None => rules.push(rule),
            }
            Ok(())
        })
    }

    /// Switch a rule on or off (new version, same position)
    pub fn set_active(&self, id: RuleId, active: bool) -> Result<u64> {
        self.modify(|rules| {
            let rule = rules
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(RuleError::NotFound(id))?;
            rule.active = active;
            Ok(())
        })
    }

    pub fn remove(&self, id: RuleId) -> Result<u64> {
        self.modify(|rules| {
            let before = rules.len();
            rules.retain(|r| r.id != id);
            if rules.len() == before {
                return Err(RuleError::NotFound(id));
            }
            Ok(())
        })
    }

    fn modify<F>(&self, f: F) -> Result<u64>
    where
        F: FnOnce(&mut Vec<TrafficRule>) -> Result<()>,
    {
        let _guard = self.write_lock.lock();
        let current = self.current.load_full();
        let mut rules = current.rules.clone();
        f(&mut rules)?;
        let version = current.version + 1;
        self.current.store(Arc::new(RuleSet { version, rules }));
        Ok(version)
    }
}

fn check_all(rules: &[TrafficRule]) -> Result<()> {
    for (i, rule) in rules.iter().enumerate() {
        rule.validate()?;
        if rules[..i].iter().any(|r| r.id == rule.id) {
            return Err(RuleError::invalid(&rule.name, format!("duplicate rule id {}", rule.id)));
        }
    }
    Ok(())
}

/// Built-in seed rules, used when no rules are configured
pub fn default_rules() -> Vec<TrafficRule> {
    let hm = |h: u32| NaiveTime::from_hms_opt(h, 0, 0);
    vec![
        TrafficRule {
            id: 1,
            name: "PEAK_HOUR_EXTENSION".to_string(),
            rule_type: RuleType::PeakHour,
            description: Some("Extends green during the morning peak".to_string()),
            active: true,
            priority: 1,
            condition: RuleCondition {
                min_vehicle_count: Some(25),
                max_vehicle_count: None,
                time_start: hm(7),
                time_end: hm(9),
                day_type: Some(DayType::Weekday),
            },
            action: RuleAction {
                base_green_duration: 30,
                green_duration_adjustment: 15,
                min_green_duration: Some(20),
                max_green_duration: Some(60),
            },
        },
        TrafficRule {
            id: 2,
            name: "HIGH_DENSITY_BOOST".to_string(),
            rule_type: RuleType::HighDensity,
            description: Some("Extends green once more than 40 vehicles queue".to_string()),
            active: true,
            priority: 2,
            condition: RuleCondition {
                min_vehicle_count: Some(40),
                day_type: Some(DayType::All),
                ..Default::default()
            },
            action: RuleAction {
                base_green_duration: 30,
                green_duration_adjustment: 20,
                min_green_duration: Some(25),
                max_green_duration: Some(75),
            },
        },
        TrafficRule {
            id: 3,
            name: "NIGHT_MODE_QUICK".to_string(),
            rule_type: RuleType::NightMode,
            description: Some("Short greens for light night traffic".to_string()),
            active: true,
            priority: 3,
            condition: RuleCondition {
                min_vehicle_count: None,
                max_vehicle_count: Some(15),
                time_start: hm(0),
                time_end: hm(6),
                day_type: Some(DayType::All),
            },
            action: RuleAction {
                base_green_duration: 30,
                green_duration_adjustment: -10,
                min_green_duration: Some(15),
                max_green_duration: Some(25),
            },
        },
    ]
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_are_valid() {
        let store = RuleStore::new(default_rules()).unwrap();
        assert_eq!(store.snapshot().rules.len(), 3);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_upsert_keeps_position_and_bumps_version() {
        let store = RuleStore::new(default_rules()).unwrap();
        let mut rule = store.get(1).unwrap();
        rule.priority = 5;
        let version = store.upsert(rule).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(version, 2);
        assert_eq!(snapshot.rules[0].id, 1);
        assert_eq!(snapshot.rules[0].priority, 5);
    }

    #[test]
    fn test_old_snapshot_unchanged_after_write() {
        let store = RuleStore::new(default_rules()).unwrap();
        let before = store.snapshot();
        store.set_active(2, false).unwrap();

        assert!(before.get(2).unwrap().active);
        assert!(!store.get(2).unwrap().active);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut rules = default_rules();
        rules[1].id = 1;
        assert!(RuleStore::new(rules).is_err());
    }

    #[test]
    fn test_remove_unknown_rule() {
        let store = RuleStore::new(default_rules()).unwrap();
        assert!(matches!(store.remove(99), Err(RuleError::NotFound(99))));
    }
}
