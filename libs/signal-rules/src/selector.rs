//! Rule Selector - pick the single applicable rule and compute its green duration
//!
//! Selection:
//! 1. Keep active rules whose predicate holds for `(vehicle_count, now)`
//! 2. Order by ascending priority; ties keep insertion order (stable sort)
//! 3. Duration = clamp(base + adjustment, rule min, rule max)
//!    + density boost, then clamp to the global safety band
//!
//! No rule is not an error: the caller keeps its current timing.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RuleError};
use crate::types::{RuleId, RuleType, TrafficRule};

/// Default global floor (seconds)
pub const DEFAULT_GLOBAL_MIN_GREEN: u32 = 15;
/// Default global ceiling (seconds)
pub const DEFAULT_GLOBAL_MAX_GREEN: u32 = 90;

/// Additive boost applied when the vehicle count exceeds a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensityBoost {
    /// Boost applies when `vehicle_count > above`
    pub above: u32,
    pub boost_secs: u32,
}

/// Selector tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_global_min")]
    pub global_min_green: u32,

    #[serde(default = "default_global_max")]
    pub global_max_green: u32,

    /// Boost tiers; the highest matching threshold wins
    #[serde(default = "default_density_boosts")]
    pub density_boosts: Vec<DensityBoost>,
}

fn default_global_min() -> u32 {
    DEFAULT_GLOBAL_MIN_GREEN
}

fn default_global_max() -> u32 {
    DEFAULT_GLOBAL_MAX_GREEN
}

fn default_density_boosts() -> Vec<DensityBoost> {
    vec![
        DensityBoost {
            above: 40,
            boost_secs: 10,
        },
        DensityBoost {
            above: 25,
            boost_secs: 5,
        },
    ]
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            global_min_green: default_global_min(),
            global_max_green: default_global_max(),
            density_boosts: default_density_boosts(),
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.global_min_green == 0 || self.global_min_green > self.global_max_green {
            return Err(RuleError::InvalidConfig(format!(
                "global band [{}, {}] is empty or starts at zero",
                self.global_min_green, self.global_max_green
            )));
        }
        Ok(())
    }

    /// Boost for the given count (highest threshold exceeded)
    pub fn density_boost(&self, vehicle_count: u32) -> u32 {
        self.density_boosts
            .iter()
            .filter(|tier| vehicle_count > tier.above)
            .max_by_key(|tier| tier.above)
            .map(|tier| tier.boost_secs)
            .unwrap_or(0)
    }
}

/// Summary of an applicable rule, in selection order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleCandidate {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub rule_type: RuleType,
    pub priority: u32,
}

impl From<&TrafficRule> for RuleCandidate {
    fn from(rule: &TrafficRule) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            rule_type: rule.rule_type,
            priority: rule.priority,
        }
    }
}

/// Outcome of a successful selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSelection {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub rule_type: RuleType,
    /// Rule base duration, before adjustment
    pub base_duration: u32,
    /// Density boost that was added
    pub density_boost: u32,
    /// Final duration after both clamps
    pub new_duration: u32,
    /// Every applicable rule, selected one first
    pub candidates: Vec<RuleCandidate>,
}

/// Density classification of a vehicle count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DensityLevel {
    Low,
    Medium,
    High,
    Critical,
}

pub fn density_level(vehicle_count: u32) -> DensityLevel {
    match vehicle_count {
        0..=9 => DensityLevel::Low,
        10..=29 => DensityLevel::Medium,
        30..=49 => DensityLevel::High,
        _ => DensityLevel::Critical,
    }
}

/// Applicable rules in selection order (ascending priority, stable)
pub fn applicable_rules(
    rules: &[TrafficRule],
    vehicle_count: u32,
    now: NaiveDateTime,
) -> Vec<&TrafficRule> {
    let mut applicable: Vec<&TrafficRule> = rules
        .iter()
        .filter(|rule| rule.matches(vehicle_count, now))
        .collect();
    applicable.sort_by_key(|rule| rule.priority);
    applicable
}

/// Select the highest-priority applicable rule
pub fn select_rule(
    rules: &[TrafficRule],
    vehicle_count: u32,
    now: NaiveDateTime,
    config: &SelectorConfig,
) -> Result<Option<RuleSelection>> {
    let applicable = applicable_rules(rules, vehicle_count, now);
    let Some(selected) = applicable.first() else {
        debug!("No applicable rule for {} vehicles at {}", vehicle_count, now);
        return Ok(None);
    };

    let new_duration = compute_duration(selected, vehicle_count, config)?;
    Ok(Some(RuleSelection {
        rule_id: selected.id,
        rule_name: selected.name.clone(),
        rule_type: selected.rule_type,
        base_duration: selected.action.base_green_duration,
        density_boost: config.density_boost(vehicle_count),
        new_duration,
        candidates: applicable.iter().map(|r| RuleCandidate::from(*r)).collect(),
    }))
}

/// Use one specific rule regardless of its predicate (manual override)
pub fn select_manual(
    rules: &[TrafficRule],
    rule_id: RuleId,
    vehicle_count: u32,
    config: &SelectorConfig,
) -> Result<RuleSelection> {
    let rule = rules
        .iter()
        .find(|r| r.id == rule_id)
        .ok_or(RuleError::NotFound(rule_id))?;
    if !rule.active {
        return Err(RuleError::Inactive(rule_id));
    }

    let new_duration = compute_duration(rule, vehicle_count, config)?;
    Ok(RuleSelection {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        rule_type: rule.rule_type,
        base_duration: rule.action.base_green_duration,
        density_boost: config.density_boost(vehicle_count),
        new_duration,
        candidates: vec![RuleCandidate::from(rule)],
    })
}

/// Two-stage clamp: rule bounds, density boost, then the global band
pub fn compute_duration(
    rule: &TrafficRule,
    vehicle_count: u32,
    config: &SelectorConfig,
) -> Result<u32> {
    rule.validate()?;
    config.validate()?;

    let action = &rule.action;
    let mut duration = i64::from(action.base_green_duration)
        + i64::from(action.green_duration_adjustment);
    if let Some(min) = action.min_green_duration {
        duration = duration.max(i64::from(min));
    }
    if let Some(max) = action.max_green_duration {
        duration = duration.min(i64::from(max));
    }

    duration += i64::from(config.density_boost(vehicle_count));

    let clamped = duration.clamp(
        i64::from(config.global_min_green),
        i64::from(config.global_max_green),
    );
    Ok(clamped as u32)
}
