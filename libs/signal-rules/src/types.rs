//! Rule type definitions
//!
//! Core types for adaptive timing:
//! - TrafficRule: prioritized rule with an applicability predicate and a timing action
//! - RuleCondition: vehicle count bounds, time-of-day window, day type
//! - RuleAction: base green duration, adjustment, rule-specific bounds

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};

/// Rule identifier (row id in the external rule table)
pub type RuleId = i64;

// ============================================================================
// Traffic Rule
// ============================================================================

/// TrafficRule - immutable once stored; changes produce a new store version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRule {
    /// Unique identifier
    pub id: RuleId,

    /// Rule name (e.g. "HIGH_DENSITY_BOOST")
    pub name: String,

    /// Rule category
    #[serde(default)]
    pub rule_type: RuleType,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the rule takes part in selection
    #[serde(default = "default_active")]
    pub active: bool,

    /// Selection priority (1 = highest)
    pub priority: u32,

    /// Applicability predicate
    #[serde(default)]
    pub condition: RuleCondition,

    /// Timing action
    #[serde(default)]
    pub action: RuleAction,
}

fn default_active() -> bool {
    true
}

impl TrafficRule {
    /// Check rule data for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RuleError::invalid(&self.id.to_string(), "name is empty"));
        }
        if self.priority == 0 {
            return Err(RuleError::invalid(&self.name, "priority must be >= 1"));
        }
        if self.action.base_green_duration == 0 {
            return Err(RuleError::invalid(&self.name, "base green duration is zero"));
        }
        if let (Some(min), Some(max)) = (self.action.min_green_duration, self.action.max_green_duration)
        {
            if min > max {
                return Err(RuleError::invalid(
                    &self.name,
                    format!("min green {}s exceeds max green {}s", min, max),
                ));
            }
        }
        if let (Some(min), Some(max)) = (
            self.condition.min_vehicle_count,
            self.condition.max_vehicle_count,
        ) {
            if min > max {
                return Err(RuleError::invalid(
                    &self.name,
                    format!("min vehicle count {} exceeds max {}", min, max),
                ));
            }
        }
        if self.condition.time_start.is_some() != self.condition.time_end.is_some() {
            return Err(RuleError::invalid(
                &self.name,
                "time window needs both start and end",
            ));
        }
        Ok(())
    }

    /// Whether this rule's predicate holds for the supplied conditions
    pub fn matches(&self, vehicle_count: u32, now: NaiveDateTime) -> bool {
        self.active && self.condition.matches(vehicle_count, now)
    }
}

// ============================================================================
// Predicate & Action
// ============================================================================

/// Applicability predicate; unset bounds always pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_vehicle_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vehicle_count: Option<u32>,

    /// Window start (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_start: Option<NaiveTime>,

    /// Window end (inclusive); a start after the end wraps midnight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<NaiveTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_type: Option<DayType>,
}

impl RuleCondition {
    pub fn matches(&self, vehicle_count: u32, now: NaiveDateTime) -> bool {
        if let Some(min) = self.min_vehicle_count {
            if vehicle_count < min {
                return false;
            }
        }
        if let Some(max) = self.max_vehicle_count {
            if vehicle_count > max {
                return false;
            }
        }
        if let (Some(start), Some(end)) = (self.time_start, self.time_end) {
            if !time_in_window(now.time(), start, end) {
                return false;
            }
        }
        match self.day_type {
            Some(day_type) => day_type.includes(now.weekday()),
            None => true,
        }
    }
}

fn time_in_window(time: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        time >= start && time <= end
    } else {
        time >= start || time <= end
    }
}

/// Timing action (seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(default = "default_base_green")]
    pub base_green_duration: u32,

    /// Signed adjustment added to the base
    #[serde(default)]
    pub green_duration_adjustment: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_green_duration: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_green_duration: Option<u32>,
}

fn default_base_green() -> u32 {
    30
}

impl Default for RuleAction {
    fn default() -> Self {
        Self {
            base_green_duration: default_base_green(),
            green_duration_adjustment: 0,
            min_green_duration: None,
            max_green_duration: None,
        }
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Rule category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    PeakHour,
    HighDensity,
    LowDensity,
    NightMode,
    Weekend,
    WeatherBased,
    #[default]
    Custom,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::PeakHour => "PEAK_HOUR",
            RuleType::HighDensity => "HIGH_DENSITY",
            RuleType::LowDensity => "LOW_DENSITY",
            RuleType::NightMode => "NIGHT_MODE",
            RuleType::Weekend => "WEEKEND",
            RuleType::WeatherBased => "WEATHER_BASED",
            RuleType::Custom => "CUSTOM",
        }
    }
}

/// Day-type filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayType {
    Weekday,
    Weekend,
    All,
}

impl DayType {
    pub fn includes(&self, day: Weekday) -> bool {
        let weekend = matches!(day, Weekday::Sat | Weekday::Sun);
        match self {
            DayType::Weekday => !weekend,
            DayType::Weekend => weekend,
            DayType::All => true,
        }
    }
}
