//! Intersection master data
//!
//! Plain value structs handed to the arbiter at registration. Identity is
//! immutable during arbitration; phases are validated into a
//! [`PhasePlan`](crate::sequencer::PhasePlan) before use.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArbiterError;

pub type IntersectionId = i64;
pub type PhaseNumber = u32;
pub type GroupId = String;

// ============================================================================
// Intersection
// ============================================================================

/// Intersection with its phase set and active configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intersection {
    pub id: IntersectionId,
    pub name: String,

    #[serde(default)]
    pub lane_count: u32,

    /// Fixed geometry features (e.g. "pedestrian_crossing", "turn_pocket")
    #[serde(default)]
    pub features: Vec<String>,

    #[serde(default)]
    pub config: IntersectionConfig,

    pub phases: Vec<Phase>,
}

impl Intersection {
    /// Coordination group; ungrouped intersections form a group of one
    pub fn group_id(&self) -> GroupId {
        self.config
            .coordination_group
            .clone()
            .unwrap_or_else(|| format!("intersection-{}", self.id))
    }
}

/// Active intersection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntersectionConfig {
    /// Coordination group membership (red-hold scope during preemption)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_group: Option<String>,

    /// Check cross-intersection phase conflicts before advancing
    #[serde(default)]
    pub coordination_enabled: bool,

    /// Advisory offset for an external coordinator; not used for scheduling here
    #[serde(default)]
    pub coordination_offset_secs: i32,

    /// Consult the rule selector on every tick
    #[serde(default = "default_true")]
    pub adaptive_timing_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for IntersectionConfig {
    fn default() -> Self {
        Self {
            coordination_group: None,
            coordination_enabled: false,
            coordination_offset_secs: 0,
            adaptive_timing_enabled: true,
        }
    }
}

// ============================================================================
// Phase
// ============================================================================

/// Timed signal state of one intersection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Unique within the intersection
    pub number: PhaseNumber,

    #[serde(default)]
    pub name: String,

    pub sequence_order: u32,

    pub min_duration: u32,
    pub max_duration: u32,
    pub default_duration: u32,

    #[serde(default = "default_priority_level")]
    pub priority_level: u8,

    /// May be bypassed when no demand is registered for it
    #[serde(default)]
    pub can_skip: bool,

    #[serde(default)]
    pub conflicting_phases: BTreeSet<PhaseNumber>,

    #[serde(default)]
    pub compatible_phases: BTreeSet<PhaseNumber>,

    /// Approach directions this phase gives green to
    #[serde(default)]
    pub approaches: Vec<Direction>,

    /// Explicit successor; defaults to the next phase in sequence order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_phase: Option<PhaseNumber>,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_priority_level() -> u8 {
    1
}

impl Phase {
    /// Clamp a requested duration into this phase's own bounds
    pub fn clamp_duration(&self, requested: u32) -> u32 {
        requested.clamp(self.min_duration, self.max_duration)
    }

    pub fn serves(&self, direction: Direction) -> bool {
        self.approaches.contains(&direction)
    }

    /// Mutual conflict check (either side may declare it)
    pub fn conflicts_with(&self, other: &Phase) -> bool {
        self.conflicting_phases.contains(&other.number)
            || other.conflicting_phases.contains(&self.number)
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Approach direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::North => "NORTH",
            Direction::South => "SOUTH",
            Direction::East => "EAST",
            Direction::West => "WEST",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ArbiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORTH" | "N" => Ok(Direction::North),
            "SOUTH" | "S" => Ok(Direction::South),
            "EAST" | "E" => Ok(Direction::East),
            "WEST" | "W" => Ok(Direction::West),
            other => Err(ArbiterError::validation(format!(
                "unknown direction '{}'",
                other
            ))),
        }
    }
}

/// Emergency vehicle type; ranks preemption priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    Ambulance,
    FireTruck,
    Police,
    Military,
}

impl VehicleType {
    /// 1 = highest
    pub fn priority_level(&self) -> u8 {
        match self {
            VehicleType::Ambulance => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Ambulance => "AMBULANCE",
            VehicleType::FireTruck => "FIRE_TRUCK",
            VehicleType::Police => "POLICE",
            VehicleType::Military => "MILITARY",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = ArbiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "AMBULANCE" => Ok(VehicleType::Ambulance),
            "FIRE_TRUCK" => Ok(VehicleType::FireTruck),
            "POLICE" => Ok(VehicleType::Police),
            "MILITARY" => Ok(VehicleType::Military),
            other => Err(ArbiterError::validation(format!(
                "unknown vehicle type '{}'",
                other
            ))),
        }
    }
}
