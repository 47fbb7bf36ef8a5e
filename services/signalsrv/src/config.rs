//! Service configuration
//!
//! Loaded with figment, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. YAML file (`config/signalsrv.yaml` or `--config`)
//! 3. Environment variables `SIGNALSRV_<SECTION>__<KEY>`
//!    (e.g. `SIGNALSRV_SERVICE__TICK_INTERVAL_MS=500`)

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use common::LoggingConfig;
use signal_arbiter::{ArbiterSettings, Intersection, DEFAULT_OVERRIDE_DURATION_SECS};
use signal_rules::{SelectorConfig, TrafficRule};

pub const DEFAULT_CONFIG_PATH: &str = "config/signalsrv.yaml";
pub const ENV_PREFIX: &str = "SIGNALSRV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub arbiter: ArbiterConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub intersections: Vec<Intersection>,

    /// Empty means the built-in default rules
    #[serde(default)]
    pub rules: Vec<TrafficRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            logging: LoggingConfig {
                file_prefix: Some("signalsrv".to_string()),
                ..Default::default()
            },
            arbiter: ArbiterConfig::default(),
            selector: SelectorConfig::default(),
            ledger: LedgerConfig::default(),
            intersections: Vec::new(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Worker tick period
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_service_name() -> String {
    "signalsrv".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Emergency override length before automatic reversion
    #[serde(default = "default_override_duration")]
    pub override_duration_secs: u32,
}

fn default_override_duration() -> u32 {
    DEFAULT_OVERRIDE_DURATION_SECS
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            override_duration_secs: default_override_duration(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-lines export file; every ledger entry is appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,
}

impl Config {
    /// Load from the default locations
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path, ENV_PREFIX)?)
    }

    /// Layered sources without extraction
    pub fn figment(path: Option<&Path>, env_prefix: &str) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {:?} not found", path);
                }
                figment = figment.merge(Yaml::file(path));
            },
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    figment = figment.merge(Yaml::file(default_path));
                } else {
                    warn!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
                }
            },
        }

        Ok(figment.merge(Env::prefixed(env_prefix).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.tick_interval_ms == 0 {
            bail!("service.tick_interval_ms must be greater than zero");
        }
        if self.intersections.is_empty() {
            bail!("no intersections configured");
        }

        let mut ids = BTreeSet::new();
        for intersection in &self.intersections {
            if !ids.insert(intersection.id) {
                bail!("intersection {} configured twice", intersection.id);
            }
        }

        self.logging.validate()?;
        self.arbiter_settings()
            .validate()
            .context("invalid arbiter settings")?;
        Ok(())
    }

    pub fn arbiter_settings(&self) -> ArbiterSettings {
        ArbiterSettings {
            override_duration_secs: self.arbiter.override_duration_secs,
            selector: self.selector.clone(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.service.tick_interval_ms)
    }
}
