#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Configuration for the AMS control core.
//!
//! One TOML document describes the whole installation: a `[manager]`
//! table, one `[feeder.<name>]` table per feeder mainboard, one
//! `[fps.<name>]` table per pressure sensor, and one `[group.<name>]`
//! table per lane group. Every tunable has a default; `validate()` checks
//! ranges and cross-references after parsing.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

/// Bays per feeder unit; fixed by the hardware.
const BAY_COUNT: usize = 4;

#[derive(Debug, Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClogSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerCfg {
    /// Coast distance past a runout trigger before the reload commits, mm.
    pub reload_before_toolhead_distance: f64,
    pub clog_sensitivity: ClogSensitivity,
    /// Travel past the trigger before the follower coasts, mm.
    pub runout_pause_distance: f64,
    pub bowden_clear_grace_ms: u64,
}

impl Default for ManagerCfg {
    fn default() -> Self {
        Self {
            reload_before_toolhead_distance: 0.0,
            clog_sensitivity: ClogSensitivity::default(),
            runout_pause_distance: 60.0,
            bowden_clear_grace_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeederCfg {
    pub fps_upper_threshold: f32,
    pub fps_lower_threshold: f32,
    pub f1s_hes_on: [f32; BAY_COUNT],
    pub hub_hes_on: [f32; BAY_COUNT],
    pub ticks_per_mm: f64,
    pub load_retry_max: u32,
    pub unload_retry_max: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub min_progress_ticks: u32,
    pub stuck_threshold_ms: u64,
    pub auto_unload_on_failed_load: bool,
    pub load_timeout_ms: u64,
    pub unload_timeout_ms: u64,
    pub pressure_grace_ms: u64,
}

impl Default for FeederCfg {
    fn default() -> Self {
        Self {
            fps_upper_threshold: 0.65,
            fps_lower_threshold: 0.35,
            f1s_hes_on: [0.5; BAY_COUNT],
            hub_hes_on: [0.5; BAY_COUNT],
            ticks_per_mm: 40.0,
            load_retry_max: 3,
            unload_retry_max: 2,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 5_000,
            min_progress_ticks: 4,
            stuck_threshold_ms: 1_000,
            auto_unload_on_failed_load: true,
            load_timeout_ms: 60_000,
            unload_timeout_ms: 60_000,
            pressure_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FpsCfg {
    /// ADC pin name on the host board.
    pub pin: String,
    pub extruder: String,
    /// Feeders that may serve this sensor, in preference order.
    pub feeders: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupCfg {
    /// Ordered `feeder-bay` tokens, e.g. `"ams0-1"`.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingCfg {
    /// Log file path; unset means terminal only.
    pub file: Option<String>,
    /// Level when RUST_LOG is not set, e.g. "info", "debug".
    pub level: Option<String>,
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerCfg,
    #[serde(default)]
    pub feeder: BTreeMap<String, FeederCfg>,
    #[serde(default)]
    pub fps: BTreeMap<String, FpsCfg>,
    #[serde(default)]
    pub group: BTreeMap<String, GroupCfg>,
    #[serde(default)]
    pub logging: LoggingCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Split a `feeder-bay` member token. The bay is the digit after the last
/// dash, so feeder names may themselves contain dashes.
pub fn parse_member(token: &str) -> Result<(String, u8), ConfigError> {
    let (feeder, bay) = token
        .rsplit_once('-')
        .ok_or_else(|| ConfigError(format!("member '{token}' is not feeder-bay")))?;
    let bay: u8 = bay
        .parse()
        .map_err(|_| ConfigError(format!("member '{token}' has a non-numeric bay")))?;
    if usize::from(bay) >= BAY_COUNT {
        return Err(ConfigError(format!(
            "member '{token}' bay out of range 0..{BAY_COUNT}"
        )));
    }
    if feeder.is_empty() {
        return Err(ConfigError(format!("member '{token}' has an empty feeder")));
    }
    Ok((feeder.to_string(), bay))
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feeder.is_empty() {
            return Err(ConfigError("at least one [feeder.<name>] is required".into()));
        }
        for (name, f) in &self.feeder {
            for (key, v) in [
                ("fps_upper_threshold", f.fps_upper_threshold),
                ("fps_lower_threshold", f.fps_lower_threshold),
            ] {
                if v <= 0.0 || v >= 1.0 {
                    return Err(ConfigError(format!(
                        "feeder {name}: {key} must be inside (0, 1)"
                    )));
                }
            }
            if f.fps_lower_threshold >= f.fps_upper_threshold {
                return Err(ConfigError(format!(
                    "feeder {name}: fps_lower_threshold must be below fps_upper_threshold"
                )));
            }
            if f.ticks_per_mm <= 0.0 {
                return Err(ConfigError(format!(
                    "feeder {name}: ticks_per_mm must be > 0"
                )));
            }
            if f.retry_backoff_max_ms < f.retry_backoff_base_ms {
                return Err(ConfigError(format!(
                    "feeder {name}: retry_backoff_max_ms must be >= retry_backoff_base_ms"
                )));
            }
            if f.stuck_threshold_ms == 0 {
                return Err(ConfigError(format!(
                    "feeder {name}: stuck_threshold_ms must be > 0"
                )));
            }
        }
        for (name, fps) in &self.fps {
            if fps.feeders.is_empty() {
                return Err(ConfigError(format!("fps {name}: feeders must be non-empty")));
            }
            for feeder in &fps.feeders {
                if !self.feeder.contains_key(feeder) {
                    return Err(ConfigError(format!(
                        "fps {name}: unknown feeder '{feeder}'"
                    )));
                }
            }
        }
        for (name, group) in &self.group {
            if group.members.is_empty() {
                return Err(ConfigError(format!(
                    "group {name}: members must be non-empty"
                )));
            }
            for token in &group.members {
                let (feeder, _bay) = parse_member(token)
                    .map_err(|e| ConfigError(format!("group {name}: {e}")))?;
                if !self.feeder.contains_key(&feeder) {
                    return Err(ConfigError(format!(
                        "group {name}: unknown feeder '{feeder}'"
                    )));
                }
            }
        }
        if self.manager.runout_pause_distance < 0.0
            || self.manager.reload_before_toolhead_distance < 0.0
        {
            return Err(ConfigError(
                "manager distances must be non-negative".into(),
            ));
        }
        Ok(())
    }
}
