//! Fleet configuration model.
//!
//! A connector is configured from a single YAML file describing the fleet it
//! manages, the maps it can publish and the ambient settings (logging,
//! watchdog, credentials). Everything is validated once, at load time, so
//! the runtime can treat the resulting [`FleetConfig`] as trusted.
//!
//! # Configuration File Format
//!
//! ```yaml
//! connector_type: example_bot
//! connector_config:
//!   api_version: v2
//! update_freq: 2.0
//! fleet:
//!   - robot_id: robot-0
//!     cameras:
//!       - video_url: rtsp://10.0.0.4/stream
//!   - robot_id: robot-1
//! maps:
//!   warehouse:
//!     file: maps/warehouse.png
//!     map_id: warehouse
//!     origin_x: -12.5
//!     origin_y: -4.0
//!     resolution: 0.05
//! env_vars:
//!   FLEET_MANAGER_URL: http://localhost:8080
//! watchdog:
//!   heartbeat_interval_secs: 30
//!   health_check: true
//! logging:
//!   log_level: info
//! ```

use crate::errors::ConfigError;
use crate::logging::LoggingConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable read for the default platform API key.
pub const API_KEY_ENV: &str = "FLEET_CONNECTOR_API_KEY";
/// Environment variable read for the default platform API endpoint.
pub const API_URL_ENV: &str = "FLEET_CONNECTOR_API_URL";
/// Endpoint used when neither the file nor the environment provide one.
pub const DEFAULT_API_URL: &str = "https://control.fleet-platform.example/cloud_sdk_robot_config";
pub const DEFAULT_TIMEZONE: &str = "UTC";

const DEFAULT_HEARTBEAT_INTERVAL_SECS: f64 = 30.0;
const DEFAULT_TICK_INTERVAL_SECS: f64 = 1.0;
/// Health timeout used when heartbeats are disabled and no timeout is set.
const FALLBACK_HEALTH_TIMEOUT_SECS: f64 = 60.0;

/// A camera feed attached to a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub video_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<f64>,
}

/// A robot managed by the connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    pub robot_id: String,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl RobotConfig {
    pub fn new(robot_id: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            cameras: Vec::new(),
        }
    }
}

/// A map whose image lives on disk (the resident form).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDescriptor {
    /// Path to the PNG map image
    pub file: PathBuf,
    pub map_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_label: Option<String>,
    pub origin_x: f64,
    pub origin_y: f64,
    /// Meters per pixel
    pub resolution: f64,
}

impl MapDescriptor {
    fn validate(&self, frame_id: &str) -> Result<(), ConfigError> {
        if !self.file.is_file() {
            return Err(ConfigError::MapFileMissing {
                frame_id: frame_id.to_string(),
                path: self.file.clone(),
            });
        }
        let is_png = self
            .file
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if !is_png {
            return Err(ConfigError::MapFileNotPng {
                frame_id: frame_id.to_string(),
                path: self.file.clone(),
            });
        }
        Ok(())
    }
}

/// A map fetched on demand whose image is only held in memory (the transient form).
///
/// It becomes a [`MapDescriptor`] once its bytes are written to scratch storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMap {
    pub map_id: String,
    pub map_label: Option<String>,
    pub origin_x: f64,
    pub origin_y: f64,
    pub resolution: f64,
    /// PNG encoded image
    pub image: Vec<u8>,
}

impl FetchedMap {
    /// Convert into a resident descriptor pointing at `file`.
    pub fn into_resident(self, file: PathBuf) -> MapDescriptor {
        MapDescriptor {
            file,
            map_id: self.map_id,
            map_label: self.map_label,
            origin_x: self.origin_x,
            origin_y: self.origin_y,
            resolution: self.resolution,
        }
    }
}

/// Heartbeat and health-check settings for the resilience watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Seconds between liveness announcements. `0` disables heartbeats.
    pub heartbeat_interval_secs: f64,
    /// Terminate the process when publishing has been silent for too long.
    pub health_check: bool,
    /// Seconds without a successful publish before the process is terminated.
    /// Defaults to twice the heartbeat interval.
    pub health_timeout_secs: Option<f64>,
    /// How often the watchdog wakes up to evaluate heartbeat and health.
    pub tick_interval_secs: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            health_check: true,
            health_timeout_secs: None,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
        }
    }
}

impl WatchdogConfig {
    /// A watchdog that neither announces liveness nor checks health.
    pub fn disabled() -> Self {
        Self {
            heartbeat_interval_secs: 0.0,
            health_check: false,
            health_timeout_secs: None,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
        }
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0.0).then(|| saturating_secs(self.heartbeat_interval_secs))
    }

    /// Effective health timeout, or `None` when the health check is disabled.
    pub fn health_timeout(&self) -> Option<Duration> {
        if !self.health_check {
            return None;
        }
        Some(saturating_secs(self.health_timeout_secs_or_default()))
    }

    fn health_timeout_secs_or_default(&self) -> f64 {
        self.health_timeout_secs.unwrap_or_else(|| {
            if self.heartbeat_interval_secs > 0.0 {
                self.heartbeat_interval_secs * 2.0
            } else {
                FALLBACK_HEALTH_TIMEOUT_SECS
            }
        })
    }

    pub fn tick_interval(&self) -> Duration {
        saturating_secs(self.tick_interval_secs)
    }

    /// Non-fatal issues worth surfacing to the operator.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let (Some(timeout), Some(heartbeat)) = (self.health_timeout(), self.heartbeat_interval())
            && timeout <= heartbeat
        {
            warnings.push(format!(
                "watchdog.health_timeout_secs ({:.1}s) should be greater than \
                 watchdog.heartbeat_interval_secs ({:.1}s)",
                timeout.as_secs_f64(),
                heartbeat.as_secs_f64()
            ));
        }
        warnings
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.heartbeat_interval_secs.is_finite() || self.heartbeat_interval_secs < 0.0 {
            return Err(ConfigError::Watchdog(format!(
                "heartbeat_interval_secs must be >= 0, got {}",
                self.heartbeat_interval_secs
            )));
        }
        if !self.tick_interval_secs.is_finite() || self.tick_interval_secs <= 0.0 {
            return Err(ConfigError::Watchdog(format!(
                "tick_interval_secs must be > 0, got {}",
                self.tick_interval_secs
            )));
        }
        if let Some(timeout) = self.health_timeout_secs
            && (!timeout.is_finite() || timeout <= 0.0)
        {
            return Err(ConfigError::Watchdog(format!(
                "health_timeout_secs must be > 0, got {}",
                timeout
            )));
        }

        let durations = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("tick_interval_secs", self.tick_interval_secs),
            ("health_timeout_secs", self.health_timeout_secs_or_default()),
        ];
        for (field, secs) in durations {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::Watchdog(format!(
                    "{} is too large, got {}",
                    field, secs
                )));
            }
        }
        Ok(())
    }
}

fn default_update_freq() -> f64 {
    1.0
}

fn default_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok()
}

fn default_api_url() -> String {
    std::env::var(API_URL_ENV).unwrap_or_else(|_| DEFAULT_API_URL.to_string())
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

/// Validated configuration for one connector runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Connector flavor, checked by connectors with [`FleetConfig::expect_connector_type`]
    #[serde(default)]
    pub connector_type: String,
    /// Connector-specific settings, typed on demand with [`FleetConfig::connector_settings`]
    #[serde(default)]
    pub connector_config: serde_yaml::Value,
    #[serde(default = "default_api_key", skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_key: Option<String>,
    /// Execution loop frequency in Hz
    #[serde(default = "default_update_freq")]
    pub update_freq: f64,
    #[serde(default = "default_timezone")]
    pub location_tz: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_scripts_dir: Option<PathBuf>,
    /// frame_id to map mapping
    #[serde(default)]
    pub maps: HashMap<String, MapDescriptor>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    pub fleet: Vec<RobotConfig>,
}

impl FleetConfig {
    /// Build a configuration with default settings for the given robots.
    pub fn for_robots<I, S>(robot_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connector_type: String::new(),
            connector_config: serde_yaml::Value::Null,
            api_key: default_api_key(),
            api_url: default_api_url(),
            account_id: None,
            robot_key: None,
            update_freq: default_update_freq(),
            location_tz: default_timezone(),
            user_scripts_dir: None,
            maps: HashMap::new(),
            env_vars: HashMap::new(),
            logging: LoggingConfig::default(),
            watchdog: WatchdogConfig::default(),
            fleet: robot_ids.into_iter().map(RobotConfig::new).collect(),
        }
    }

    /// Load and validate a configuration file.
    ///
    /// Relative map paths are resolved against the directory holding the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: FleetConfig = serde_yaml::from_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_map_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_map_paths(&mut self, base: &Path) {
        for map in self.maps.values_mut() {
            if map.file.is_relative() {
                map.file = base.join(&map.file);
            }
        }
    }

    /// Check every invariant the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.is_empty() {
            return Err(ConfigError::EmptyFleet);
        }

        let mut seen = HashSet::new();
        for robot in &self.fleet {
            if !seen.insert(robot.robot_id.as_str()) {
                return Err(ConfigError::DuplicateRobotId(robot.robot_id.clone()));
            }
        }

        if !self.update_freq.is_finite()
            || self.update_freq <= 0.0
            || Duration::try_from_secs_f64(1.0 / self.update_freq).is_err()
        {
            return Err(ConfigError::InvalidUpdateFrequency(self.update_freq));
        }

        if self.location_tz.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::UnknownTimezone(self.location_tz.clone()));
        }

        for (frame_id, map) in &self.maps {
            map.validate(frame_id)?;
        }

        if has_whitespace(self.api_key.as_deref()) {
            return Err(ConfigError::Whitespace { field: "api_key" });
        }
        if has_whitespace(self.account_id.as_deref()) {
            return Err(ConfigError::Whitespace {
                field: "account_id",
            });
        }

        self.watchdog.validate()
    }

    /// Non-fatal issues, reported by `fleet-connector config validate`.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.watchdog.warnings();
        if self.api_key.is_none() {
            warnings.push(format!(
                "No api_key configured (set it in the file or via {})",
                API_KEY_ENV
            ));
        }
        if self.connector_type.is_empty() {
            warnings.push("connector_type is empty".to_string());
        }
        warnings
    }

    /// Robot ids in configuration order.
    pub fn robot_ids(&self) -> Vec<String> {
        self.fleet.iter().map(|r| r.robot_id.clone()).collect()
    }

    pub fn robot(&self, robot_id: &str) -> Option<&RobotConfig> {
        self.fleet.iter().find(|r| r.robot_id == robot_id)
    }

    /// Loop period derived from `update_freq`.
    pub fn update_period(&self) -> Duration {
        saturating_secs(1.0 / self.update_freq)
    }

    /// Reject configurations written for a different connector.
    pub fn expect_connector_type(&self, expected: &str) -> Result<(), ConfigError> {
        if self.connector_type != expected {
            return Err(ConfigError::ConnectorType {
                expected: expected.to_string(),
                found: self.connector_type.clone(),
            });
        }
        Ok(())
    }

    /// Deserialize `connector_config` into a connector-specific settings type.
    pub fn connector_settings<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_yaml::from_value(self.connector_config.clone())
            .map_err(ConfigError::ConnectorSettings)
    }

    /// Narrow the fleet down to a single robot.
    pub fn to_singular_config(&self, robot_id: &str) -> Result<Self, ConfigError> {
        let fleet: Vec<RobotConfig> = self
            .fleet
            .iter()
            .filter(|r| r.robot_id == robot_id)
            .cloned()
            .collect();

        if fleet.len() != 1 {
            return Err(ConfigError::RobotNotInFleet {
                robot_id: robot_id.to_string(),
                count: fleet.len(),
            });
        }

        Ok(Self {
            fleet,
            ..self.clone()
        })
    }

    /// Export `env_vars` into the process environment.
    ///
    /// # Safety
    ///
    /// Must be called while no other thread reads or writes the environment,
    /// i.e. before any runtime or worker thread is started.
    pub unsafe fn export_env_vars(&self) {
        for (name, value) in &self.env_vars {
            tracing::info!(name = %name, "Setting environment variable");
            // SAFETY: upheld by the caller, see the function docs.
            unsafe { std::env::set_var(name, value) };
        }
    }
}

/// `secs` as a `Duration`, clamped instead of panicking on overflow.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn has_whitespace(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.chars().any(char::is_whitespace))
}
