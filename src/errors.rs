//! Typed error hierarchy for the connector runtime.
//!
//! Three top-level enums cover the three failure domains:
//! - `ConfigError`: loading and validating a fleet configuration
//! - `TransportError`: failures reported by the platform transport
//! - `RuntimeError`: lifecycle, publishing and shutdown failures
//!
//! Command-level failures live in [`crate::commands`] because they are part of
//! the command handler contract rather than runtime faults.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a [`crate::config::FleetConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse fleet configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Fleet must contain at least one robot")]
    EmptyFleet,

    #[error("Robot ids must be unique (duplicate '{0}')")]
    DuplicateRobotId(String),

    #[error("update_freq must be positive and give a representable period, got {0}")]
    InvalidUpdateFrequency(f64),

    #[error("Unknown location_tz '{0}'")]
    UnknownTimezone(String),

    #[error("Map file for frame '{frame_id}' does not exist: {path}")]
    MapFileMissing { frame_id: String, path: PathBuf },

    #[error("Map file for frame '{frame_id}' must be a PNG file: {path}")]
    MapFileNotPng { frame_id: String, path: PathBuf },

    #[error("Whitespaces are not allowed in '{field}'")]
    Whitespace { field: &'static str },

    #[error("Expected connector type '{expected}' not '{found}'")]
    ConnectorType { expected: String, found: String },

    #[error("Invalid connector_config: {0}")]
    ConnectorSettings(#[source] serde_yaml::Error),

    #[error("Expected 1 robot configuration for robot {robot_id}, got {count}")]
    RobotNotInFleet { robot_id: String, count: usize },

    #[error("Invalid watchdog configuration: {0}")]
    Watchdog(String),
}

/// Errors reported by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Session for robot '{robot_id}' is unavailable: {reason}")]
    SessionUnavailable { robot_id: String, reason: String },

    #[error("Failed to publish {kind} for robot '{robot_id}': {reason}")]
    PublishFailed {
        robot_id: String,
        kind: &'static str,
        reason: String,
    },

    #[error("Session for robot '{0}' is closed")]
    Closed(String),
}

/// Errors from the connector runtime lifecycle and publish paths.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn connector thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Failed to build the connector event loop: {0}")]
    LoopInit(#[source] std::io::Error),

    #[error("Connect phase failed: {0}")]
    Connect(#[source] anyhow::Error),

    #[error("Failed to initialize session for robot '{robot_id}': {source}")]
    SessionInit {
        robot_id: String,
        #[source]
        source: TransportError,
    },

    #[error("Thread did not stop in time (waited {timeout:?})")]
    StopTimeout { timeout: Duration },

    #[error("Connector thread panicked: {0}")]
    WorkerPanicked(String),

    #[error("Robot '{0}' is not part of this fleet")]
    UnknownRobot(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_duplicate_robot_id_names_the_robot() {
        let err = ConfigError::DuplicateRobotId("robot-1".to_string());
        assert!(err.to_string().contains("robot-1"));
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn config_error_read_carries_path() {
        let path = PathBuf::from("/etc/fleet.yaml");
        let err = ConfigError::Read {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        match &err {
            ConfigError::Read { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Read variant"),
        }
    }

    #[test]
    fn runtime_error_stop_timeout_mentions_stop() {
        let err = RuntimeError::StopTimeout {
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("did not stop in time"));
    }

    #[test]
    fn runtime_error_converts_from_transport_error() {
        let inner = TransportError::Closed("robot-7".to_string());
        let err: RuntimeError = inner.into();
        match &err {
            RuntimeError::Transport(TransportError::Closed(id)) => assert_eq!(id, "robot-7"),
            _ => panic!("Expected RuntimeError::Transport(Closed(..))"),
        }
    }

    #[test]
    fn runtime_error_converts_from_config_error() {
        let err: RuntimeError = ConfigError::EmptyFleet.into();
        assert!(matches!(err, RuntimeError::Config(ConfigError::EmptyFleet)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::EmptyFleet);
        assert_std_error(&TransportError::Closed("r".into()));
        assert_std_error(&RuntimeError::UnknownRobot("r".into()));
    }
}
