//! The seam between the runtime and the platform transport client.
//!
//! A [`Transport`] hands out one [`RobotSession`] per robot. Sessions are
//! synchronous: publishing is expected to enqueue and return quickly, and
//! command callbacks are invoked from the transport's own threads.

pub mod memory;
pub mod messages;

use std::path::Path;
use std::sync::Arc;

use crate::commands::{CommandOptions, CommandRequest};
use crate::config::CameraConfig;
use crate::errors::TransportError;

pub use messages::{KeyValues, MapMessage, Odometry, Pose, SystemStats};

/// Callback invoked by the transport for every incoming command.
///
/// It may block; the transport must not call it while holding locks the
/// runtime could need.
pub type CommandCallback = Arc<dyn Fn(CommandRequest, CommandOptions) + Send + Sync>;

/// Callback polled by the transport to report a robot's online status.
pub type OnlineStatusCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// File name pattern of user scripts registered as commands.
pub const USER_SCRIPTS_EXEC_REGEX: &str = r".*\.sh";

/// A live connection between one robot and the platform.
pub trait RobotSession: Send + Sync {
    fn robot_id(&self) -> &str;

    fn publish_pose(&self, pose: &Pose) -> Result<(), TransportError>;

    fn publish_odometry(&self, odometry: &Odometry) -> Result<(), TransportError>;

    fn publish_key_values(&self, values: &KeyValues) -> Result<(), TransportError>;

    fn publish_system_stats(&self, stats: &SystemStats) -> Result<(), TransportError>;

    fn publish_map(&self, map: &MapMessage) -> Result<(), TransportError>;

    fn register_command_callback(&self, callback: CommandCallback);

    fn set_online_status_callback(&self, callback: OnlineStatusCallback);

    fn register_camera(&self, camera_id: &str, camera: &CameraConfig)
    -> Result<(), TransportError>;

    /// Expose executables in `path` whose name matches `exec_name_regex` as commands.
    fn register_commands_path(
        &self,
        path: &Path,
        exec_name_regex: &str,
    ) -> Result<(), TransportError>;

    /// Tell the platform the robot is alive without sending telemetry.
    fn announce_liveness(&self) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

/// Factory of robot sessions.
pub trait Transport: Send + Sync {
    fn session(&self, robot_id: &str) -> Result<Arc<dyn RobotSession>, TransportError>;
}
