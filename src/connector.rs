//! User-facing connector traits.
//!
//! A [`FleetConnector`] implements the business logic of one fleet: how to
//! reach the robots, what to publish each loop iteration and how to execute
//! commands. The [`crate::runtime::FleetRuntime`] drives it.
//!
//! Connectors that manage a single robot implement [`RobotConnector`] instead
//! and are wrapped in [`SingleRobot`], which fixes the robot id and forwards
//! every call.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::commands::{CommandOptions, CommandRequest};
use crate::config::{FetchedMap, FleetConfig};
use crate::errors::RuntimeError;
use crate::runtime::{FleetContext, FleetRuntime, RuntimeOptions};
use crate::transport::{KeyValues, Odometry, Pose, RobotSession, SystemStats, Transport};

/// Callbacks of a connector managing a fleet of robots.
///
/// All async methods run on the runtime's worker loop. They should not block
/// the thread; use `tokio::task::spawn_blocking` for blocking work.
#[async_trait]
pub trait FleetConnector: Send + Sync + 'static {
    /// Connect to external services.
    ///
    /// Runs before any robot session exists, so [`FleetContext::update_fleet`]
    /// may be used here to discover robots.
    async fn connect(&self, ctx: &FleetContext) -> Result<()>;

    /// Disconnect from external services. Runs after sessions were closed.
    async fn disconnect(&self, ctx: &FleetContext) -> Result<()>;

    /// One iteration of the periodic update loop.
    async fn execution_loop(&self, ctx: &FleetContext) -> Result<()>;

    /// Handle a command sent to `robot_id`.
    ///
    /// Report success through `options.result`. Returning a
    /// [`crate::commands::CommandFailure`] reports its summary and detail;
    /// any other error reports a generic failure.
    async fn handle_command(
        &self,
        ctx: &FleetContext,
        robot_id: &str,
        request: CommandRequest,
        options: CommandOptions,
    ) -> Result<()>;

    /// Fetch the map of a frame that is not in the configuration.
    async fn fetch_map(
        &self,
        _ctx: &FleetContext,
        _robot_id: &str,
        _frame_id: &str,
    ) -> Result<Option<FetchedMap>> {
        Ok(None)
    }

    /// Polled by the transport from its own thread.
    fn is_robot_online(&self, _robot_id: &str) -> bool {
        true
    }
}

/// A [`FleetContext`] narrowed to one robot.
#[derive(Clone, Debug)]
pub struct RobotContext {
    fleet: FleetContext,
    robot_id: String,
}

impl RobotContext {
    pub fn new(fleet: FleetContext, robot_id: impl Into<String>) -> Self {
        Self {
            fleet,
            robot_id: robot_id.into(),
        }
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn fleet(&self) -> &FleetContext {
        &self.fleet
    }

    pub fn config(&self) -> FleetConfig {
        self.fleet.config()
    }

    pub fn session(&self) -> Result<Arc<dyn RobotSession>, RuntimeError> {
        self.fleet.robot_session(&self.robot_id)
    }

    pub fn publish_pose(&self, pose: &Pose) -> Result<(), RuntimeError> {
        self.fleet.publish_robot_pose(&self.robot_id, pose)
    }

    pub fn publish_map(&self, frame_id: &str, is_update: bool) -> Result<(), RuntimeError> {
        self.fleet
            .publish_robot_map(&self.robot_id, frame_id, is_update)
    }

    pub fn publish_odometry(&self, odometry: &Odometry) -> Result<(), RuntimeError> {
        self.fleet.publish_robot_odometry(&self.robot_id, odometry)
    }

    pub fn publish_key_values(&self, values: &KeyValues) -> Result<(), RuntimeError> {
        self.fleet.publish_robot_key_values(&self.robot_id, values)
    }

    pub fn publish_system_stats(&self, stats: &SystemStats) -> Result<(), RuntimeError> {
        self.fleet.publish_robot_system_stats(&self.robot_id, stats)
    }
}

/// Callbacks of a connector managing exactly one robot.
#[async_trait]
pub trait RobotConnector: Send + Sync + 'static {
    async fn connect(&self, ctx: &RobotContext) -> Result<()>;

    async fn disconnect(&self, ctx: &RobotContext) -> Result<()>;

    async fn execution_loop(&self, ctx: &RobotContext) -> Result<()>;

    async fn handle_command(
        &self,
        ctx: &RobotContext,
        request: CommandRequest,
        options: CommandOptions,
    ) -> Result<()>;

    async fn fetch_map(&self, _ctx: &RobotContext, _frame_id: &str) -> Result<Option<FetchedMap>> {
        Ok(None)
    }

    fn is_online(&self) -> bool {
        true
    }
}

/// Adapts a [`RobotConnector`] to the fleet runtime.
pub struct SingleRobot<C> {
    robot_id: String,
    connector: C,
}

impl<C: RobotConnector> SingleRobot<C> {
    pub fn new(robot_id: impl Into<String>, connector: C) -> Self {
        Self {
            robot_id: robot_id.into(),
            connector,
        }
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn inner(&self) -> &C {
        &self.connector
    }

    /// Build a runtime for `robot_id`, narrowing `config` to that robot.
    pub fn runtime(
        robot_id: &str,
        config: &FleetConfig,
        connector: C,
        transport: Arc<dyn Transport>,
    ) -> Result<FleetRuntime, RuntimeError> {
        Self::runtime_with_options(
            robot_id,
            config,
            connector,
            transport,
            RuntimeOptions::new(robot_id),
        )
    }

    pub fn runtime_with_options(
        robot_id: &str,
        config: &FleetConfig,
        connector: C,
        transport: Arc<dyn Transport>,
        options: RuntimeOptions,
    ) -> Result<FleetRuntime, RuntimeError> {
        let config = config.to_singular_config(robot_id)?;
        FleetRuntime::with_options(
            config,
            Arc::new(Self::new(robot_id, connector)),
            transport,
            options,
        )
    }

    fn context(&self, fleet: &FleetContext) -> RobotContext {
        RobotContext::new(fleet.clone(), self.robot_id.clone())
    }
}

#[async_trait]
impl<C: RobotConnector> FleetConnector for SingleRobot<C> {
    async fn connect(&self, ctx: &FleetContext) -> Result<()> {
        self.connector.connect(&self.context(ctx)).await
    }

    async fn disconnect(&self, ctx: &FleetContext) -> Result<()> {
        self.connector.disconnect(&self.context(ctx)).await
    }

    async fn execution_loop(&self, ctx: &FleetContext) -> Result<()> {
        self.connector.execution_loop(&self.context(ctx)).await
    }

    async fn handle_command(
        &self,
        ctx: &FleetContext,
        robot_id: &str,
        request: CommandRequest,
        options: CommandOptions,
    ) -> Result<()> {
        if robot_id != self.robot_id {
            tracing::warn!(robot_id, expected = %self.robot_id, "Command for another robot");
        }
        self.connector
            .handle_command(&self.context(ctx), request, options)
            .await
    }

    async fn fetch_map(
        &self,
        ctx: &FleetContext,
        _robot_id: &str,
        frame_id: &str,
    ) -> Result<Option<FetchedMap>> {
        self.connector.fetch_map(&self.context(ctx), frame_id).await
    }

    fn is_robot_online(&self, _robot_id: &str) -> bool {
        self.connector.is_online()
    }
}
