//! Simulated fleet: `fleet-connector run`.
//!
//! Drives every configured robot around a circle and publishes its pose,
//! odometry, battery level and host stats through the in-memory transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::Cli;
use fleet_connector::commands::{
    CommandFailure, CommandOptions, CommandRequest, CommandResult, names, parse_command_model,
};
use fleet_connector::config::FleetConfig;
use fleet_connector::connector::FleetConnector;
use fleet_connector::logging;
use fleet_connector::runtime::{FleetContext, FleetRuntime, RuntimeOptions};
use fleet_connector::transport::memory::MemoryTransport;
use fleet_connector::transport::{KeyValues, Odometry, Pose, SystemStats};

pub const CONNECTOR_TYPE: &str = "simulated";

/// Recent transport calls kept in memory while the simulation runs.
const EVENT_LOG_CAPACITY: usize = 1024;

fn default_speed() -> f64 {
    0.5
}

fn default_frame_id() -> String {
    "map".to_string()
}

fn default_radius() -> f64 {
    2.0
}

/// `connector_config` of the simulated connector.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedSettings {
    /// Meters per second
    #[serde(default = "default_speed")]
    pub speed: f64,
    #[serde(default = "default_frame_id")]
    pub frame_id: String,
    #[serde(default = "default_radius")]
    pub radius: f64,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            frame_id: default_frame_id(),
            radius: default_radius(),
        }
    }
}

#[derive(Debug, Clone)]
struct SimulatedRobot {
    angle: f64,
    battery: f64,
    speed: f64,
    last_message: Option<String>,
}

/// Parameters of the `set_speed.sh` custom command.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetSpeed {
    speed: f64,
}

pub struct SimulatedFleet {
    settings: SimulatedSettings,
    robots: Mutex<HashMap<String, SimulatedRobot>>,
}

impl SimulatedFleet {
    pub fn new(settings: SimulatedSettings) -> Self {
        Self {
            settings,
            robots: Mutex::new(HashMap::new()),
        }
    }

    fn with_robot<T>(&self, robot_id: &str, f: impl FnOnce(&mut SimulatedRobot) -> T) -> Result<T> {
        let mut robots = self
            .robots
            .lock()
            .map_err(|_| anyhow::anyhow!("simulation state poisoned"))?;
        let robot = robots
            .get_mut(robot_id)
            .with_context(|| format!("Robot {} is not simulated", robot_id))?;
        Ok(f(robot))
    }
}

#[async_trait]
impl FleetConnector for SimulatedFleet {
    async fn connect(&self, ctx: &FleetContext) -> Result<()> {
        let mut robots = self
            .robots
            .lock()
            .map_err(|_| anyhow::anyhow!("simulation state poisoned"))?;
        for (idx, robot_id) in ctx.robot_ids().into_iter().enumerate() {
            robots.insert(
                robot_id,
                SimulatedRobot {
                    angle: idx as f64,
                    battery: 1.0,
                    speed: self.settings.speed,
                    last_message: None,
                },
            );
        }
        tracing::info!(robots = robots.len(), "Simulation ready");
        Ok(())
    }

    async fn disconnect(&self, _ctx: &FleetContext) -> Result<()> {
        if let Ok(mut robots) = self.robots.lock() {
            robots.clear();
        }
        Ok(())
    }

    async fn execution_loop(&self, ctx: &FleetContext) -> Result<()> {
        let dt = ctx.config().update_period().as_secs_f64();
        let radius = self.settings.radius;

        for robot_id in ctx.robot_ids() {
            let robot = self.with_robot(&robot_id, |robot| {
                robot.angle += robot.speed * dt / radius;
                robot.battery = (robot.battery - 0.0005).max(0.0);
                robot.clone()
            })?;

            let pose = Pose::new(
                radius * robot.angle.cos(),
                radius * robot.angle.sin(),
                robot.angle + std::f64::consts::FRAC_PI_2,
                self.settings.frame_id.clone(),
            );
            ctx.publish_robot_pose(&robot_id, &pose)?;
            ctx.publish_robot_odometry(
                &robot_id,
                &Odometry {
                    linear_speed: Some(robot.speed),
                    angular_speed: Some(robot.speed / radius),
                    ..Odometry::default()
                },
            )?;

            let mut values = KeyValues::new();
            values.insert("battery".to_string(), json!(robot.battery));
            values.insert(
                "sampled_at".to_string(),
                json!(chrono::Utc::now().to_rfc3339()),
            );
            if let Some(message) = &robot.last_message {
                values.insert("last_message".to_string(), json!(message));
            }
            ctx.publish_robot_key_values(&robot_id, &values)?;
            ctx.publish_robot_system_stats(
                &robot_id,
                &SystemStats {
                    cpu_load_percentage: Some(0.1),
                    ram_usage_percentage: Some(0.25),
                    hdd_usage_percentage: Some(0.5),
                },
            )?;
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        _ctx: &FleetContext,
        robot_id: &str,
        request: CommandRequest,
        options: CommandOptions,
    ) -> Result<()> {
        match request.name.as_str() {
            names::CUSTOM_COMMAND => {
                let (script, params) = request.custom_script_args()?;
                match script.as_str() {
                    "set_speed.sh" => {
                        let args: SetSpeed = parse_command_model(params)?;
                        self.with_robot(robot_id, |robot| robot.speed = args.speed)?;
                        options.result.success();
                    }
                    "stop.sh" => {
                        self.with_robot(robot_id, |robot| robot.speed = 0.0)?;
                        options.result.success();
                    }
                    other => {
                        return Err(CommandFailure::new(
                            "Unknown script",
                            format!("Script '{}' is not supported", other),
                        )
                        .into());
                    }
                }
            }
            names::MESSAGE => {
                let text = request
                    .args
                    .get(0)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                tracing::info!(robot_id, message = %text, "Message received");
                let stdout = format!("Message delivered to {}", robot_id);
                self.with_robot(robot_id, |robot| robot.last_message = Some(text))?;
                options.result.report(CommandResult::success().with_stdout(stdout));
            }
            names::NAV_GOAL => {
                tracing::info!(
                    robot_id,
                    args = %request.args,
                    "Navigation goal ignored by simulation",
                );
                options.result.success();
            }
            other => {
                tracing::debug!(robot_id, command = other, "Ignoring command");
            }
        }
        Ok(())
    }
}

/// Load the configuration, run the simulated fleet and stop on Ctrl-C or after `duration`.
pub fn cmd_run(cli: &Cli, duration: Option<f64>) -> Result<()> {
    let config = FleetConfig::load(&cli.config)?;
    config.expect_connector_type(CONNECTOR_TYPE)?;
    let settings: SimulatedSettings = if config.connector_config.is_null() {
        SimulatedSettings::default()
    } else {
        config.connector_settings()?
    };

    // SAFETY: no other thread has been started yet.
    unsafe { config.export_env_vars() };
    let _log_guard = logging::init(&config.logging, cli.verbose)?;
    if !config.env_vars.is_empty() {
        tracing::info!(count = config.env_vars.len(), "Exported environment variables");
    }
    for warning in config.warnings() {
        tracing::warn!("{}", warning);
    }

    let transport = MemoryTransport::with_event_capacity(EVENT_LOG_CAPACITY);
    let runtime = Arc::new(FleetRuntime::with_options(
        config,
        Arc::new(SimulatedFleet::new(settings)),
        Arc::new(transport.clone()),
        RuntimeOptions::new(CONNECTOR_TYPE),
    )?);
    runtime.start()?;

    let stopper = runtime.clone();
    std::thread::Builder::new()
        .name("shutdown".to_string())
        .spawn(move || wait_for_shutdown(&stopper, duration))
        .context("Failed to spawn shutdown thread")?;

    runtime.join()?;

    println!();
    println!("Connector stopped.");
    for robot_id in runtime.robot_ids() {
        let counts = transport.event_counts(&robot_id);
        println!(
            "  {}: Published {} poses ({} messages)",
            robot_id, counts.poses, counts.total
        );
    }
    Ok(())
}

fn wait_for_shutdown(runtime: &FleetRuntime, duration: Option<f64>) {
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    match signals {
        Ok(signals) => signals.block_on(async {
            let timer = async {
                match duration {
                    Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
                _ = timer => tracing::info!("Run duration elapsed"),
            }
        }),
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up signal handling");
            return;
        }
    }

    if let Err(e) = runtime.stop() {
        tracing::error!(error = %e, "Failed to stop connector");
    }
}
