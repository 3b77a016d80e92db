//! Shared helpers for runtime integration tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fleet_connector::FleetContext;
use fleet_connector::commands::{
    CommandFailure, CommandOptions, CommandOutcome, CommandRequest, parse_custom_command_args,
};
use fleet_connector::config::{FetchedMap, FleetConfig, RobotConfig, WatchdogConfig};
use fleet_connector::connector::FleetConnector;
use fleet_connector::runtime::{Terminator, dispatch_command};
use fleet_connector::transport::Pose;

/// What `execution_loop` does on each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBehavior {
    Succeed,
    Fail,
    Panic,
}

/// What `fetch_map` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBehavior {
    Found,
    Missing,
    Fail,
    Panic,
}

/// A connector whose behavior is set by its public fields.
pub struct Scripted {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub loops: AtomicUsize,
    pub fetches: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub loop_behavior: Mutex<LoopBehavior>,
    /// Publish a pose in this frame for every robot
    pub pose_frame: Mutex<Option<String>>,
    /// Poses published per robot per iteration
    pub poses_per_iteration: AtomicUsize,
    /// Only publish during the first iteration
    pub publish_once: AtomicBool,
    /// Blocks the worker thread inside `disconnect`
    pub disconnect_block: Mutex<Option<Duration>>,
    pub fetch_behavior: Mutex<FetchBehavior>,
    pub fetch_delay: Mutex<Duration>,
    /// Replace the fleet during `connect`
    pub fleet_on_connect: Mutex<Option<Vec<String>>>,
    pub online: AtomicBool,
    /// Dispatch a command from inside the loop once and keep the outcome
    pub dispatch_from_loop: AtomicBool,
    pub loop_dispatch_outcome: Mutex<Option<CommandOutcome>>,
}

impl Default for Scripted {
    fn default() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            loops: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            loop_behavior: Mutex::new(LoopBehavior::Succeed),
            pose_frame: Mutex::new(None),
            poses_per_iteration: AtomicUsize::new(1),
            publish_once: AtomicBool::new(false),
            disconnect_block: Mutex::new(None),
            fetch_behavior: Mutex::new(FetchBehavior::Found),
            fetch_delay: Mutex::new(Duration::ZERO),
            fleet_on_connect: Mutex::new(None),
            online: AtomicBool::new(true),
            dispatch_from_loop: AtomicBool::new(false),
            loop_dispatch_outcome: Mutex::new(None),
        }
    }
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publishing(frame: &str) -> Arc<Self> {
        let connector = Self::default();
        *connector.pose_frame.lock().unwrap() = Some(frame.to_string());
        Arc::new(connector)
    }
}

/// Bytes of a 1x1 PNG image.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[async_trait]
impl FleetConnector for Scripted {
    async fn connect(&self, ctx: &FleetContext) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("robot API unreachable");
        }
        let fleet = self.fleet_on_connect.lock().unwrap().clone();
        if let Some(ids) = fleet {
            ctx.update_fleet(ids.into_iter().map(RobotConfig::new).collect())?;
        }
        Ok(())
    }

    async fn disconnect(&self, _ctx: &FleetContext) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let block = *self.disconnect_block.lock().unwrap();
        if let Some(block) = block {
            std::thread::sleep(block);
        }
        Ok(())
    }

    async fn execution_loop(&self, ctx: &FleetContext) -> Result<()> {
        let iteration = self.loops.fetch_add(1, Ordering::SeqCst);

        if self.dispatch_from_loop.swap(false, Ordering::SeqCst) {
            let robot_id = ctx.robot_ids()[0].clone();
            let reporter = fleet_connector::commands::ResultReporter::new(|_| {});
            let outcome = dispatch_command(
                ctx,
                &robot_id,
                CommandRequest::new("ok", serde_json::json!([])),
                CommandOptions::new(reporter),
            );
            *self.loop_dispatch_outcome.lock().unwrap() = Some(outcome);
        }

        let frame = self.pose_frame.lock().unwrap().clone();
        if let Some(frame) = frame
            && (iteration == 0 || !self.publish_once.load(Ordering::SeqCst))
        {
            for robot_id in ctx.robot_ids() {
                for _ in 0..self.poses_per_iteration.load(Ordering::SeqCst) {
                    ctx.publish_robot_pose(&robot_id, &Pose::new(1.0, 2.0, 0.0, frame.clone()))?;
                }
            }
        }

        let behavior = *self.loop_behavior.lock().unwrap();
        match behavior {
            LoopBehavior::Succeed => Ok(()),
            LoopBehavior::Fail => anyhow::bail!("loop iteration failed"),
            LoopBehavior::Panic => panic!("loop iteration panicked"),
        }
    }

    async fn handle_command(
        &self,
        _ctx: &FleetContext,
        _robot_id: &str,
        request: CommandRequest,
        options: CommandOptions,
    ) -> Result<()> {
        match request.name.as_str() {
            "ok" => {
                options.result.success();
                Ok(())
            }
            "fail" => Err(CommandFailure::new("S", "D").into()),
            "error" => Err(anyhow::anyhow!("E")),
            "panic" => panic!("boom"),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                options.result.success();
                Ok(())
            }
            "customCommand" => {
                let (_script, _params) = parse_custom_command_args(&request.args)?;
                options.result.success();
                Ok(())
            }
            other => anyhow::bail!("unexpected command {}", other),
        }
    }

    async fn fetch_map(
        &self,
        _ctx: &FleetContext,
        _robot_id: &str,
        frame_id: &str,
    ) -> Result<Option<FetchedMap>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let behavior = *self.fetch_behavior.lock().unwrap();
        match behavior {
            FetchBehavior::Found => Ok(Some(FetchedMap {
                map_id: format!("{}-map", frame_id),
                map_label: Some("Fetched".to_string()),
                origin_x: 0.0,
                origin_y: 0.0,
                resolution: 0.05,
                image: TINY_PNG.to_vec(),
            })),
            FetchBehavior::Missing => Ok(None),
            FetchBehavior::Fail => anyhow::bail!("map server returned 503"),
            FetchBehavior::Panic => panic!("map decoder crashed"),
        }
    }

    fn is_robot_online(&self, _robot_id: &str) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Records termination requests instead of exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    pub codes: Mutex<Vec<i32>>,
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().unwrap().push(code);
    }
}

/// A fast-ticking config with the watchdog off.
pub fn fast_config<I, S>(robot_ids: I) -> FleetConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut config = FleetConfig::for_robots(robot_ids);
    config.update_freq = 50.0;
    config.watchdog = WatchdogConfig::disabled();
    config
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
