use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::dispatch::LoopHandle;
use super::maps::{self, MapCoordinator};
use super::watchdog::Watchdog;
use crate::config::{FleetConfig, MapDescriptor, RobotConfig};
use crate::connector::FleetConnector;
use crate::errors::{ConfigError, RuntimeError, TransportError};
use crate::sync::{lock, read, write};
use crate::transport::{KeyValues, MapMessage, Odometry, Pose, RobotSession, SystemStats};

struct ContextInner {
    config: RwLock<FleetConfig>,
    connector: Arc<dyn FleetConnector>,
    sessions: RwLock<HashMap<String, Arc<dyn RobotSession>>>,
    last_frames: Mutex<HashMap<String, String>>,
    maps: MapCoordinator,
    watchdog: Arc<Watchdog>,
    loop_handle: RwLock<Option<LoopHandle>>,
}

/// Shared state of a running fleet, handed to every connector callback.
///
/// Cheap to clone. All publish methods may be called from any thread; they
/// only hold internal locks for the duration of a map lookup.
#[derive(Clone)]
pub struct FleetContext {
    inner: Arc<ContextInner>,
}

impl FleetContext {
    pub(crate) fn new(
        config: FleetConfig,
        connector: Arc<dyn FleetConnector>,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config: RwLock::new(config),
                connector,
                sessions: RwLock::new(HashMap::new()),
                last_frames: Mutex::new(HashMap::new()),
                maps: MapCoordinator::new(),
                watchdog,
                loop_handle: RwLock::new(None),
            }),
        }
    }

    /// Robot ids in configuration order.
    pub fn robot_ids(&self) -> Vec<String> {
        read(&self.inner.config).robot_ids()
    }

    /// Snapshot of the live configuration, including maps fetched so far.
    pub fn config(&self) -> FleetConfig {
        read(&self.inner.config).clone()
    }

    pub(crate) fn update_period(&self) -> Duration {
        read(&self.inner.config).update_period()
    }

    /// Replace the fleet.
    ///
    /// Meant to be called from [`FleetConnector::connect`], e.g. after listing
    /// robots from a fleet manager. Sessions are opened for the fleet as it is
    /// when `connect` returns; later updates do not open or close sessions.
    pub fn update_fleet(&self, fleet: Vec<RobotConfig>) -> Result<(), RuntimeError> {
        if fleet.is_empty() {
            return Err(ConfigError::EmptyFleet.into());
        }
        let mut seen = HashSet::new();
        for robot in &fleet {
            if !seen.insert(robot.robot_id.as_str()) {
                return Err(ConfigError::DuplicateRobotId(robot.robot_id.clone()).into());
            }
        }

        if !read(&self.inner.sessions).is_empty() {
            tracing::warn!("Fleet updated after sessions were opened; sessions are not changed");
        }
        let ids: Vec<&str> = fleet.iter().map(|r| r.robot_id.as_str()).collect();
        tracing::info!(robots = %ids.join(", "), "Fleet updated");
        write(&self.inner.config).fleet = fleet;
        Ok(())
    }

    /// The transport session of `robot_id`.
    ///
    /// Usually the publish methods are enough; direct access is for transport
    /// features the runtime does not wrap.
    pub fn robot_session(&self, robot_id: &str) -> Result<Arc<dyn RobotSession>, RuntimeError> {
        if let Some(session) = read(&self.inner.sessions).get(robot_id) {
            return Ok(session.clone());
        }
        if read(&self.inner.config).robot(robot_id).is_some() {
            return Err(TransportError::SessionUnavailable {
                robot_id: robot_id.to_string(),
                reason: "session not initialized".to_string(),
            }
            .into());
        }
        Err(RuntimeError::UnknownRobot(robot_id.to_string()))
    }

    fn publish_with<F>(&self, robot_id: &str, publish: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&dyn RobotSession) -> Result<(), TransportError>,
    {
        let session = self.robot_session(robot_id)?;
        publish(session.as_ref())?;
        self.inner.watchdog.record_publish();
        Ok(())
    }

    /// Publish a pose.
    ///
    /// When `pose.frame_id` differs from the frame last published for this
    /// robot, the map of the new frame is published first.
    pub fn publish_robot_pose(&self, robot_id: &str, pose: &Pose) -> Result<(), RuntimeError> {
        // Surface unknown robots before touching the map.
        self.robot_session(robot_id)?;

        let last = lock(&self.inner.last_frames).get(robot_id).cloned();
        if last.as_deref() != Some(pose.frame_id.as_str()) {
            tracing::info!(robot_id, frame_id = %pose.frame_id, "Updating map for new pose frame");
            // The pose goes out regardless; the map is retried with the next pose.
            if let Err(e) = self.publish_robot_map(robot_id, &pose.frame_id, true) {
                tracing::warn!(
                    robot_id,
                    frame_id = %pose.frame_id,
                    error = %e,
                    "Failed to publish map",
                );
            }
        }
        self.publish_with(robot_id, |session| session.publish_pose(pose))
    }

    /// Publish the map of `frame_id`.
    ///
    /// Unknown frames are fetched from the connector in the background and
    /// published once available.
    pub fn publish_robot_map(
        &self,
        robot_id: &str,
        frame_id: &str,
        is_update: bool,
    ) -> Result<(), RuntimeError> {
        let session = self.robot_session(robot_id)?;
        let descriptor = read(&self.inner.config).maps.get(frame_id).cloned();
        let Some(descriptor) = descriptor else {
            maps::schedule_fetch(self, robot_id, frame_id);
            return Ok(());
        };

        session.publish_map(&MapMessage::from_descriptor(frame_id, &descriptor, is_update))?;
        self.inner.watchdog.record_publish();
        lock(&self.inner.last_frames).insert(robot_id.to_string(), frame_id.to_string());
        Ok(())
    }

    pub fn publish_robot_odometry(
        &self,
        robot_id: &str,
        odometry: &Odometry,
    ) -> Result<(), RuntimeError> {
        self.publish_with(robot_id, |session| session.publish_odometry(odometry))
    }

    pub fn publish_robot_key_values(
        &self,
        robot_id: &str,
        values: &KeyValues,
    ) -> Result<(), RuntimeError> {
        self.publish_with(robot_id, |session| session.publish_key_values(values))
    }

    pub fn publish_robot_system_stats(
        &self,
        robot_id: &str,
        stats: &SystemStats,
    ) -> Result<(), RuntimeError> {
        self.publish_with(robot_id, |session| session.publish_system_stats(stats))
    }

    /// `(robot_id, frame_id)` pairs with a map fetch in flight.
    pub fn pending_map_fetches(&self) -> Vec<(String, String)> {
        self.inner.maps.pending()
    }

    /// The frame of the map last published for `robot_id`.
    pub fn last_published_frame(&self, robot_id: &str) -> Option<String> {
        lock(&self.inner.last_frames).get(robot_id).cloned()
    }

    /// Whether the worker loop is attached.
    pub fn is_running(&self) -> bool {
        read(&self.inner.loop_handle).is_some()
    }

    pub(crate) fn connector(&self) -> Arc<dyn FleetConnector> {
        self.inner.connector.clone()
    }

    pub(crate) fn maps(&self) -> &MapCoordinator {
        &self.inner.maps
    }

    pub(crate) fn watchdog(&self) -> &Arc<Watchdog> {
        &self.inner.watchdog
    }

    pub(crate) fn loop_handle(&self) -> Option<LoopHandle> {
        read(&self.inner.loop_handle).clone()
    }

    pub(crate) fn attach_loop(&self, handle: LoopHandle) {
        *write(&self.inner.loop_handle) = Some(handle);
    }

    pub(crate) fn detach_loop(&self) {
        *write(&self.inner.loop_handle) = None;
    }

    pub(crate) fn insert_map(&self, frame_id: &str, map: MapDescriptor) {
        write(&self.inner.config)
            .maps
            .insert(frame_id.to_string(), map);
    }

    pub(crate) fn install_sessions(&self, sessions: Vec<Arc<dyn RobotSession>>) {
        let mut map = write(&self.inner.sessions);
        for session in sessions {
            map.insert(session.robot_id().to_string(), session);
        }
    }

    /// Sessions in fleet order.
    pub(crate) fn sessions(&self) -> Vec<Arc<dyn RobotSession>> {
        let sessions = read(&self.inner.sessions);
        self.robot_ids()
            .iter()
            .filter_map(|id| sessions.get(id).cloned())
            .collect()
    }

    /// Remove all sessions and forget the per-robot frame history.
    pub(crate) fn take_sessions(&self) -> Vec<Arc<dyn RobotSession>> {
        let sessions = self.sessions();
        write(&self.inner.sessions).clear();
        lock(&self.inner.last_frames).clear();
        sessions
    }
}

impl std::fmt::Debug for FleetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetContext")
            .field("robot_ids", &self.robot_ids())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
