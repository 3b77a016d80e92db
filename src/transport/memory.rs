//! In-memory transport.
//!
//! Records every call made through its sessions so tests (and the bundled
//! simulator) can observe what a connector published. Failures can be
//! injected per robot, and commands can be delivered from the calling thread
//! the same way a real transport delivers them from its network thread.
//!
//! The event log is unbounded by default. Long-running users such as the
//! simulator cap it with [`MemoryTransport::with_event_capacity`] and read
//! the per-robot [`EventCounts`] instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    CommandCallback, KeyValues, MapMessage, Odometry, OnlineStatusCallback, Pose, RobotSession,
    SystemStats, Transport,
};
use crate::commands::{CommandOptions, CommandRequest, CommandResult, ResultReporter};
use crate::config::CameraConfig;
use crate::errors::TransportError;
use crate::sync::lock;

/// One recorded session call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    SessionOpened { robot_id: String },
    Pose { robot_id: String, pose: Pose },
    Odometry { robot_id: String, odometry: Odometry },
    KeyValues { robot_id: String, values: KeyValues },
    SystemStats { robot_id: String, stats: SystemStats },
    Map { robot_id: String, map: MapMessage },
    Camera { robot_id: String, camera_id: String, video_url: String },
    CommandsPath { robot_id: String, path: PathBuf, exec_name_regex: String },
    Liveness { robot_id: String },
    Closed { robot_id: String },
}

impl TransportEvent {
    pub fn robot_id(&self) -> &str {
        match self {
            TransportEvent::SessionOpened { robot_id }
            | TransportEvent::Pose { robot_id, .. }
            | TransportEvent::Odometry { robot_id, .. }
            | TransportEvent::KeyValues { robot_id, .. }
            | TransportEvent::SystemStats { robot_id, .. }
            | TransportEvent::Map { robot_id, .. }
            | TransportEvent::Camera { robot_id, .. }
            | TransportEvent::CommandsPath { robot_id, .. }
            | TransportEvent::Liveness { robot_id }
            | TransportEvent::Closed { robot_id } => robot_id,
        }
    }
}

/// Number of calls recorded for one robot since the transport was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub poses: usize,
    pub total: usize,
}

#[derive(Default)]
struct MemoryState {
    events: Mutex<VecDeque<TransportEvent>>,
    /// Oldest events are dropped beyond this many
    capacity: Option<usize>,
    counts: Mutex<HashMap<String, EventCounts>>,
    publish_stalls: Mutex<HashMap<String, Duration>>,
    command_callbacks: Mutex<HashMap<String, CommandCallback>>,
    online_callbacks: Mutex<HashMap<String, OnlineStatusCallback>>,
    closed: Mutex<HashSet<String>>,
    failing_sessions: Mutex<HashSet<String>>,
    failing_publishes: Mutex<HashSet<String>>,
    failing_maps: Mutex<HashSet<String>>,
    failing_liveness: Mutex<HashSet<String>>,
}

impl MemoryState {
    fn record(&self, event: TransportEvent) {
        {
            let mut counts = lock(&self.counts);
            let entry = counts.entry(event.robot_id().to_string()).or_default();
            entry.total += 1;
            if matches!(event, TransportEvent::Pose { .. }) {
                entry.poses += 1;
            }
        }

        let mut events = lock(&self.events);
        events.push_back(event);
        if let Some(capacity) = self.capacity {
            while events.len() > capacity {
                events.pop_front();
            }
        }
    }
}

/// A [`Transport`] that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that keeps only the `capacity` most recent events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(MemoryState {
                capacity: Some(capacity),
                ..MemoryState::default()
            }),
        }
    }

    /// Snapshot of the recorded calls, oldest first.
    pub fn events(&self) -> Vec<TransportEvent> {
        lock(&self.state.events).iter().cloned().collect()
    }

    /// Calls recorded for `robot_id`, including those no longer in the log.
    pub fn event_counts(&self, robot_id: &str) -> EventCounts {
        lock(&self.state.counts)
            .get(robot_id)
            .copied()
            .unwrap_or_default()
    }

    /// Recorded calls for a single robot.
    pub fn events_for(&self, robot_id: &str) -> Vec<TransportEvent> {
        lock(&self.state.events)
            .iter()
            .filter(|e| e.robot_id() == robot_id)
            .cloned()
            .collect()
    }

    pub fn poses(&self, robot_id: &str) -> Vec<Pose> {
        self.events_for(robot_id)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Pose { pose, .. } => Some(pose),
                _ => None,
            })
            .collect()
    }

    pub fn maps(&self, robot_id: &str) -> Vec<MapMessage> {
        self.events_for(robot_id)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Map { map, .. } => Some(map),
                _ => None,
            })
            .collect()
    }

    pub fn liveness_count(&self, robot_id: &str) -> usize {
        self.events_for(robot_id)
            .iter()
            .filter(|e| matches!(e, TransportEvent::Liveness { .. }))
            .count()
    }

    pub fn is_closed(&self, robot_id: &str) -> bool {
        lock(&self.state.closed).contains(robot_id)
    }

    pub fn clear_events(&self) {
        lock(&self.state.events).clear();
    }

    /// Make `session(robot_id)` fail.
    pub fn fail_sessions_for(&self, robot_id: &str) {
        lock(&self.state.failing_sessions).insert(robot_id.to_string());
    }

    /// Make every publish for `robot_id` fail.
    pub fn set_publish_failing(&self, robot_id: &str, failing: bool) {
        let mut set = lock(&self.state.failing_publishes);
        if failing {
            set.insert(robot_id.to_string());
        } else {
            set.remove(robot_id);
        }
    }

    /// Make only map publishes for `robot_id` fail.
    pub fn set_map_publish_failing(&self, robot_id: &str, failing: bool) {
        let mut set = lock(&self.state.failing_maps);
        if failing {
            set.insert(robot_id.to_string());
        } else {
            set.remove(robot_id);
        }
    }

    /// Make every publish for `robot_id` block for `stall` before it is
    /// recorded, like a transport stuck on a dead link. `None` clears it.
    pub fn set_publish_stall(&self, robot_id: &str, stall: Option<Duration>) {
        let mut stalls = lock(&self.state.publish_stalls);
        match stall {
            Some(stall) => stalls.insert(robot_id.to_string(), stall),
            None => stalls.remove(robot_id),
        };
    }

    /// Make liveness announcements for `robot_id` fail.
    pub fn set_liveness_failing(&self, robot_id: &str, failing: bool) {
        let mut set = lock(&self.state.failing_liveness);
        if failing {
            set.insert(robot_id.to_string());
        } else {
            set.remove(robot_id);
        }
    }

    /// Whether a command callback is registered for `robot_id`.
    pub fn has_command_callback(&self, robot_id: &str) -> bool {
        lock(&self.state.command_callbacks).contains_key(robot_id)
    }

    /// Deliver a command on the calling thread.
    ///
    /// Blocks until the registered callback returns and yields every result
    /// reported through the continuation. Returns `None` when no callback is
    /// registered for the robot.
    pub fn send_command(
        &self,
        robot_id: &str,
        request: CommandRequest,
    ) -> Option<Vec<CommandResult>> {
        let callback = lock(&self.state.command_callbacks).get(robot_id).cloned()?;

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let reporter = ResultReporter::new(move |result| lock(&sink).push(result));
        callback(request, CommandOptions::new(reporter));

        let collected = lock(&results).clone();
        Some(collected)
    }

    /// Poll the online status callback of `robot_id`, if registered.
    pub fn is_online(&self, robot_id: &str) -> Option<bool> {
        let callback = lock(&self.state.online_callbacks).get(robot_id).cloned()?;
        Some(callback())
    }
}

impl Transport for MemoryTransport {
    fn session(&self, robot_id: &str) -> Result<Arc<dyn RobotSession>, TransportError> {
        if lock(&self.state.failing_sessions).contains(robot_id) {
            return Err(TransportError::SessionUnavailable {
                robot_id: robot_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        lock(&self.state.closed).remove(robot_id);
        self.state.record(TransportEvent::SessionOpened {
            robot_id: robot_id.to_string(),
        });
        Ok(Arc::new(MemorySession {
            robot_id: robot_id.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct MemorySession {
    robot_id: String,
    state: Arc<MemoryState>,
}

impl MemorySession {
    fn check_publish(&self, kind: &'static str) -> Result<(), TransportError> {
        let stall = lock(&self.state.publish_stalls).get(&self.robot_id).copied();
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }
        if lock(&self.state.closed).contains(&self.robot_id) {
            return Err(TransportError::Closed(self.robot_id.clone()));
        }
        let failing = lock(&self.state.failing_publishes).contains(&self.robot_id)
            || (kind == "map" && lock(&self.state.failing_maps).contains(&self.robot_id));
        if failing {
            return Err(TransportError::PublishFailed {
                robot_id: self.robot_id.clone(),
                kind,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl RobotSession for MemorySession {
    fn robot_id(&self) -> &str {
        &self.robot_id
    }

    fn publish_pose(&self, pose: &Pose) -> Result<(), TransportError> {
        self.check_publish("pose")?;
        self.state.record(TransportEvent::Pose {
            robot_id: self.robot_id.clone(),
            pose: pose.clone(),
        });
        Ok(())
    }

    fn publish_odometry(&self, odometry: &Odometry) -> Result<(), TransportError> {
        self.check_publish("odometry")?;
        self.state.record(TransportEvent::Odometry {
            robot_id: self.robot_id.clone(),
            odometry: odometry.clone(),
        });
        Ok(())
    }

    fn publish_key_values(&self, values: &KeyValues) -> Result<(), TransportError> {
        self.check_publish("key values")?;
        self.state.record(TransportEvent::KeyValues {
            robot_id: self.robot_id.clone(),
            values: values.clone(),
        });
        Ok(())
    }

    fn publish_system_stats(&self, stats: &SystemStats) -> Result<(), TransportError> {
        self.check_publish("system stats")?;
        self.state.record(TransportEvent::SystemStats {
            robot_id: self.robot_id.clone(),
            stats: stats.clone(),
        });
        Ok(())
    }

    fn publish_map(&self, map: &MapMessage) -> Result<(), TransportError> {
        self.check_publish("map")?;
        self.state.record(TransportEvent::Map {
            robot_id: self.robot_id.clone(),
            map: map.clone(),
        });
        Ok(())
    }

    fn register_command_callback(&self, callback: CommandCallback) {
        lock(&self.state.command_callbacks).insert(self.robot_id.clone(), callback);
    }

    fn set_online_status_callback(&self, callback: OnlineStatusCallback) {
        lock(&self.state.online_callbacks).insert(self.robot_id.clone(), callback);
    }

    fn register_camera(
        &self,
        camera_id: &str,
        camera: &CameraConfig,
    ) -> Result<(), TransportError> {
        self.state.record(TransportEvent::Camera {
            robot_id: self.robot_id.clone(),
            camera_id: camera_id.to_string(),
            video_url: camera.video_url.clone(),
        });
        Ok(())
    }

    fn register_commands_path(
        &self,
        path: &Path,
        exec_name_regex: &str,
    ) -> Result<(), TransportError> {
        self.state.record(TransportEvent::CommandsPath {
            robot_id: self.robot_id.clone(),
            path: path.to_path_buf(),
            exec_name_regex: exec_name_regex.to_string(),
        });
        Ok(())
    }

    fn announce_liveness(&self) -> Result<(), TransportError> {
        if lock(&self.state.failing_liveness).contains(&self.robot_id) {
            return Err(TransportError::PublishFailed {
                robot_id: self.robot_id.clone(),
                kind: "liveness",
                reason: "injected failure".to_string(),
            });
        }
        self.state.record(TransportEvent::Liveness {
            robot_id: self.robot_id.clone(),
        });
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        lock(&self.state.command_callbacks).remove(&self.robot_id);
        lock(&self.state.online_callbacks).remove(&self.robot_id);
        lock(&self.state.closed).insert(self.robot_id.clone());
        self.state.record(TransportEvent::Closed {
            robot_id: self.robot_id.clone(),
        });
        Ok(())
    }
}
