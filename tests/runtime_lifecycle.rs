//! Lifecycle tests for FleetRuntime over the in-memory transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{LoopBehavior, RecordingTerminator, Scripted, fast_config, wait_until};
use fleet_connector::config::{CameraConfig, FleetConfig, RobotConfig, WatchdogConfig};
use fleet_connector::errors::{ConfigError, RuntimeError, TransportError};
use fleet_connector::runtime::{ExecutionState, FleetRuntime, RuntimeOptions};
use fleet_connector::transport::USER_SCRIPTS_EXEC_REGEX;
use fleet_connector::transport::memory::{MemoryTransport, TransportEvent};
use tempfile::TempDir;

fn runtime_with(
    config: FleetConfig,
    connector: Arc<Scripted>,
    transport: &MemoryTransport,
    options: RuntimeOptions,
) -> FleetRuntime {
    FleetRuntime::with_options(config, connector, Arc::new(transport.clone()), options).unwrap()
}

fn options() -> RuntimeOptions {
    let mut options = RuntimeOptions::new("test");
    options.error_cooldown = Duration::from_millis(20);
    options.stop_timeout = Duration::from_secs(5);
    options
}

mod construction {
    use super::*;

    #[test]
    fn test_robot_ids_preserve_config_order() {
        let transport = MemoryTransport::new();
        let runtime = runtime_with(
            fast_config(["zeta", "alpha", "mid"]),
            Scripted::new(),
            &transport,
            options(),
        );
        assert_eq!(runtime.robot_ids(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(runtime.state(), ExecutionState::Stopped);
    }

    #[test]
    fn test_empty_fleet_is_rejected() {
        let config = fast_config(Vec::<String>::new());
        let err = FleetRuntime::new(config, Scripted::new(), Arc::new(MemoryTransport::new()))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Config(ConfigError::EmptyFleet)));
    }

    #[test]
    fn test_duplicate_robot_ids_are_rejected() {
        let config = fast_config(["a", "b", "a"]);
        let err = FleetRuntime::new(config, Scripted::new(), Arc::new(MemoryTransport::new()))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RuntimeError::Config(ConfigError::DuplicateRobotId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_unrepresentable_durations_are_rejected() {
        let mut config = fast_config(["a"]);
        config.update_freq = 1e-300;
        let err = FleetRuntime::new(config, Scripted::new(), Arc::new(MemoryTransport::new()))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RuntimeError::Config(ConfigError::InvalidUpdateFrequency(_))
        ));

        let mut config = fast_config(["a"]);
        config.watchdog.heartbeat_interval_secs = 1e30;
        let err = FleetRuntime::new(config, Scripted::new(), Arc::new(MemoryTransport::new()))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Config(ConfigError::Watchdog(_))));
    }

    #[test]
    fn test_join_on_stopped_runtime_returns_immediately() {
        let transport = MemoryTransport::new();
        let runtime = runtime_with(fast_config(["a"]), Scripted::new(), &transport, options());
        runtime.join().unwrap();
        runtime.stop().unwrap();
    }
}

mod start_stop {
    use super::*;

    #[test]
    fn test_start_connects_and_runs_loop() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        let runtime = runtime_with(
            fast_config(["a", "b"]),
            connector.clone(),
            &transport,
            options(),
        );

        runtime.start().unwrap();
        assert_eq!(runtime.state(), ExecutionState::Running);
        assert!(runtime.context().is_running());
        assert!(wait_until(Duration::from_secs(2), || {
            connector.loops.load(Ordering::SeqCst) >= 3
        }));

        runtime.stop().unwrap();
        assert_eq!(runtime.state(), ExecutionState::Stopped);
        assert!(!runtime.context().is_running());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        assert!(transport.is_closed("a"));
        assert!(transport.is_closed("b"));
    }

    #[test]
    fn test_start_twice_is_a_noop() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, options());

        runtime.start().unwrap();
        runtime.start().unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        let opened = transport
            .events_for("a")
            .iter()
            .filter(|e| matches!(e, TransportEvent::SessionOpened { .. }))
            .count();
        assert_eq!(opened, 1);

        runtime.stop().unwrap();
    }

    #[test]
    fn test_stop_twice_is_a_noop() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, options());

        runtime.start().unwrap();
        runtime.stop().unwrap();
        runtime.stop().unwrap();
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_after_stop() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, options());

        runtime.start().unwrap();
        runtime.stop().unwrap();
        runtime.start().unwrap();
        assert_eq!(runtime.state(), ExecutionState::Running);
        runtime.stop().unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_join_returns_after_stop_from_another_thread() {
        let transport = MemoryTransport::new();
        let runtime = Arc::new(runtime_with(
            fast_config(["a"]),
            Scripted::new(),
            &transport,
            options(),
        ));
        runtime.start().unwrap();

        let stopper = runtime.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop()
        });
        runtime.join().unwrap();
        assert_eq!(runtime.state(), ExecutionState::Stopped);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_stop_timeout_does_not_hang() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        *connector.disconnect_block.lock().unwrap() = Some(Duration::from_millis(600));
        let mut opts = options();
        opts.stop_timeout = Duration::from_millis(100);
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, opts);

        runtime.start().unwrap();
        let started = std::time::Instant::now();
        let err = runtime.stop().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, RuntimeError::StopTimeout { .. }));
        assert!(err.to_string().contains("did not stop in time"));
        assert_eq!(runtime.state(), ExecutionState::Stopping);

        runtime.join().unwrap();
        assert_eq!(runtime.state(), ExecutionState::Stopped);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }
}

mod connect_phase {
    use super::*;

    #[test]
    fn test_connect_failure_is_returned_without_disconnect() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        connector.fail_connect.store(true, Ordering::SeqCst);
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, options());

        let err = runtime.start().unwrap_err();
        assert!(matches!(err, RuntimeError::Connect(_)));
        assert!(err.to_string().contains("robot API unreachable"));
        assert_eq!(runtime.state(), ExecutionState::Stopped);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(connector.loops.load(Ordering::SeqCst), 0);
        assert!(transport.events().is_empty());
    }

    #[test]
    fn test_session_failure_closes_opened_sessions_and_disconnects() {
        let transport = MemoryTransport::new();
        transport.fail_sessions_for("b");
        let connector = Scripted::new();
        let runtime = runtime_with(
            fast_config(["a", "b"]),
            connector.clone(),
            &transport,
            options(),
        );

        let err = runtime.start().unwrap_err();
        match err {
            RuntimeError::SessionInit { robot_id, source } => {
                assert_eq!(robot_id, "b");
                assert!(matches!(source, TransportError::SessionUnavailable { .. }));
            }
            other => panic!("Expected SessionInit, got {:?}", other),
        }
        assert_eq!(runtime.state(), ExecutionState::Stopped);
        assert!(transport.is_closed("a"));
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.loops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_update_fleet_during_connect_opens_sessions_for_new_fleet() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        *connector.fleet_on_connect.lock().unwrap() =
            Some(vec!["discovered-1".to_string(), "discovered-2".to_string()]);
        let runtime = runtime_with(fast_config(["placeholder"]), connector, &transport, options());

        runtime.start().unwrap();
        assert_eq!(runtime.robot_ids(), vec!["discovered-1", "discovered-2"]);
        assert!(runtime.context().robot_session("discovered-2").is_ok());
        assert!(transport.events_for("placeholder").is_empty());
        runtime.stop().unwrap();
    }

    #[test]
    fn test_cameras_and_online_status_are_registered() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        let mut config = fast_config(["a"]);
        config.fleet = vec![RobotConfig {
            robot_id: "a".to_string(),
            cameras: vec![
                CameraConfig {
                    video_url: "rtsp://cam/front".to_string(),
                    quality: None,
                    rate: Some(10),
                    scaling: None,
                },
                CameraConfig {
                    video_url: "rtsp://cam/rear".to_string(),
                    quality: Some(50),
                    rate: None,
                    scaling: None,
                },
            ],
        }];
        let runtime = runtime_with(config, connector.clone(), &transport, options());
        runtime.start().unwrap();

        let cameras: Vec<(String, String)> = transport
            .events_for("a")
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Camera {
                    camera_id,
                    video_url,
                    ..
                } => Some((camera_id, video_url)),
                _ => None,
            })
            .collect();
        assert_eq!(
            cameras,
            vec![
                ("0".to_string(), "rtsp://cam/front".to_string()),
                ("1".to_string(), "rtsp://cam/rear".to_string()),
            ]
        );

        assert_eq!(transport.is_online("a"), Some(true));
        connector.online.store(false, Ordering::SeqCst);
        assert_eq!(transport.is_online("a"), Some(false));

        runtime.stop().unwrap();
    }

    #[test]
    fn test_user_scripts_directory_is_created_and_registered() {
        let dir = TempDir::new().unwrap();
        let scripts = dir.path().join("scripts/local");
        let transport = MemoryTransport::new();
        let mut opts = options();
        opts.register_user_scripts = true;
        opts.create_user_scripts_dir = true;
        opts.default_user_scripts_dir = Some(scripts.clone());
        let runtime = runtime_with(fast_config(["a"]), Scripted::new(), &transport, opts);

        runtime.start().unwrap();
        runtime.stop().unwrap();

        assert!(scripts.is_dir());
        let registered = transport.events_for("a").into_iter().any(|e| {
            matches!(
                e,
                TransportEvent::CommandsPath { ref path, ref exec_name_regex, .. }
                    if path == &scripts && exec_name_regex == USER_SCRIPTS_EXEC_REGEX
            )
        });
        assert!(registered);
    }

    #[test]
    fn test_missing_user_scripts_directory_is_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        let mut opts = options();
        opts.register_user_scripts = true;
        let mut config = fast_config(["a"]);
        config.user_scripts_dir = Some(dir.path().join("absent"));
        let runtime = runtime_with(config, Scripted::new(), &transport, opts);

        runtime.start().unwrap();
        runtime.stop().unwrap();

        assert!(!dir.path().join("absent").exists());
        assert!(
            !transport
                .events_for("a")
                .iter()
                .any(|e| matches!(e, TransportEvent::CommandsPath { .. }))
        );
    }
}

mod execution_loop {
    use super::*;

    #[test]
    fn test_loop_survives_errors() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        *connector.loop_behavior.lock().unwrap() = LoopBehavior::Fail;
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, options());

        runtime.start().unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            connector.loops.load(Ordering::SeqCst) >= 3
        }));
        assert_eq!(runtime.state(), ExecutionState::Running);
        runtime.stop().unwrap();
    }

    #[test]
    fn test_loop_survives_panics() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        *connector.loop_behavior.lock().unwrap() = LoopBehavior::Panic;
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, options());

        runtime.start().unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            connector.loops.load(Ordering::SeqCst) >= 3
        }));
        runtime.stop().unwrap();
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cooldown_interrupted_by_stop() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        *connector.loop_behavior.lock().unwrap() = LoopBehavior::Fail;
        let mut opts = options();
        opts.error_cooldown = Duration::from_secs(30);
        opts.stop_timeout = Duration::from_secs(2);
        let runtime = runtime_with(fast_config(["a"]), connector.clone(), &transport, opts);

        runtime.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            connector.loops.load(Ordering::SeqCst) >= 1
        }));
        runtime.stop().unwrap();
        assert_eq!(connector.loops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loop_is_paced_by_update_freq() {
        let transport = MemoryTransport::new();
        let connector = Scripted::new();
        let mut config = fast_config(["a"]);
        config.update_freq = 10.0;
        let runtime = runtime_with(config, connector.clone(), &transport, options());

        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        runtime.stop().unwrap();

        let loops = connector.loops.load(Ordering::SeqCst);
        assert!((2..=8).contains(&loops), "unexpected iteration count {}", loops);
    }
}

mod watchdog {
    use super::*;

    fn watchdog_options(terminator: Arc<RecordingTerminator>) -> RuntimeOptions {
        let mut opts = options();
        opts.terminator = terminator;
        opts
    }

    fn health_config(robot: &str) -> FleetConfig {
        let mut config = fast_config([robot]);
        config.watchdog = WatchdogConfig {
            heartbeat_interval_secs: 0.0,
            health_check: true,
            health_timeout_secs: Some(0.3),
            tick_interval_secs: 0.05,
        };
        config
    }

    /// Add a resident map for frame "floor" stored in `dir`.
    fn with_floor_map(mut config: FleetConfig, dir: &TempDir) -> FleetConfig {
        let map_file = dir.path().join("floor.png");
        std::fs::write(&map_file, common::TINY_PNG).unwrap();
        config.maps.insert(
            "floor".to_string(),
            fleet_connector::config::MapDescriptor {
                file: map_file,
                map_id: "floor".to_string(),
                map_label: None,
                origin_x: 0.0,
                origin_y: 0.0,
                resolution: 0.05,
            },
        );
        config
    }

    #[test]
    fn test_silent_connector_is_terminated_once() {
        let transport = MemoryTransport::new();
        let terminator = Arc::new(RecordingTerminator::default());
        let runtime = runtime_with(
            health_config("a"),
            Scripted::new(),
            &transport,
            watchdog_options(terminator.clone()),
        );

        runtime.start().unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            !terminator.codes.lock().unwrap().is_empty()
        }));
        std::thread::sleep(Duration::from_millis(400));
        runtime.stop().unwrap();

        assert_eq!(*terminator.codes.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_publishing_connector_is_never_terminated() {
        let dir = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        let terminator = Arc::new(RecordingTerminator::default());
        let runtime = runtime_with(
            with_floor_map(health_config("a"), &dir),
            Scripted::publishing("floor"),
            &transport,
            watchdog_options(terminator.clone()),
        );

        runtime.start().unwrap();
        std::thread::sleep(Duration::from_millis(900));
        runtime.stop().unwrap();

        assert!(terminator.codes.lock().unwrap().is_empty());
        assert!(!transport.poses("a").is_empty());
    }

    #[test]
    fn test_wedged_transport_is_terminated_while_loop_is_blocked() {
        let dir = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        let terminator = Arc::new(RecordingTerminator::default());
        let runtime = runtime_with(
            with_floor_map(health_config("a"), &dir),
            Scripted::publishing("floor"),
            &transport,
            watchdog_options(terminator.clone()),
        );

        runtime.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            transport.poses("a").len() >= 2
        }));
        transport.set_publish_stall("a", Some(Duration::from_millis(2500)));

        // The loop thread now sits inside a publish; only the health thread runs.
        assert!(wait_until(Duration::from_millis(1500), || {
            !terminator.codes.lock().unwrap().is_empty()
        }));
        assert_eq!(*terminator.codes.lock().unwrap(), vec![1]);

        transport.set_publish_stall("a", None);
        runtime.stop().unwrap();
        assert_eq!(*terminator.codes.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_heartbeats_are_announced() {
        let transport = MemoryTransport::new();
        let mut config = fast_config(["a", "b"]);
        config.watchdog = WatchdogConfig {
            heartbeat_interval_secs: 0.1,
            health_check: false,
            health_timeout_secs: None,
            tick_interval_secs: 0.05,
        };
        let runtime = runtime_with(config, Scripted::new(), &transport, options());

        runtime.start().unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            transport.liveness_count("a") >= 2 && transport.liveness_count("b") >= 2
        }));
        runtime.stop().unwrap();
    }
}
