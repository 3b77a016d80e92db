//! Connector runtime.
//!
//! A [`FleetRuntime`] owns one worker thread per fleet. The thread runs a
//! single-threaded tokio runtime (the connector loop) that hosts every user
//! callback, the paced execution loop, map fetches and the heartbeat task.
//! The health check runs on a separate thread so a blocked loop cannot
//! silence it.
//!
//! ```text
//!  caller thread                 worker thread (connector loop)
//!  ─────────────                 ──────────────────────────────
//!  start() ──spawn──────────────▶ connect → sessions → callbacks
//!     ◀──────────ready/err──────  heartbeat task, health thread
//!                                 loop { execution_loop ∥ sleep(1/update_freq) }
//!  stop() ──stop signal─────────▶ close sessions → disconnect → cleanup
//!     ◀──────────exited─────────
//!
//!  transport thread ──command──▶ LoopHandle::submit_and_wait ──▶ handle_command
//! ```

pub mod context;
pub mod dispatch;
pub(crate) mod maps;
pub mod state;
pub mod watchdog;

pub use context::FleetContext;
pub use dispatch::{LoopHandle, SubmitError, dispatch_command};
pub use state::ExecutionState;
pub use watchdog::{ProcessTerminator, Terminator, Watchdog};

use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::config::FleetConfig;
use crate::connector::FleetConnector;
use crate::errors::RuntimeError;
use crate::sync::lock;
use crate::transport::{RobotSession, Transport, USER_SCRIPTS_EXEC_REGEX};
use dispatch::panic_message;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(1);

/// Construction options of a [`FleetRuntime`].
#[derive(Clone)]
pub struct RuntimeOptions {
    /// Connector name, used for the worker thread and the default user scripts directory
    pub name: String,
    /// Register a user scripts directory on every session
    pub register_user_scripts: bool,
    /// Used when the configuration has no `user_scripts_dir`.
    /// Defaults to `~/.fleet_connectors/connector-<name>/local/`.
    pub default_user_scripts_dir: Option<PathBuf>,
    /// Create the user scripts directory when it does not exist
    pub create_user_scripts_dir: bool,
    /// Route platform commands to [`FleetConnector::handle_command`]
    pub register_command_handler: bool,
    pub stop_timeout: Duration,
    /// Pause after a failed execution loop iteration
    pub error_cooldown: Duration,
    pub thread_name: Option<String>,
    pub terminator: Arc<dyn Terminator>,
}

impl RuntimeOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            register_user_scripts: false,
            default_user_scripts_dir: None,
            create_user_scripts_dir: false,
            register_command_handler: true,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            error_cooldown: DEFAULT_ERROR_COOLDOWN,
            thread_name: None,
            terminator: Arc::new(ProcessTerminator),
        }
    }

    fn thread_name(&self) -> String {
        self.thread_name
            .clone()
            .unwrap_or_else(|| format!("connector-{}", self.name))
    }

    /// Directory registered for user scripts, if it can be determined.
    pub fn user_scripts_dir(&self, config: &FleetConfig) -> Option<PathBuf> {
        if let Some(dir) = &config.user_scripts_dir {
            return Some(dir.clone());
        }
        if let Some(dir) = &self.default_user_scripts_dir {
            return Some(dir.clone());
        }
        dirs::home_dir().map(|home| {
            home.join(".fleet_connectors")
                .join(format!("connector-{}", self.name))
                .join("local")
        })
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::new("fleet")
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("name", &self.name)
            .field("register_user_scripts", &self.register_user_scripts)
            .field("default_user_scripts_dir", &self.default_user_scripts_dir)
            .field("create_user_scripts_dir", &self.create_user_scripts_dir)
            .field("register_command_handler", &self.register_command_handler)
            .field("stop_timeout", &self.stop_timeout)
            .field("error_cooldown", &self.error_cooldown)
            .field("thread_name", &self.thread_name)
            .finish_non_exhaustive()
    }
}

/// Signalled by the worker when it has fully exited.
struct ExitSignal {
    exited: Mutex<bool>,
    cond: Condvar,
}

impl ExitSignal {
    fn new() -> Self {
        Self {
            exited: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    fn reset(&self) {
        *lock(&self.exited) = false;
    }

    fn notify(&self) {
        *lock(&self.exited) = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut exited = lock(&self.exited);
        while !*exited {
            exited = self
                .cond
                .wait(exited)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Returns `false` if the timeout elapsed first.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let exited = lock(&self.exited);
        let (exited, _) = self
            .cond
            .wait_timeout_while(exited, timeout, |exited| !*exited)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *exited
    }
}

struct Worker {
    thread: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Runs a [`FleetConnector`] on a dedicated worker thread.
pub struct FleetRuntime {
    ctx: FleetContext,
    transport: Arc<dyn Transport>,
    options: RuntimeOptions,
    state: Arc<Mutex<ExecutionState>>,
    exit: Arc<ExitSignal>,
    worker: Mutex<Option<Worker>>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
}

impl FleetRuntime {
    pub fn new(
        config: FleetConfig,
        connector: Arc<dyn FleetConnector>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RuntimeError> {
        Self::with_options(config, connector, transport, RuntimeOptions::default())
    }

    /// Create a stopped runtime. The configuration is validated first.
    pub fn with_options(
        config: FleetConfig,
        connector: Arc<dyn FleetConnector>,
        transport: Arc<dyn Transport>,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let watchdog = Arc::new(Watchdog::new(
            config.watchdog.clone(),
            options.terminator.clone(),
        ));
        Ok(Self {
            ctx: FleetContext::new(config, connector, watchdog),
            transport,
            options,
            state: Arc::new(Mutex::new(ExecutionState::Stopped)),
            exit: Arc::new(ExitSignal::new()),
            worker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn robot_ids(&self) -> Vec<String> {
        self.ctx.robot_ids()
    }

    pub fn state(&self) -> ExecutionState {
        *lock(&self.state)
    }

    pub fn context(&self) -> &FleetContext {
        &self.ctx
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Start the worker thread and connect.
    ///
    /// Blocks until the connect phase finished and returns its error, if
    /// any. A no-op unless the runtime is stopped.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let _lifecycle = lock(&self.lifecycle);
        {
            let mut state = lock(&self.state);
            if *state != ExecutionState::Stopped {
                tracing::debug!(state = %*state, "Connector already started");
                return Ok(());
            }
            *state = ExecutionState::Starting;
        }

        // Reap the thread of a previous run.
        if let Some(previous) = lock(&self.worker).take()
            && previous.thread.join().is_err()
        {
            tracing::warn!("Previous connector thread had panicked");
        }

        self.exit.reset();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let task = WorkerTask {
            ctx: self.ctx.clone(),
            transport: self.transport.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            exit: self.exit.clone(),
            stop_rx,
            ready_tx,
        };

        let spawned = std::thread::Builder::new()
            .name(self.options.thread_name())
            .spawn(move || task.run());
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                *lock(&self.state) = ExecutionState::Stopped;
                self.exit.notify();
                return Err(RuntimeError::ThreadSpawn(e));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *lock(&self.worker) = Some(Worker { thread, stop_tx });
                tracing::info!(robots = self.robot_ids().len(), "Connector started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let message = match thread.join() {
                    Err(payload) => panic_message(payload.as_ref()),
                    Ok(()) => "worker exited during startup".to_string(),
                };
                Err(RuntimeError::WorkerPanicked(message))
            }
        }
    }

    /// Stop the worker and wait for it to disconnect.
    ///
    /// A no-op when stopped. Fails with [`RuntimeError::StopTimeout`] when the
    /// worker does not exit within the stop timeout; the worker keeps
    /// running in that case and a later `stop` or `join` may still succeed.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        let _lifecycle = lock(&self.lifecycle);
        {
            let mut state = lock(&self.state);
            if *state == ExecutionState::Stopped {
                return Ok(());
            }
            *state = ExecutionState::Stopping;
        }

        tracing::info!("Stopping connector");
        if let Some(worker) = lock(&self.worker).as_ref() {
            let _ = worker.stop_tx.send(true);
        }

        let timeout = self.options.stop_timeout;
        if !self.exit.wait_timeout(timeout) {
            tracing::error!(
                timeout_secs = timeout.as_secs_f64(),
                "Connector thread did not stop in time",
            );
            return Err(RuntimeError::StopTimeout { timeout });
        }

        self.reap()
    }

    /// Block until the worker has exited. Returns immediately when stopped.
    pub fn join(&self) -> Result<(), RuntimeError> {
        self.exit.wait();
        self.reap()
    }

    fn reap(&self) -> Result<(), RuntimeError> {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker
            && let Err(payload) = worker.thread.join()
        {
            return Err(RuntimeError::WorkerPanicked(panic_message(payload.as_ref())));
        }
        Ok(())
    }
}

impl Drop for FleetRuntime {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            let _ = worker.stop_tx.send(true);
        }
    }
}

impl std::fmt::Debug for FleetRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetRuntime")
            .field("robot_ids", &self.robot_ids())
            .field("state", &self.state())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Marks the runtime stopped when the worker exits, even by panic.
struct ExitGuard {
    state: Arc<Mutex<ExecutionState>>,
    exit: Arc<ExitSignal>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        *lock(&self.state) = ExecutionState::Stopped;
        self.exit.notify();
    }
}

/// Everything the worker thread needs, moved into it at start.
struct WorkerTask {
    ctx: FleetContext,
    transport: Arc<dyn Transport>,
    options: RuntimeOptions,
    state: Arc<Mutex<ExecutionState>>,
    exit: Arc<ExitSignal>,
    stop_rx: watch::Receiver<bool>,
    ready_tx: std::sync::mpsc::Sender<Result<(), RuntimeError>>,
}

/// Why the connect phase failed, and whether `disconnect` is owed.
struct ConnectFailure {
    error: RuntimeError,
    connected: bool,
}

impl WorkerTask {
    fn run(self) {
        // Declared first so it is dropped last, after the loop is gone.
        let _exit = ExitGuard {
            state: self.state.clone(),
            exit: self.exit.clone(),
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = self.ready_tx.send(Err(RuntimeError::LoopInit(e)));
                return;
            }
        };
        runtime.block_on(self.drive());
    }

    async fn drive(self) {
        let WorkerTask {
            ctx,
            transport,
            options,
            state,
            stop_rx,
            ready_tx,
            ..
        } = self;

        ctx.attach_loop(LoopHandle::current());

        if let Err(failure) = connect(&ctx, transport.as_ref(), &options).await {
            tracing::error!(error = %failure.error, "Failed to connect");
            if failure.connected {
                disconnect(&ctx).await;
            }
            ctx.detach_loop();
            let _ = ready_tx.send(Err(failure.error));
            return;
        }

        ctx.watchdog().reset(Instant::now());
        let monitor = ctx
            .watchdog()
            .clone()
            .spawn_health_monitor(stop_rx.clone(), format!("{}-health", options.thread_name()));
        if let Err(e) = monitor {
            tracing::error!(error = %e, "Failed to start the health monitor thread");
        }
        let heartbeats = tokio::spawn(ctx.watchdog().clone().run_heartbeats(ctx.clone()));

        *lock(&state) = ExecutionState::Running;
        let _ = ready_tx.send(Ok(()));

        paced_loop(&ctx, stop_rx, options.error_cooldown).await;

        heartbeats.abort();
        disconnect(&ctx).await;
        ctx.detach_loop();
        tracing::info!("Connector stopped");
    }
}

/// Run the connector's `connect`, then open and wire up one session per robot.
async fn connect(
    ctx: &FleetContext,
    transport: &dyn Transport,
    options: &RuntimeOptions,
) -> Result<(), ConnectFailure> {
    tracing::info!("Connecting");
    let connected = AssertUnwindSafe(ctx.connector().connect(ctx))
        .catch_unwind()
        .await;
    let error = match connected {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(payload) => Some(anyhow::anyhow!(
            "connect panicked: {}",
            panic_message(payload.as_ref())
        )),
    };
    if let Some(e) = error {
        return Err(ConnectFailure {
            error: RuntimeError::Connect(e),
            connected: false,
        });
    }

    ctx.maps().reopen();
    let config = ctx.config();

    let mut sessions: Vec<Arc<dyn RobotSession>> = Vec::with_capacity(config.fleet.len());
    for robot in &config.fleet {
        match transport.session(&robot.robot_id) {
            Ok(session) => sessions.push(session),
            Err(source) => {
                for session in &sessions {
                    if let Err(e) = session.close() {
                        tracing::warn!(
                            robot_id = session.robot_id(),
                            error = %e,
                            "Failed to close session",
                        );
                    }
                }
                return Err(ConnectFailure {
                    error: RuntimeError::SessionInit {
                        robot_id: robot.robot_id.clone(),
                        source,
                    },
                    connected: true,
                });
            }
        }
    }
    ctx.install_sessions(sessions.clone());
    tracing::info!(
        "Initialized {} robot sessions for robots {}",
        sessions.len(),
        config.robot_ids().join(", ")
    );

    let scripts_dir = options
        .register_user_scripts
        .then(|| options.user_scripts_dir(&config))
        .flatten();

    for (robot, session) in config.fleet.iter().zip(&sessions) {
        let robot_id = robot.robot_id.as_str();

        for (idx, camera) in robot.cameras.iter().enumerate() {
            tracing::info!(
                robot_id,
                camera = idx,
                video_url = %camera.video_url,
                "Registering camera",
            );
            if let Err(e) = session.register_camera(&idx.to_string(), camera) {
                tracing::error!(robot_id, camera = idx, error = %e, "Failed to register camera");
            }
        }

        if let Some(dir) = &scripts_dir {
            register_user_scripts(session.as_ref(), dir, options.create_user_scripts_dir);
        }

        let connector = ctx.connector();
        let id = robot_id.to_string();
        session.set_online_status_callback(Arc::new(move || connector.is_robot_online(&id)));

        if options.register_command_handler {
            session.register_command_callback(dispatch::command_callback(
                ctx.clone(),
                robot_id.to_string(),
            ));
        }
    }

    Ok(())
}

fn register_user_scripts(session: &dyn RobotSession, path: &Path, create: bool) {
    let robot_id = session.robot_id();
    if !path.exists() {
        if !create {
            tracing::warn!(robot_id, path = %path.display(), "User scripts directory not found");
            return;
        }
        tracing::info!(robot_id, path = %path.display(), "Creating user scripts directory");
        if let Err(e) = std::fs::create_dir_all(path) {
            tracing::error!(
                robot_id,
                path = %path.display(),
                error = %e,
                "Failed to create user scripts directory",
            );
            return;
        }
    }

    tracing::info!(robot_id, path = %path.display(), "Registering user scripts path");
    if let Err(e) = session.register_commands_path(path, USER_SCRIPTS_EXEC_REGEX) {
        tracing::error!(robot_id, error = %e, "Failed to register user scripts path");
    }
}

/// Close sessions, run the connector's `disconnect` and drop scratch storage.
async fn disconnect(ctx: &FleetContext) {
    for session in ctx.take_sessions() {
        if let Err(e) = session.close() {
            tracing::warn!(robot_id = session.robot_id(), error = %e, "Failed to close session");
        }
    }

    let result = AssertUnwindSafe(ctx.connector().disconnect(ctx))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Error while disconnecting: {:?}", e),
        Err(payload) => tracing::error!(
            panic = %panic_message(payload.as_ref()),
            "Disconnect panicked"
        ),
    }

    if let Some(path) = ctx.maps().close_scratch() {
        tracing::debug!(path = %path.display(), "Removed map scratch directory");
    }
}

fn stop_requested(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow() || stop_rx.has_changed().is_err()
}

/// Sleep for `duration`, waking early when stop is requested.
async fn sleep_unless_stopped(duration: Duration, stop_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stop_rx.wait_for(|stop| *stop) => {}
    }
}

/// Run `execution_loop` at most once per update period until stopped.
///
/// Errors and panics are logged and followed by `cooldown`; they never end
/// the loop.
async fn paced_loop(ctx: &FleetContext, mut stop_rx: watch::Receiver<bool>, cooldown: Duration) {
    let connector = ctx.connector();
    while !stop_requested(&stop_rx) {
        let period = ctx.update_period();
        let (result, ()) = tokio::join!(
            AssertUnwindSafe(connector.execution_loop(ctx)).catch_unwind(),
            sleep_unless_stopped(period, &mut stop_rx),
        );

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:?}", e)),
            Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
        };
        if let Some(failure) = failure {
            tracing::error!("Error in execution loop: {}", failure);
            sleep_unless_stopped(cooldown, &mut stop_rx).await;
        }
    }
}
