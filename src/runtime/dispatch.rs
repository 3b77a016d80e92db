//! Cross-thread command bridge.
//!
//! Transports deliver commands on their own threads through a synchronous
//! callback. The bridge submits the async handler to the connector loop,
//! blocks until it finishes and reports a failure result when the handler did
//! not succeed. Successful handlers report through their own continuation.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::ThreadId;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::context::FleetContext;
use crate::commands::{
    CommandArgsError, CommandFailure, CommandOptions, CommandOutcome, CommandRequest,
};
use crate::transport::CommandCallback;

/// Why a future submitted with [`LoopHandle::submit_and_wait`] produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Cannot wait on the connector loop from its own thread")]
    OwningThread,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("The connector loop is not running")]
    LoopClosed,
}

/// Handle to the event loop owned by a runtime's worker thread.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    handle: Handle,
    thread_id: ThreadId,
}

impl LoopHandle {
    /// Capture the loop driving the current thread.
    ///
    /// Must be called from within the worker's runtime.
    pub(crate) fn current() -> Self {
        Self {
            handle: Handle::current(),
            thread_id: std::thread::current().id(),
        }
    }

    /// Whether the caller runs on the loop's own thread.
    pub fn is_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `future` on the loop and block the calling thread until it completes.
    ///
    /// Calling this from the loop thread would deadlock, so it is rejected with
    /// [`SubmitError::OwningThread`].
    pub fn submit_and_wait<F>(&self, future: F) -> Result<F::Output, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_loop_thread() {
            return Err(SubmitError::OwningThread);
        }

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(|payload| panic_message(payload.as_ref()));
            let _ = tx.send(result);
        });

        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SubmitError::Panicked(message)),
            // The task was dropped without running, i.e. the loop shut down.
            Err(_) => Err(SubmitError::LoopClosed),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run the connector's command handler for `robot_id` and classify the result.
///
/// Blocks the calling thread. Never call it from the loop thread; doing so
/// yields an [`CommandOutcome::UnhandledError`] instead of a deadlock.
pub fn dispatch_command(
    ctx: &FleetContext,
    robot_id: &str,
    request: CommandRequest,
    options: CommandOptions,
) -> CommandOutcome {
    let command = request.name.clone();

    let Some(handle) = ctx.loop_handle() else {
        tracing::warn!(
            robot_id,
            command = %command,
            "Command received while the connector is not running",
        );
        return CommandOutcome::UnhandledError {
            description: SubmitError::LoopClosed.to_string(),
        };
    };

    let task_ctx = ctx.clone();
    let connector = ctx.connector();
    let task_robot_id = robot_id.to_string();
    let submitted = handle.submit_and_wait(async move {
        connector
            .handle_command(&task_ctx, &task_robot_id, request, options)
            .await
    });

    match submitted {
        Ok(Ok(())) => {
            tracing::debug!(robot_id, command = %command, "Command handled");
            CommandOutcome::Success
        }
        Ok(Err(err)) => {
            if is_handled_failure(&err) {
                tracing::info!(robot_id, command = %command, error = %err, "Command failed");
            } else {
                tracing::error!(
                    robot_id,
                    command = %command,
                    "Failed to execute command: {:?}",
                    err
                );
            }
            CommandOutcome::from_handler_result(Err(err))
        }
        Err(err) => {
            tracing::error!(
                robot_id,
                command = %command,
                error = %err,
                "Failed to execute command",
            );
            CommandOutcome::UnhandledError {
                description: err.to_string(),
            }
        }
    }
}

fn is_handled_failure(err: &anyhow::Error) -> bool {
    err.is::<CommandFailure>()
        || matches!(
            err.downcast_ref::<CommandArgsError>(),
            Some(CommandArgsError::Failure(_))
        )
}

/// Build the synchronous callback registered on a robot session.
pub(crate) fn command_callback(ctx: FleetContext, robot_id: String) -> CommandCallback {
    Arc::new(move |request: CommandRequest, options: CommandOptions| {
        let reporter = options.result.clone();
        let outcome = dispatch_command(&ctx, &robot_id, request, options);
        if let Some(result) = outcome.to_result() {
            reporter.report(result);
        }
    })
}
