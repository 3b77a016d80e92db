//! Command handling primitives.
//!
//! Commands arrive from the platform as a name plus a JSON argument list and
//! carry a result continuation that must eventually be told how the command
//! went. This module holds the types shared by the dispatch bridge and user
//! command handlers:
//!
//! - [`CommandResultCode`] / [`CommandResult`]: what is reported back
//! - [`CommandFailure`]: an intentional, user-facing failure raised by a handler
//! - [`CommandOutcome`]: the tagged result of one handler invocation
//! - [`parse_custom_command_args`] / [`parse_command_model`]: argument helpers

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Well-known command names sent by the platform.
pub mod names {
    /// Run a named script with key/value arguments.
    pub const CUSTOM_COMMAND: &str = "customCommand";
    /// Navigate to a goal pose.
    pub const NAV_GOAL: &str = "navGoal";
    /// Free-form text message.
    pub const MESSAGE: &str = "message";
}

/// Summary reported when a handler fails with an unexpected error.
pub const GENERIC_FAILURE_SUMMARY: &str = "An error occurred executing custom command";

/// The result code of a command execution, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResultCode {
    #[serde(rename = "0")]
    Success,
    #[serde(rename = "1")]
    Failure,
}

impl CommandResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandResultCode::Success => "0",
            CommandResultCode::Failure => "1",
        }
    }
}

/// What is handed to the result continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub code: CommandResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_status_details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            code: CommandResultCode::Success,
            execution_status_details: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn failure(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: CommandResultCode::Failure,
            execution_status_details: Some(summary.into()),
            stdout: None,
            stderr: Some(detail.into()),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }
}

/// Result continuation provided by the transport with every command.
#[derive(Clone)]
pub struct ResultReporter {
    report: Arc<dyn Fn(CommandResult) + Send + Sync>,
}

impl ResultReporter {
    pub fn new(report: impl Fn(CommandResult) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn report(&self, result: CommandResult) {
        (self.report)(result)
    }

    pub fn success(&self) {
        self.report(CommandResult::success())
    }

    pub fn failure(&self, summary: impl Into<String>, detail: impl Into<String>) {
        self.report(CommandResult::failure(summary, detail))
    }
}

impl fmt::Debug for ResultReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultReporter").finish_non_exhaustive()
    }
}

/// A command as delivered by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    /// Usually a JSON array; for custom commands `[script_name, [k, v, ...]]`
    pub args: Value,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Shorthand for [`parse_custom_command_args`] on this request's arguments.
    pub fn custom_script_args(&self) -> Result<(String, Map<String, Value>), CommandArgsError> {
        parse_custom_command_args(&self.args)
    }
}

/// Options delivered alongside a command.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub result: ResultReporter,
    /// Extra transport-specific metadata
    pub metadata: Map<String, Value>,
}

impl CommandOptions {
    pub fn new(result: ResultReporter) -> Self {
        Self {
            result,
            metadata: Map::new(),
        }
    }
}

/// An intentional command failure.
///
/// Returning this from a command handler reports `FAILURE` with
/// `execution_status_details` as the summary and `stderr` as the detail,
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{execution_status_details}")]
pub struct CommandFailure {
    pub execution_status_details: String,
    pub stderr: String,
}

impl CommandFailure {
    pub fn new(execution_status_details: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            execution_status_details: execution_status_details.into(),
            stderr: stderr.into(),
        }
    }
}

/// Errors from [`parse_custom_command_args`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandArgsError {
    /// The transport delivered arguments that do not follow its own contract.
    #[error("Malformed custom command arguments: {0}")]
    InvalidShape(String),

    /// The arguments are well-formed but cannot be read as key/value pairs.
    #[error(transparent)]
    Failure(#[from] CommandFailure),
}

/// The tagged result of running one command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    HandledFailure { summary: String, detail: String },
    UnhandledError { description: String },
}

impl CommandOutcome {
    /// Classify a handler result.
    ///
    /// [`CommandFailure`] (directly or wrapped in [`CommandArgsError::Failure`])
    /// becomes a handled failure; anything else is unhandled and described by
    /// the first non-empty message in its chain.
    pub fn from_handler_result(result: anyhow::Result<()>) -> Self {
        let err = match result {
            Ok(()) => return CommandOutcome::Success,
            Err(err) => err,
        };

        let failure = err.downcast_ref::<CommandFailure>().or_else(|| {
            match err.downcast_ref::<CommandArgsError>() {
                Some(CommandArgsError::Failure(failure)) => Some(failure),
                _ => None,
            }
        });
        if let Some(failure) = failure {
            return CommandOutcome::HandledFailure {
                summary: failure.execution_status_details.clone(),
                detail: failure.stderr.clone(),
            };
        }

        let description = err
            .chain()
            .map(|cause| cause.to_string())
            .find(|msg| !msg.is_empty())
            .unwrap_or_else(|| "unknown error".to_string());
        CommandOutcome::UnhandledError { description }
    }

    /// The result to report, if the bridge must report one.
    ///
    /// Successful handlers report through their own continuation, so
    /// `Success` maps to `None`.
    pub fn to_result(&self) -> Option<CommandResult> {
        match self {
            CommandOutcome::Success => None,
            CommandOutcome::HandledFailure { summary, detail } => {
                Some(CommandResult::failure(summary.clone(), detail.clone()))
            }
            CommandOutcome::UnhandledError { description } => Some(CommandResult::failure(
                GENERIC_FAILURE_SUMMARY,
                description.clone(),
            )),
        }
    }
}

/// Parse the arguments of a custom command into a script name and parameters.
///
/// The expected shape is `[script_name, [key1, value1, key2, value2, ...]]`.
/// Duplicate keys keep the last value, and values keep their JSON type.
/// Keys that are not strings are rendered with their JSON text.
///
/// ```
/// use fleet_connector::commands::parse_custom_command_args;
/// use serde_json::json;
///
/// let args = json!(["s.sh", ["x", "1", "y", "2"]]);
/// let (script, params) = parse_custom_command_args(&args).unwrap();
/// assert_eq!(script, "s.sh");
/// assert_eq!(params["x"], "1");
/// ```
pub fn parse_custom_command_args(
    args: &Value,
) -> Result<(String, Map<String, Value>), CommandArgsError> {
    let Value::Array(items) = args else {
        return Err(CommandArgsError::InvalidShape(format!(
            "expected custom command arguments to be a list, got {}",
            json_type_name(args)
        )));
    };

    let [script_name, script_args] = items.as_slice() else {
        return Err(CommandArgsError::InvalidShape(format!(
            "expected custom command arguments to be a list with two elements, got {}",
            items.len()
        )));
    };

    let Value::String(script_name) = script_name else {
        return Err(CommandArgsError::InvalidShape(
            "script name must be a string".to_string(),
        ));
    };

    let Value::Array(pairs) = script_args else {
        return Err(CommandArgsError::InvalidShape(format!(
            "arguments must be a list-like container, got {}",
            json_type_name(script_args)
        )));
    };

    if pairs.len() % 2 != 0 {
        return Err(CommandFailure::new(
            "Invalid script arguments provided",
            format!(
                "The script arguments must be a list of key-value pairs, got {} elements",
                pairs.len()
            ),
        )
        .into());
    }

    let mut params = Map::new();
    for pair in pairs.chunks_exact(2) {
        let key = match &pair[0] {
            Value::String(key) => key.clone(),
            other => other.to_string(),
        };
        params.insert(key, pair[1].clone());
    }

    Ok((script_name.clone(), params))
}

/// Deserialize command parameters into a typed model.
///
/// Validation failures become a [`CommandFailure`] with the summary
/// `"Bad arguments"`, so handlers can simply use `?`. Use
/// `#[serde(deny_unknown_fields)]` on the model to reject extra parameters.
pub fn parse_command_model<T: DeserializeOwned>(
    params: Map<String, Value>,
) -> Result<T, CommandFailure> {
    serde_json::from_value(Value::Object(params))
        .map_err(|e| CommandFailure::new("Bad arguments", e.to_string()))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
