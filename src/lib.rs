pub mod commands;
pub mod config;
pub mod connector;
pub mod errors;
pub mod logging;
pub mod runtime;
mod sync;
pub mod transport;

pub use connector::{FleetConnector, RobotConnector, RobotContext, SingleRobot};
pub use runtime::{ExecutionState, FleetContext, FleetRuntime, RuntimeOptions};
