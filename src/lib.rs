//! Core library for the `rebootstrap` provisioning tool.
//!
//! The crate drives a fixed sequence of workstation setup phases (system
//! upgrade, graphics driver fix, hardware token initialisation, container
//! environment start, backup). Phases may need the machine to restart, so
//! progress lives in a durable status record and every run resumes from the
//! phase that record names.

pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod phases;
pub mod provision;
pub mod runner;
pub mod server;
pub mod status;
pub mod store;
pub mod test_support;

pub use config::{ConfigError, ProvisionConfig};
pub use orchestrator::{Orchestrator, OrchestratorError, RunOutcome, RunReport};
pub use phases::{Transition, run_phase, upgrade_staged};
pub use provision::{Action, Provisioner, SystemProvisioner};
pub use runner::{
    CommandLog, CommandOutput, CommandRunner, LoggingRunner, ProcessCommandRunner, RunnerError,
};
pub use server::{AppState, ServerError, SetupService, build_router};
pub use status::{Phase, PhaseCursor, StatusRecord, StepResult, StepStatus, Steps};
pub use store::{FileStatusStore, StatusStore, StoreError};
