//! Binary entry point for the `rebootstrap` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;

use rebootstrap::logging::{self, LoggingError};
use rebootstrap::server::{self, AppState, ServerError};
use rebootstrap::{
    Action, CommandLog, ConfigError, FileStatusStore, LoggingRunner, Orchestrator,
    OrchestratorError, ProcessCommandRunner, ProvisionConfig, RunOutcome, RunnerError,
    SystemProvisioner,
};

mod cli;

use cli::{ActionCommand, Cli, Command, ServeCommand};

/// Exit status for a failed phase, an inconsistent record, or any error.
const EXIT_FAILURE: i32 = 1;

/// Exit status when the machine must restart before the next phase.
const EXIT_RESTART_REQUIRED: i32 = 2;

type SystemOrchestrator =
    Orchestrator<FileStatusStore, SystemProvisioner<LoggingRunner<ProcessCommandRunner>>>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Action(#[from] RunnerError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            EXIT_FAILURE
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    logging::init_tracing(cli.verbose)?;
    let config = ProvisionConfig::load_without_cli_args()?;

    match cli.command {
        Command::Run => run_once(&build_orchestrator(config)?),
        Command::Status => {
            write_json(io::stdout(), &build_orchestrator(config)?.status())?;
            Ok(0)
        }
        Command::Reset => {
            write_json(io::stdout(), &build_orchestrator(config)?.reset()?)?;
            Ok(0)
        }
        Command::Action(args) => run_action(&build_orchestrator(config)?, &args),
        Command::Serve(args) => serve(config, args).await,
    }
}

fn build_orchestrator(config: ProvisionConfig) -> Result<SystemOrchestrator, CliError> {
    let store = FileStatusStore::new(config.state_file());
    let runner = LoggingRunner::new(ProcessCommandRunner, CommandLog::new(config.log_file()));
    let detail_limit = config.detail_limit;
    let provisioner = SystemProvisioner::new(config, runner)?;
    Ok(Orchestrator::new(store, provisioner).with_detail_limit(detail_limit))
}

fn run_once(orchestrator: &SystemOrchestrator) -> Result<i32, CliError> {
    let report = orchestrator.run_setup()?;
    writeln!(io::stdout(), "{}", report.outcome).map_err(|err| CliError::Output(err.to_string()))?;
    Ok(exit_code_for(&report.outcome))
}

fn run_action(orchestrator: &SystemOrchestrator, args: &ActionCommand) -> Result<i32, CliError> {
    let Some(action) = Action::from_name(&args.name) else {
        return Err(CliError::UnknownAction(args.name.clone()));
    };
    let output = orchestrator.run_action(action)?;
    writeln!(io::stdout(), "{action} finished with {}", output.status_text())
        .map_err(|err| CliError::Output(err.to_string()))?;
    Ok(if output.is_success() { 0 } else { EXIT_FAILURE })
}

async fn serve(config: ProvisionConfig, args: ServeCommand) -> Result<i32, CliError> {
    let addr = args.listen.unwrap_or_else(|| config.listen_addr.clone());
    let state = AppState::new(build_orchestrator(config)?);
    server::serve(&addr, state).await?;
    Ok(0)
}

const fn exit_code_for(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Complete => 0,
        RunOutcome::Paused { .. } => EXIT_RESTART_REQUIRED,
        RunOutcome::Failed { .. } | RunOutcome::Anomaly { .. } => EXIT_FAILURE,
    }
}

fn write_json(mut target: impl Write, value: &impl Serialize) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target, "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
