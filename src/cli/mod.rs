//! Command-line interface definitions for the `rebootstrap` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Names accepted by `rebootstrap action`.
pub(crate) const ACTION_NAMES: [&str; 7] = [
    "upgrade",
    "driver-fix",
    "token-init",
    "environment-start",
    "environment-stop",
    "backup",
    "reboot",
];

/// Top-level CLI for the `rebootstrap` binary.
#[derive(Debug, Parser)]
#[command(
    name = "rebootstrap",
    about = "Provision this workstation in phases that survive reboots",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level and show phase timings unless `RUST_LOG` is set.
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `rebootstrap` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run phases from the saved position until a restart is required.
    ///
    /// Exits with 0 once every phase has run, 2 when the machine must be
    /// restarted before the next phase, and 1 when a phase failed or the
    /// saved status is inconsistent.
    #[command(name = "run")]
    Run,
    /// Print the saved status record as JSON.
    #[command(name = "status")]
    Status,
    /// Discard the saved status and start over from the first phase.
    #[command(name = "reset")]
    Reset,
    /// Run one provisioning action on its own without touching the saved
    /// status.
    ///
    /// Exits with 0 when the action's command succeeds and 1 otherwise.
    #[command(name = "action")]
    Action(ActionCommand),
    /// Serve the HTTP routes.
    #[command(name = "serve")]
    Serve(ServeCommand),
}

/// Arguments for the `rebootstrap action` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ActionCommand {
    /// Action to run.
    #[arg(value_name = "ACTION", value_parser = ACTION_NAMES)]
    pub(crate) name: String,
}

/// Arguments for the `rebootstrap serve` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ServeCommand {
    /// Socket address to listen on; overrides `listen_addr` from
    /// configuration.
    #[arg(long, value_name = "ADDR")]
    pub(crate) listen: Option<String>,
}
