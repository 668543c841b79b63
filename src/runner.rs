//! External command execution.
//!
//! Every process the provisioner starts goes through a [`CommandRunner`].
//! Production wiring wraps [`ProcessCommandRunner`] in a [`LoggingRunner`] so
//! each invocation leaves a timestamped transcript in the [`CommandLog`],
//! which survives the reboots the phases trigger.

use std::ffi::OsString;
use std::io::{self, Write as _};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{SecondsFormat, Utc};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, warn};

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Returns stdout followed by stderr, for output predicates that do not
    /// care which stream a marker was written to.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() && !self.stdout.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }

    /// Describes how the process exited.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code.map_or_else(
            || String::from("no exit status (terminated by signal)"),
            |code| format!("exit status {code}"),
        )
    }
}

/// Errors raised when a command cannot be run at all.
///
/// A nonzero exit status is not an error; callers inspect
/// [`CommandOutput::code`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| RunnerError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Append-only transcript of executed commands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLog {
    path: Utf8PathBuf,
}

impl CommandLog {
    /// Creates a log that appends to `path`, creating parent directories on
    /// first write.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the transcript location.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Appends `entry` to the transcript.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the directory or file cannot be
    /// opened or written.
    pub fn append(&self, entry: &str) -> io::Result<()> {
        let parent = parent_dir(&self.path);
        let file_name = self.path.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("log path {} is missing a filename", self.path),
            )
        })?;

        Dir::create_ambient_dir_all(parent, ambient_authority())?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let mut file = dir.open_with(file_name, &options)?;
        file.write_all(entry.as_bytes())
    }
}

/// Returns the directory containing `path`, treating a bare file name as
/// relative to the working directory.
pub(crate) fn parent_dir(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
}

/// Decorator that records every invocation of the wrapped runner.
#[derive(Clone, Debug)]
pub struct LoggingRunner<R> {
    inner: R,
    log: CommandLog,
}

impl<R: CommandRunner> LoggingRunner<R> {
    /// Wraps `inner`, appending transcripts to `log`.
    #[must_use]
    pub const fn new(inner: R, log: CommandLog) -> Self {
        Self { inner, log }
    }
}

impl<R: CommandRunner> CommandRunner for LoggingRunner<R> {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        let command_line = render_command_line(program, args);
        debug!(command = %command_line, "running command");
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let result = self.inner.run(program, args);

        let entry = format_entry(&started, &command_line, &result);
        if let Err(err) = self.log.append(&entry) {
            warn!(path = %self.log.path(), error = %err, "failed to write command log");
        }
        result
    }
}

/// Renders a shell-escaped command line for transcripts and diagnostics.
#[must_use]
pub fn render_command_line(program: &str, args: &[OsString]) -> String {
    let mut rendered = escape(program.into()).into_owned();
    for arg in args {
        rendered.push(' ');
        let lossy = arg.to_string_lossy();
        rendered.push_str(escape(lossy).as_ref());
    }
    rendered
}

fn format_entry(
    timestamp: &str,
    command_line: &str,
    result: &Result<CommandOutput, RunnerError>,
) -> String {
    let mut entry = format!("\n=== {timestamp} {command_line} ===\n");
    match result {
        Ok(output) => {
            entry.push_str(&output.status_text());
            entry.push_str("\nSTDOUT:\n");
            entry.push_str(&output.stdout);
            entry.push_str("\nSTDERR:\n");
            entry.push_str(&output.stderr);
        }
        Err(err) => {
            entry.push_str(&err.to_string());
        }
    }
    entry.push_str("\n=== END ===\n");
    entry
}
