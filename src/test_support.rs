//! Test support utilities shared across unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::ProvisionConfig;
use crate::provision::Provisioner;
use crate::runner::{CommandOutput, CommandRunner, RunnerError};
use crate::status::StatusRecord;
use crate::store::{StatusStore, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output(
    code: Option<i32>,
    stdout: impl Into<String>,
    stderr: impl Into<String>,
) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

/// Builds a configuration rooted at `root` with every field populated.
#[must_use]
pub fn provision_config(root: &str) -> ProvisionConfig {
    ProvisionConfig {
        state_path: format!("{root}/status.json"),
        log_path: format!("{root}/commands.log"),
        rpm_ostree_bin: String::from("rpm-ostree"),
        driver_probe_bin: String::from("nvidia-smi"),
        driver_kernel_args: String::from(crate::config::DEFAULT_DRIVER_KERNEL_ARGS),
        systemctl_bin: String::from("systemctl"),
        smartcard_service: String::from("pcscd"),
        gpg_bin: String::from("gpg"),
        distrobox_bin: String::from("distrobox"),
        container_name: String::from(crate::config::DEFAULT_CONTAINER_NAME),
        environment_command: String::from("true"),
        environment_stop_command: String::from("/srv/env/stop.sh --all"),
        uv_bin: String::from("uv"),
        backup_script: String::from("/srv/backup/backup.py"),
        detail_limit: 500,
        listen_addr: String::from("127.0.0.1:0"),
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(output(code, stdout, stderr));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Collaborator operations exposed by [`Provisioner`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Provisioner::upgrade_system`].
    Upgrade,
    /// [`Provisioner::probe_driver_health`].
    ProbeDriver,
    /// [`Provisioner::apply_driver_fix`].
    FixDriver,
    /// [`Provisioner::init_hardware_token`].
    InitToken,
    /// [`Provisioner::start_environment`].
    StartEnvironment,
    /// [`Provisioner::run_backup`].
    Backup,
    /// [`Provisioner::stop_environment`].
    StopEnvironment,
    /// [`Provisioner::reboot`].
    Reboot,
}

#[derive(Clone, Debug)]
enum Response {
    Output(CommandOutput),
    Spawn(String),
}

#[derive(Debug, Default)]
struct ProvisionerState {
    responses: HashMap<Operation, VecDeque<Response>>,
    calls: Vec<Operation>,
}

/// Provisioner double with per-operation scripted responses.
///
/// An operation with nothing queued succeeds with empty output, so an
/// unscripted run skips the upgrade, finds the driver healthy, and completes
/// every remaining phase. For [`Operation::ProbeDriver`] a zero exit status
/// means healthy.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl ScriptedProvisioner {
    /// Creates a provisioner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an explicit output for `operation`.
    pub fn push_output(
        &self,
        operation: Operation,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(operation, Response::Output(output(code, stdout, stderr)));
    }

    /// Queues a nonzero exit for `operation` with `stderr` text.
    pub fn push_failure(&self, operation: Operation, code: i32, stderr: impl Into<String>) {
        self.push_output(operation, Some(code), "", stderr);
    }

    /// Queues a spawn failure for `operation`.
    pub fn push_spawn_error(&self, operation: Operation, message: impl Into<String>) {
        self.push(operation, Response::Spawn(message.into()));
    }

    /// Queues an upgrade that stages a new deployment.
    pub fn push_staged_upgrade(&self) {
        self.push_output(
            Operation::Upgrade,
            Some(0),
            "Staging deployment...done\nRun \"systemctl reboot\" to start a reboot\n",
            "",
        );
    }

    /// Queues a driver probe that reports the driver as broken.
    pub fn push_unhealthy_driver(&self) {
        self.push_failure(
            Operation::ProbeDriver,
            9,
            "NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver",
        );
    }

    /// Returns the operations invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Operation> {
        lock(&self.state).calls.clone()
    }

    fn push(&self, operation: Operation, response: Response) {
        lock(&self.state)
            .responses
            .entry(operation)
            .or_default()
            .push_back(response);
    }

    fn respond(&self, operation: Operation) -> Result<CommandOutput, RunnerError> {
        let mut state = lock(&self.state);
        state.calls.push(operation);
        let response = state
            .responses
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match response {
            None => Ok(output(Some(0), "", "")),
            Some(Response::Output(scripted)) => Ok(scripted),
            Some(Response::Spawn(message)) => Err(RunnerError::Spawn {
                program: format!("{operation:?}"),
                message,
            }),
        }
    }
}

impl Provisioner for ScriptedProvisioner {
    fn upgrade_system(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::Upgrade)
    }

    fn probe_driver_health(&self) -> Result<bool, RunnerError> {
        self.respond(Operation::ProbeDriver)
            .map(|probe| probe.is_success())
    }

    fn apply_driver_fix(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::FixDriver)
    }

    fn init_hardware_token(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::InitToken)
    }

    fn start_environment(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::StartEnvironment)
    }

    fn run_backup(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::Backup)
    }

    fn stop_environment(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::StopEnvironment)
    }

    fn reboot(&self) -> Result<CommandOutput, RunnerError> {
        self.respond(Operation::Reboot)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<StatusRecord>,
    history: Vec<StatusRecord>,
    fail_saves: bool,
}

/// In-memory status store that keeps every saved snapshot.
#[derive(Clone, Debug, Default)]
pub struct MemoryStatusStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStatusStore {
    /// Creates an empty store; the first load yields a fresh record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `record`.
    #[must_use]
    pub fn with_record(record: StatusRecord) -> Self {
        let store = Self::new();
        lock(&store.state).current = Some(record);
        store
    }

    /// Makes every subsequent save fail.
    pub fn fail_saves(&self) {
        lock(&self.state).fail_saves = true;
    }

    /// Returns the most recently saved record, if any.
    #[must_use]
    pub fn current(&self) -> Option<StatusRecord> {
        lock(&self.state).current.clone()
    }

    /// Returns every record saved so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<StatusRecord> {
        lock(&self.state).history.clone()
    }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self) -> StatusRecord {
        lock(&self.state)
            .current
            .clone()
            .unwrap_or_else(StatusRecord::fresh)
    }

    fn save(&self, record: &mut StatusRecord) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.fail_saves {
            return Err(StoreError::Io {
                path: camino::Utf8PathBuf::from("memory"),
                message: String::from("simulated write failure"),
            });
        }
        record.touch(chrono::Utc::now());
        state.current = Some(record.clone());
        state.history.push(record.clone());
        Ok(())
    }
}
