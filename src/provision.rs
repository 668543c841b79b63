//! Operating-system collaborators invoked by the provisioning phases.
//!
//! [`Provisioner`] is the narrow seam between the phase state machine and the
//! host: one method per external action. [`SystemProvisioner`] renders each
//! action as a command line from [`ProvisionConfig`] and runs it through a
//! [`CommandRunner`]. [`Action`] names the operations an operator may trigger
//! one at a time, outside the phase sequence.

use std::ffi::OsString;
use std::fmt;

use crate::config::{ConfigError, ProvisionConfig, expand_tilde};
use crate::runner::{CommandOutput, CommandRunner, RunnerError};

/// External actions the phases depend on.
pub trait Provisioner {
    /// Triggers the OS upgrade; the output is inspected for a staged
    /// deployment.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the upgrade command cannot be started.
    fn upgrade_system(&self) -> Result<CommandOutput, RunnerError>;

    /// Returns `true` when the graphics driver already works inside the
    /// container.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the probe cannot be started.
    fn probe_driver_health(&self) -> Result<bool, RunnerError>;

    /// Applies the kernel arguments that fix the graphics driver.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the fix cannot be started.
    fn apply_driver_fix(&self) -> Result<CommandOutput, RunnerError>;

    /// Resets the smartcard service and wakes the hardware token.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when a command cannot be started.
    fn init_hardware_token(&self) -> Result<CommandOutput, RunnerError>;

    /// Starts the container environment.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the container tool cannot be started.
    fn start_environment(&self) -> Result<CommandOutput, RunnerError>;

    /// Runs the backup tooling.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the container tool cannot be started.
    fn run_backup(&self) -> Result<CommandOutput, RunnerError>;

    /// Stops the container environment.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the container tool cannot be started.
    fn stop_environment(&self) -> Result<CommandOutput, RunnerError>;

    /// Asks the host to restart.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when `systemctl` cannot be started.
    fn reboot(&self) -> Result<CommandOutput, RunnerError>;
}

/// A collaborator operation triggered on its own.
///
/// Actions run exactly one collaborator and never read or write the status
/// record, so they can repair or inspect a machine without moving the phase
/// cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// [`Provisioner::upgrade_system`].
    Upgrade,
    /// [`Provisioner::apply_driver_fix`], without probing first.
    DriverFix,
    /// [`Provisioner::init_hardware_token`].
    TokenInit,
    /// [`Provisioner::start_environment`].
    EnvironmentStart,
    /// [`Provisioner::stop_environment`].
    EnvironmentStop,
    /// [`Provisioner::run_backup`].
    Backup,
    /// [`Provisioner::reboot`].
    Reboot,
}

impl Action {
    /// Every action, in the order they are listed to operators.
    pub const ALL: [Self; 7] = [
        Self::Upgrade,
        Self::DriverFix,
        Self::TokenInit,
        Self::EnvironmentStart,
        Self::EnvironmentStop,
        Self::Backup,
        Self::Reboot,
    ];

    /// Returns the name used on the command line and in routes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::DriverFix => "driver-fix",
            Self::TokenInit => "token-init",
            Self::EnvironmentStart => "environment-start",
            Self::EnvironmentStop => "environment-stop",
            Self::Backup => "backup",
            Self::Reboot => "reboot",
        }
    }

    /// Returns the acknowledgement sent when the action is started in the
    /// background.
    #[must_use]
    pub const fn acknowledgement(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade_started",
            Self::DriverFix => "driver_fix_started",
            Self::TokenInit => "token_init_started",
            Self::EnvironmentStart => "environment_start_started",
            Self::EnvironmentStop => "environment_stop_started",
            Self::Backup => "backup_started",
            Self::Reboot => "reboot_started",
        }
    }

    /// Looks up an action by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == name)
    }

    /// Runs the action against `provisioner`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the underlying command cannot be started.
    pub fn perform<P: Provisioner + ?Sized>(
        self,
        provisioner: &P,
    ) -> Result<CommandOutput, RunnerError> {
        match self {
            Self::Upgrade => provisioner.upgrade_system(),
            Self::DriverFix => provisioner.apply_driver_fix(),
            Self::TokenInit => provisioner.init_hardware_token(),
            Self::EnvironmentStart => provisioner.start_environment(),
            Self::EnvironmentStop => provisioner.stop_environment(),
            Self::Backup => provisioner.run_backup(),
            Self::Reboot => provisioner.reboot(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioner that drives the host through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct SystemProvisioner<R: CommandRunner> {
    config: ProvisionConfig,
    runner: R,
}

impl<R: CommandRunner> SystemProvisioner<R> {
    /// Creates a provisioner from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration validation fails.
    pub fn new(config: ProvisionConfig, runner: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        self.runner.run(program, args)
    }

    fn upgrade_args() -> Vec<OsString> {
        vec![OsString::from("upgrade")]
    }

    fn driver_fix_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("kargs")];
        args.extend(
            self.config
                .kernel_args()
                .into_iter()
                .map(|arg| OsString::from(format!("--append-if-missing={arg}"))),
        );
        args
    }

    fn container_args(&self, command: &[&str]) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("enter"),
            OsString::from(&self.config.container_name),
            OsString::from("--"),
        ];
        args.extend(command.iter().map(OsString::from));
        args
    }

    fn container_command_args(&self, command: &str) -> Vec<OsString> {
        let words: Vec<&str> = command.split_whitespace().collect();
        self.container_args(&words)
    }

    fn backup_args(&self) -> Vec<OsString> {
        let script = expand_tilde(&self.config.backup_script);
        self.container_args(&[self.config.uv_bin.as_str(), "run", script.as_str()])
    }
}

impl<R: CommandRunner> Provisioner for SystemProvisioner<R> {
    fn upgrade_system(&self) -> Result<CommandOutput, RunnerError> {
        self.run(&self.config.rpm_ostree_bin, &Self::upgrade_args())
    }

    fn probe_driver_health(&self) -> Result<bool, RunnerError> {
        let probe = self.container_args(&[self.config.driver_probe_bin.as_str()]);
        self.run(&self.config.distrobox_bin, &probe)
            .map(|output| output.is_success())
    }

    fn apply_driver_fix(&self) -> Result<CommandOutput, RunnerError> {
        self.run(&self.config.rpm_ostree_bin, &self.driver_fix_args())
    }

    fn init_hardware_token(&self) -> Result<CommandOutput, RunnerError> {
        let restart = self.run(
            &self.config.systemctl_bin,
            &[
                OsString::from("restart"),
                OsString::from(&self.config.smartcard_service),
            ],
        )?;
        if !restart.is_success() {
            return Ok(restart);
        }
        self.run(&self.config.gpg_bin, &[OsString::from("--card-status")])
    }

    fn start_environment(&self) -> Result<CommandOutput, RunnerError> {
        let args = self.container_command_args(&self.config.environment_command);
        self.run(&self.config.distrobox_bin, &args)
    }

    fn run_backup(&self) -> Result<CommandOutput, RunnerError> {
        self.run(&self.config.distrobox_bin, &self.backup_args())
    }

    fn stop_environment(&self) -> Result<CommandOutput, RunnerError> {
        let args = self.container_command_args(&self.config.environment_stop_command);
        self.run(&self.config.distrobox_bin, &args)
    }

    fn reboot(&self) -> Result<CommandOutput, RunnerError> {
        self.run(&self.config.systemctl_bin, &[OsString::from("reboot")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, provision_config};
    use rstest::{fixture, rstest};

    struct ProvisionerFixture {
        runner: ScriptedRunner,
        provisioner: SystemProvisioner<ScriptedRunner>,
    }

    #[fixture]
    fn provisioner_fixture() -> ProvisionerFixture {
        let runner = ScriptedRunner::new();
        let config = provision_config("/tmp/rebootstrap");
        let provisioner = SystemProvisioner::new(config, runner.clone())
            .unwrap_or_else(|err| panic!("provisioner: {err}"));
        ProvisionerFixture {
            runner,
            provisioner,
        }
    }

    fn commands(runner: &ScriptedRunner) -> Vec<String> {
        runner
            .invocations()
            .iter()
            .map(|invocation| invocation.command_string())
            .collect()
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = ProvisionConfig {
            distrobox_bin: String::new(),
            ..provision_config("/tmp/rebootstrap")
        };
        assert!(SystemProvisioner::new(config, ScriptedRunner::new()).is_err());
    }

    #[rstest]
    fn upgrade_runs_rpm_ostree_upgrade(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_output(Some(0), "No upgrade available.", "");

        let output = provisioner_fixture
            .provisioner
            .upgrade_system()
            .unwrap_or_else(|err| panic!("upgrade: {err}"));

        assert_eq!(output.stdout, "No upgrade available.");
        assert_eq!(commands(&provisioner_fixture.runner), vec!["rpm-ostree upgrade"]);
    }

    #[rstest]
    #[case(Some(0), true)]
    #[case(Some(9), false)]
    #[case(None, false)]
    fn probe_maps_exit_status_to_health(
        provisioner_fixture: ProvisionerFixture,
        #[case] code: Option<i32>,
        #[case] healthy: bool,
    ) {
        provisioner_fixture.runner.push_output(code, "", "");

        let result = provisioner_fixture
            .provisioner
            .probe_driver_health()
            .unwrap_or_else(|err| panic!("probe: {err}"));

        assert_eq!(result, healthy);
        assert_eq!(
            commands(&provisioner_fixture.runner),
            vec!["distrobox enter fedora42-nvidia -- nvidia-smi"]
        );
    }

    #[rstest]
    fn driver_fix_appends_each_kernel_argument(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_success();

        provisioner_fixture
            .provisioner
            .apply_driver_fix()
            .unwrap_or_else(|err| panic!("fix: {err}"));

        assert_eq!(
            commands(&provisioner_fixture.runner),
            vec![concat!(
                "rpm-ostree kargs ",
                "--append-if-missing=rd.driver.blacklist=nouveau ",
                "--append-if-missing=modprobe.blacklist=nouveau ",
                "--append-if-missing=nvidia-drm.modeset=1"
            )]
        );
    }

    #[rstest]
    fn token_init_restarts_service_then_probes_card(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_success();
        provisioner_fixture.runner.push_output(Some(0), "Reader ...: Yubico YubiKey", "");

        let output = provisioner_fixture
            .provisioner
            .init_hardware_token()
            .unwrap_or_else(|err| panic!("token: {err}"));

        assert!(output.is_success());
        assert_eq!(
            commands(&provisioner_fixture.runner),
            vec!["systemctl restart pcscd", "gpg --card-status"]
        );
    }

    #[rstest]
    fn token_init_stops_after_failed_restart(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_failure(5);

        let output = provisioner_fixture
            .provisioner
            .init_hardware_token()
            .unwrap_or_else(|err| panic!("token: {err}"));

        assert_eq!(output.code, Some(5));
        assert_eq!(commands(&provisioner_fixture.runner), vec!["systemctl restart pcscd"]);
    }

    #[rstest]
    fn environment_start_enters_container(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_success();

        provisioner_fixture
            .provisioner
            .start_environment()
            .unwrap_or_else(|err| panic!("environment: {err}"));

        assert_eq!(
            commands(&provisioner_fixture.runner),
            vec!["distrobox enter fedora42-nvidia -- true"]
        );
    }

    #[rstest]
    fn backup_runs_script_with_uv_inside_container(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_success();

        provisioner_fixture
            .provisioner
            .run_backup()
            .unwrap_or_else(|err| panic!("backup: {err}"));

        assert_eq!(
            commands(&provisioner_fixture.runner),
            vec!["distrobox enter fedora42-nvidia -- uv run /srv/backup/backup.py"]
        );
    }

    #[rstest]
    fn environment_stop_runs_stop_command_inside_container(
        provisioner_fixture: ProvisionerFixture,
    ) {
        provisioner_fixture.runner.push_success();

        provisioner_fixture
            .provisioner
            .stop_environment()
            .unwrap_or_else(|err| panic!("environment stop: {err}"));

        assert_eq!(
            commands(&provisioner_fixture.runner),
            vec!["distrobox enter fedora42-nvidia -- /srv/env/stop.sh --all"]
        );
    }

    #[rstest]
    fn reboot_asks_systemctl(provisioner_fixture: ProvisionerFixture) {
        provisioner_fixture.runner.push_success();

        provisioner_fixture
            .provisioner
            .reboot()
            .unwrap_or_else(|err| panic!("reboot: {err}"));

        assert_eq!(commands(&provisioner_fixture.runner), vec!["systemctl reboot"]);
    }

    #[rstest]
    #[case::upgrade("upgrade", "rpm-ostree upgrade")]
    #[case::token("token-init", "systemctl restart pcscd")]
    #[case::environment_start("environment-start", "distrobox enter fedora42-nvidia -- true")]
    #[case::backup(
        "backup",
        "distrobox enter fedora42-nvidia -- uv run /srv/backup/backup.py"
    )]
    #[case::reboot("reboot", "systemctl reboot")]
    fn action_runs_its_collaborator(
        provisioner_fixture: ProvisionerFixture,
        #[case] name: &str,
        #[case] expected: &str,
    ) {
        provisioner_fixture.runner.push_failure(1);
        let action = Action::from_name(name).unwrap_or_else(|| panic!("unknown action {name}"));

        let output = action
            .perform(&provisioner_fixture.provisioner)
            .unwrap_or_else(|err| panic!("{action}: {err}"));

        assert_eq!(output.code, Some(1));
        assert_eq!(commands(&provisioner_fixture.runner), vec![expected]);
    }

    #[test]
    fn action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(Action::from_name(action.as_str()), Some(action));
            assert!(action.acknowledgement().ends_with("_started"));
        }
        assert_eq!(Action::from_name("kleopatra"), None);
    }

    #[rstest]
    fn spawn_failures_propagate(provisioner_fixture: ProvisionerFixture) {
        let Err(err) = provisioner_fixture.provisioner.run_backup() else {
            panic!("empty script should fail to spawn");
        };
        assert!(matches!(err, RunnerError::Spawn { ref program, .. } if program == "distrobox"));
    }
}
