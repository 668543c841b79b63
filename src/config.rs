//! Configuration loading via `ortho-config`.
//!
//! Every location and identifier the provisioning run touches lives here so
//! the orchestrator, the command runner, and the provisioner receive it at
//! construction instead of reading process-wide globals.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default location of the persisted status record.
pub const DEFAULT_STATE_PATH: &str = "~/.local/state/rebootstrap/status.json";

/// Default location of the command transcript.
pub const DEFAULT_LOG_PATH: &str = "~/.local/state/rebootstrap/commands.log";

/// Default kernel arguments appended by the driver fix.
pub const DEFAULT_DRIVER_KERNEL_ARGS: &str =
    "rd.driver.blacklist=nouveau modprobe.blacklist=nouveau nvidia-drm.modeset=1";

/// Default container that hosts the user environment and the backup tooling.
pub const DEFAULT_CONTAINER_NAME: &str = "fedora42-nvidia";

/// Provisioning settings layered from defaults, `rebootstrap.toml`, and
/// `REBOOTSTRAP_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "REBOOTSTRAP",
    discovery(
        app_name = "rebootstrap",
        env_var = "REBOOTSTRAP_CONFIG_PATH",
        config_file_name = "rebootstrap.toml",
        dotfile_name = ".rebootstrap.toml",
        project_file_name = "rebootstrap.toml"
    )
)]
pub struct ProvisionConfig {
    /// Path of the persisted status record. Supports tilde expansion.
    #[ortho_config(default = DEFAULT_STATE_PATH.to_owned())]
    pub state_path: String,
    /// Path of the command transcript. Supports tilde expansion.
    #[ortho_config(default = DEFAULT_LOG_PATH.to_owned())]
    pub log_path: String,
    /// Path to the `rpm-ostree` executable used for upgrades and kernel
    /// arguments.
    #[ortho_config(default = "rpm-ostree".to_owned())]
    pub rpm_ostree_bin: String,
    /// Graphics driver probe run inside `container_name`; exit status zero
    /// means healthy.
    #[ortho_config(default = "nvidia-smi".to_owned())]
    pub driver_probe_bin: String,
    /// Whitespace-separated kernel arguments appended by the driver fix.
    #[ortho_config(default = DEFAULT_DRIVER_KERNEL_ARGS.to_owned())]
    pub driver_kernel_args: String,
    /// Path to the `systemctl` executable.
    #[ortho_config(default = "systemctl".to_owned())]
    pub systemctl_bin: String,
    /// Smartcard service restarted before probing the hardware token.
    #[ortho_config(default = "pcscd".to_owned())]
    pub smartcard_service: String,
    /// Path to the `gpg` executable.
    #[ortho_config(default = "gpg".to_owned())]
    pub gpg_bin: String,
    /// Path to the `distrobox` executable.
    #[ortho_config(default = "distrobox".to_owned())]
    pub distrobox_bin: String,
    /// Container entered to start the environment and run the backup.
    #[ortho_config(default = DEFAULT_CONTAINER_NAME.to_owned())]
    pub container_name: String,
    /// Command run inside the container to bring the environment up.
    #[ortho_config(default = "true".to_owned())]
    pub environment_command: String,
    /// Command run inside the container to shut the environment down.
    #[ortho_config(default = "true".to_owned())]
    pub environment_stop_command: String,
    /// Path to the `uv` executable inside the container.
    #[ortho_config(default = "uv".to_owned())]
    pub uv_bin: String,
    /// Backup script run with `uv run` inside the container. Supports tilde
    /// expansion.
    #[ortho_config(default = "~/backup_service/backup.py".to_owned())]
    pub backup_script: String,
    /// Maximum number of characters of captured stderr kept in a step detail.
    #[ortho_config(default = 500)]
    pub detail_limit: usize,
    /// Socket address the HTTP layer listens on.
    #[ortho_config(default = "127.0.0.1:8000".to_owned())]
    pub listen_addr: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(env_var: &'static str, toml_key: &'static str) -> Self {
        Self { env_var, toml_key }
    }
}

impl ProvisionConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("rebootstrap")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name both the environment
    /// variable and the TOML key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is blank,
    /// or [`ConfigError::InvalidDetailLimit`] when `detail_limit` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (&self.state_path, FieldMetadata::new("REBOOTSTRAP_STATE_PATH", "state_path")),
            (&self.log_path, FieldMetadata::new("REBOOTSTRAP_LOG_PATH", "log_path")),
            (
                &self.rpm_ostree_bin,
                FieldMetadata::new("REBOOTSTRAP_RPM_OSTREE_BIN", "rpm_ostree_bin"),
            ),
            (
                &self.driver_probe_bin,
                FieldMetadata::new("REBOOTSTRAP_DRIVER_PROBE_BIN", "driver_probe_bin"),
            ),
            (
                &self.systemctl_bin,
                FieldMetadata::new("REBOOTSTRAP_SYSTEMCTL_BIN", "systemctl_bin"),
            ),
            (
                &self.smartcard_service,
                FieldMetadata::new("REBOOTSTRAP_SMARTCARD_SERVICE", "smartcard_service"),
            ),
            (&self.gpg_bin, FieldMetadata::new("REBOOTSTRAP_GPG_BIN", "gpg_bin")),
            (
                &self.distrobox_bin,
                FieldMetadata::new("REBOOTSTRAP_DISTROBOX_BIN", "distrobox_bin"),
            ),
            (
                &self.container_name,
                FieldMetadata::new("REBOOTSTRAP_CONTAINER_NAME", "container_name"),
            ),
            (
                &self.environment_command,
                FieldMetadata::new("REBOOTSTRAP_ENVIRONMENT_COMMAND", "environment_command"),
            ),
            (
                &self.environment_stop_command,
                FieldMetadata::new(
                    "REBOOTSTRAP_ENVIRONMENT_STOP_COMMAND",
                    "environment_stop_command",
                ),
            ),
            (&self.uv_bin, FieldMetadata::new("REBOOTSTRAP_UV_BIN", "uv_bin")),
            (
                &self.backup_script,
                FieldMetadata::new("REBOOTSTRAP_BACKUP_SCRIPT", "backup_script"),
            ),
            (
                &self.listen_addr,
                FieldMetadata::new("REBOOTSTRAP_LISTEN_ADDR", "listen_addr"),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        if self.detail_limit == 0 {
            return Err(ConfigError::InvalidDetailLimit);
        }
        Ok(())
    }

    /// Returns the status record path with `~/` expanded.
    #[must_use]
    pub fn state_file(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.state_path))
    }

    /// Returns the command transcript path with `~/` expanded.
    #[must_use]
    pub fn log_file(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.log_path))
    }

    /// Returns the kernel arguments appended by the driver fix.
    #[must_use]
    pub fn kernel_args(&self) -> Vec<&str> {
        self.driver_kernel_args.split_whitespace().collect()
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add it to rebootstrap.toml",
                metadata.toml_key, metadata.env_var
            )));
        }
        Ok(())
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use rebootstrap::config::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/status.json"), format!("{home}/status.json"));
/// assert_eq!(expand_tilde("/var/lib/status.json"), "/var/lib/status.json");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates the stderr truncation limit is zero.
    #[error(
        "detail_limit must be greater than zero: set REBOOTSTRAP_DETAIL_LIMIT or add \
         detail_limit to rebootstrap.toml"
    )]
    InvalidDetailLimit,
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
