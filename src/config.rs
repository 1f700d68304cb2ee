//! Configuration loading via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::wait::PollPolicy;

/// Configuration file name searched for by discovery.
pub const CONFIG_FILE_NAME: &str = "longhorn-br.toml";

/// Settings shared by the backup and restore workflows, derived from
/// defaults, configuration files, environment variables, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "LONGHORN_BR",
    discovery(
        app_name = "longhorn-br",
        env_var = "LONGHORN_BR_CONFIG_PATH",
        config_file_name = "longhorn-br.toml",
        dotfile_name = ".longhorn-br.toml",
        project_file_name = "longhorn-br.toml"
    )
)]
pub struct BackupRestoreConfig {
    /// Base URL of the Longhorn manager API, for example
    /// `http://longhorn-frontend.longhorn-system:80`. Required.
    pub api_endpoint: Option<String>,
    /// Path to the kubeconfig used to reach the cluster-state API.
    #[ortho_config(default = "./kubeconfig".to_owned())]
    pub kubeconfig: String,
    /// Namespace holding Longhorn volumes, snapshots, and backups.
    #[ortho_config(default = "longhorn-system".to_owned())]
    pub namespace: String,
    /// Storage class selecting which claims are recorded.
    #[ortho_config(default = "longhorn".to_owned())]
    pub storage_class: String,
    /// Artifact written by backup and read by restore.
    #[ortho_config(default = "./resources.yaml".to_owned())]
    pub artifact_path: String,
    /// File system used when provisioning restored persistent volumes.
    #[ortho_config(default = "ext4".to_owned())]
    pub fs_type: String,
    /// Seconds between snapshot readiness checks.
    #[ortho_config(default = 1)]
    pub snapshot_poll_interval_secs: u64,
    /// Seconds between backup completion checks.
    #[ortho_config(default = 5)]
    pub backup_poll_interval_secs: u64,
    /// Seconds between volume health checks during restore.
    #[ortho_config(default = 1)]
    pub volume_poll_interval_secs: u64,
    /// Upper bound, in seconds, on any single wait.
    #[ortho_config(default = 1800)]
    pub wait_timeout_secs: u64,
    /// Per-request HTTP timeout in seconds.
    #[ortho_config(default = 30)]
    pub http_timeout_secs: u64,
}

/// Polling cadence for each wait the workflows perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicies {
    /// Wait for a snapshot object to appear.
    pub snapshot: PollPolicy,
    /// Wait for a backup to reach `Completed`.
    pub backup: PollPolicy,
    /// Wait for a restored volume to become healthy.
    pub volume: PollPolicy,
}

impl Default for PollPolicies {
    fn default() -> Self {
        let timeout = Duration::from_secs(1800);
        Self {
            snapshot: PollPolicy::new(Duration::from_secs(1), timeout),
            backup: PollPolicy::new(Duration::from_secs(5), timeout),
            volume: PollPolicy::new(Duration::from_secs(1), timeout),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    flag: Option<&'static str>,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            flag: None,
        }
    }

    const fn with_flag(mut self, flag: &'static str) -> Self {
        self.flag = Some(flag);
        self
    }

    fn guidance(&self) -> String {
        let sources = format!(
            "set {} or add {} to {CONFIG_FILE_NAME}",
            self.env_var, self.toml_key
        );
        match self.flag {
            Some(flag) => format!("pass {flag}, {sources}"),
            None => sources,
        }
    }
}

impl BackupRestoreConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("longhorn-br")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the configured Longhorn API endpoint, if any.
    #[must_use]
    pub fn api_endpoint(&self) -> Option<&str> {
        self.api_endpoint.as_deref()
    }

    /// Returns the kubeconfig path.
    #[must_use]
    pub fn kubeconfig_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.kubeconfig)
    }

    /// Returns the artifact path.
    #[must_use]
    pub fn artifact_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.artifact_path)
    }

    /// Returns the per-request HTTP timeout.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Derives the polling cadence for each wait.
    #[must_use]
    pub const fn poll_policies(&self) -> PollPolicies {
        let timeout = Duration::from_secs(self.wait_timeout_secs);
        PollPolicies {
            snapshot: PollPolicy::new(Duration::from_secs(self.snapshot_poll_interval_secs), timeout),
            backup: PollPolicy::new(Duration::from_secs(self.backup_poll_interval_secs), timeout),
            volume: PollPolicy::new(Duration::from_secs(self.volume_poll_interval_secs), timeout),
        }
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide values via CLI flags, environment variables, or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidValue`] when an interval or timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            self.api_endpoint().unwrap_or_default(),
            &FieldMetadata::new(
                "Longhorn API endpoint",
                "LONGHORN_BR_API_ENDPOINT",
                "api_endpoint",
            )
            .with_flag("--api-endpoint"),
        )?;
        Self::require_field(
            &self.kubeconfig,
            &FieldMetadata::new("kubeconfig path", "LONGHORN_BR_KUBECONFIG", "kubeconfig")
                .with_flag("--kubeconfig"),
        )?;
        Self::require_field(
            &self.namespace,
            &FieldMetadata::new("Longhorn namespace", "LONGHORN_BR_NAMESPACE", "namespace"),
        )?;
        Self::require_field(
            &self.storage_class,
            &FieldMetadata::new(
                "claim storage class",
                "LONGHORN_BR_STORAGE_CLASS",
                "storage_class",
            ),
        )?;
        Self::require_field(
            &self.artifact_path,
            &FieldMetadata::new("artifact path", "LONGHORN_BR_ARTIFACT_PATH", "artifact_path")
                .with_flag("--artifact"),
        )?;
        Self::require_field(
            &self.fs_type,
            &FieldMetadata::new("file system type", "LONGHORN_BR_FS_TYPE", "fs_type"),
        )?;

        let durations = [
            (
                self.snapshot_poll_interval_secs,
                FieldMetadata::new(
                    "snapshot poll interval",
                    "LONGHORN_BR_SNAPSHOT_POLL_INTERVAL_SECS",
                    "snapshot_poll_interval_secs",
                ),
            ),
            (
                self.backup_poll_interval_secs,
                FieldMetadata::new(
                    "backup poll interval",
                    "LONGHORN_BR_BACKUP_POLL_INTERVAL_SECS",
                    "backup_poll_interval_secs",
                ),
            ),
            (
                self.volume_poll_interval_secs,
                FieldMetadata::new(
                    "volume poll interval",
                    "LONGHORN_BR_VOLUME_POLL_INTERVAL_SECS",
                    "volume_poll_interval_secs",
                ),
            ),
            (
                self.wait_timeout_secs,
                FieldMetadata::new(
                    "wait timeout",
                    "LONGHORN_BR_WAIT_TIMEOUT_SECS",
                    "wait_timeout_secs",
                ),
            ),
            (
                self.http_timeout_secs,
                FieldMetadata::new(
                    "HTTP timeout",
                    "LONGHORN_BR_HTTP_TIMEOUT_SECS",
                    "http_timeout_secs",
                ),
            ),
        ];
        for (value, metadata) in &durations {
            Self::require_positive(*value, metadata)?;
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration field holds an unusable value.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
