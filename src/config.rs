//! Engine configuration loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default mount point used by generated mount scripts.
pub const DEFAULT_DATA_DIRECTORY: &str = "/data";

/// Polling, script and storage settings shared by every backend.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VOLUME_PROVIDER",
    discovery(
        app_name = "volume-provider",
        env_var = "VOLUME_PROVIDER_CONFIG_PATH",
        config_file_name = "volume-provider.toml",
        dotfile_name = ".volume-provider.toml",
        project_file_name = "volume-provider.toml"
    )
)]
pub struct EngineConfig {
    /// Number of status checks before a wait gives up.
    #[ortho_config(default = 60)]
    pub poll_attempts: u32,
    /// Delay between checks in milliseconds.
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Multiplier applied to the delay after each check; `1` disables
    /// backoff.
    #[ortho_config(default = 1)]
    pub poll_backoff_factor: u32,
    /// Ceiling for a single backoff delay in milliseconds.
    #[ortho_config(default = 30000)]
    pub poll_max_interval_ms: u64,
    /// Seconds a mount script waits for the device node to appear.
    #[ortho_config(default = 60)]
    pub device_wait_seconds: u32,
    /// Filesystem created on blank block devices.
    #[ortho_config(default = "ext4".to_owned())]
    pub filesystem: String,
    /// Default mount point on the database host.
    #[ortho_config(default = DEFAULT_DATA_DIRECTORY.to_owned())]
    pub data_directory: String,
    /// JSON document holding backend credentials.
    #[ortho_config(default = "credentials.json".to_owned())]
    pub credentials_path: String,
    /// JSON document used as the volume and snapshot store by the CLI.
    #[ortho_config(default = "volumes.json".to_owned())]
    pub store_path: String,
    /// Base URL of the team API. Snapshots of databases with a known team
    /// carry its billing tags when set.
    pub team_api_url: Option<String>,
    /// Label marking snapshots as database backups, as `KEY` or
    /// `KEY=VALUE`. A bare key gets the value `true`.
    pub backup_tag: Option<String>,
}

impl EngineConfig {
    /// Configuration with every field at its documented default.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            poll_attempts: 60,
            poll_interval_ms: 1000,
            poll_backoff_factor: 1,
            poll_max_interval_ms: 30_000,
            device_wait_seconds: 60,
            filesystem: String::from("ext4"),
            data_directory: DEFAULT_DATA_DIRECTORY.to_owned(),
            credentials_path: String::from("credentials.json"),
            store_path: String::from("volumes.json"),
            team_api_url: None,
            backup_tag: None,
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to volume-provider.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl EngineConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.missing());
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
        Self::load_from_iter([std::ffi::OsString::from("volume-provider")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and the TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// or zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_positive(
            u64::from(self.poll_attempts),
            &FieldMetadata::new(
                "poll attempt budget",
                "VOLUME_PROVIDER_POLL_ATTEMPTS",
                "poll_attempts",
            ),
        )?;
        Self::require_positive(
            u64::from(self.poll_backoff_factor),
            &FieldMetadata::new(
                "poll backoff factor",
                "VOLUME_PROVIDER_POLL_BACKOFF_FACTOR",
                "poll_backoff_factor",
            ),
        )?;
        Self::require_positive(
            u64::from(self.device_wait_seconds),
            &FieldMetadata::new(
                "device wait timeout",
                "VOLUME_PROVIDER_DEVICE_WAIT_SECONDS",
                "device_wait_seconds",
            ),
        )?;
        Self::require_field(
            &self.filesystem,
            &FieldMetadata::new("filesystem type", "VOLUME_PROVIDER_FILESYSTEM", "filesystem"),
        )?;
        Self::require_field(
            &self.data_directory,
            &FieldMetadata::new(
                "data directory",
                "VOLUME_PROVIDER_DATA_DIRECTORY",
                "data_directory",
            ),
        )?;
        if !self.data_directory.trim().starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "data_directory must be absolute, got '{}'",
                self.data_directory
            )));
        }
        Self::require_field(
            &self.credentials_path,
            &FieldMetadata::new(
                "credentials file",
                "VOLUME_PROVIDER_CREDENTIALS_PATH",
                "credentials_path",
            ),
        )?;
        Self::require_field(
            &self.store_path,
            &FieldMetadata::new("store file", "VOLUME_PROVIDER_STORE_PATH", "store_path"),
        )?;
        let team_api_url = self.team_api_url.as_deref().map_or("", str::trim);
        if !team_api_url.is_empty()
            && !team_api_url.starts_with("http://")
            && !team_api_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "team_api_url must be an http(s) URL, got '{team_api_url}'"
            )));
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
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<ConfigError> for crate::error::LifecycleError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
