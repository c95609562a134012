//! Unit tests for engine configuration validation.

use rstest::{fixture, rstest};
use volume_provider::{ConfigError, EngineConfig, PollBudget};

#[fixture]
fn valid_config() -> EngineConfig {
    EngineConfig::standard()
}

#[rstest]
fn standard_configuration_validates(valid_config: EngineConfig) {
    assert_eq!(valid_config.validate(), Ok(()));
}

/// Each required value names both its environment variable and its TOML key
/// when missing.
#[rstest]
#[case::poll_attempts(
    |cfg: &mut EngineConfig| cfg.poll_attempts = 0,
    "VOLUME_PROVIDER_POLL_ATTEMPTS",
    "poll_attempts"
)]
#[case::backoff(
    |cfg: &mut EngineConfig| cfg.poll_backoff_factor = 0,
    "VOLUME_PROVIDER_POLL_BACKOFF_FACTOR",
    "poll_backoff_factor"
)]
#[case::device_wait(
    |cfg: &mut EngineConfig| cfg.device_wait_seconds = 0,
    "VOLUME_PROVIDER_DEVICE_WAIT_SECONDS",
    "device_wait_seconds"
)]
#[case::filesystem(
    |cfg: &mut EngineConfig| cfg.filesystem.clear(),
    "VOLUME_PROVIDER_FILESYSTEM",
    "filesystem"
)]
#[case::data_directory(
    |cfg: &mut EngineConfig| cfg.data_directory = String::from("  "),
    "VOLUME_PROVIDER_DATA_DIRECTORY",
    "data_directory"
)]
#[case::credentials(
    |cfg: &mut EngineConfig| cfg.credentials_path.clear(),
    "VOLUME_PROVIDER_CREDENTIALS_PATH",
    "credentials_path"
)]
#[case::store(
    |cfg: &mut EngineConfig| cfg.store_path.clear(),
    "VOLUME_PROVIDER_STORE_PATH",
    "store_path"
)]
fn missing_values_produce_actionable_errors(
    mut valid_config: EngineConfig,
    #[case] mutate: fn(&mut EngineConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    mutate(&mut valid_config);
    let error = valid_config.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(
        message.contains(env_var),
        "error should mention {env_var}: {message}"
    );
    assert!(
        message.contains("volume-provider.toml"),
        "error should mention the config file: {message}"
    );
    assert!(
        message.contains(toml_key),
        "error should mention {toml_key}: {message}"
    );
}

#[rstest]
fn relative_data_directory_is_invalid(mut valid_config: EngineConfig) {
    valid_config.data_directory = String::from("data");
    assert!(matches!(
        valid_config.validate(),
        Err(ConfigError::Invalid(ref message)) if message.contains("absolute")
    ));
}

#[rstest]
#[case("team.internal/api", false)]
#[case("ftp://team.internal", false)]
#[case("https://team.internal/api", true)]
#[case("  ", true)]
fn team_api_url_must_be_http(
    mut valid_config: EngineConfig,
    #[case] url: &str,
    #[case] accepted: bool,
) {
    valid_config.team_api_url = Some(url.to_owned());
    let result = valid_config.validate();
    assert_eq!(result.is_ok(), accepted, "{url}: {result:?}");
    if !accepted {
        assert!(matches!(
            result,
            Err(ConfigError::Invalid(ref message)) if message.contains("team_api_url")
        ));
    }
}

#[rstest]
fn poll_budget_follows_the_configuration(mut valid_config: EngineConfig) {
    valid_config.poll_attempts = 7;
    valid_config.poll_interval_ms = 250;
    let budget = PollBudget::from_config(&valid_config);
    assert_eq!(budget.attempts, 7);
    assert_eq!(budget.delay_after(3), std::time::Duration::from_millis(250));
}
