//! Configuration for the task broker.
//!
//! Everything is read from environment variables, with a `.env` file in the
//! working directory loaded first when present.

use std::time::Duration;

use crate::artifacts::TransferOptions;
use crate::broker::RetryConfig;
use crate::error::ConfigError;
use crate::observability::ObservabilityConfig;

/// Main configuration for the broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub orchestrator: OrchestratorConfig,
    pub artifacts: ArtifactConfig,
    pub observability: ObservabilityConfig,
}

impl BrokerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            orchestrator: OrchestratorConfig::resolve()?,
            artifacts: ArtifactConfig::resolve()?,
            observability: ObservabilityConfig::resolve()?,
        })
    }
}

/// How the broker talks to the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Suppress every mutating plan call (dry-run / replay mode).
    pub skip_raise_plan_events: bool,
    /// Per-request timeout for orchestrator HTTP calls.
    pub request_timeout: Duration,
    /// Upper bound for the terminal status report sent after a job was
    /// cancelled, when the job's own token can no longer be used.
    pub report_timeout: Duration,
    pub report_retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            skip_raise_plan_events: false,
            request_timeout: Duration::from_secs(30),
            report_timeout: Duration::from_secs(60),
            report_retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_retries =
            parse_optional_env("BROKER_REPORT_MAX_RETRIES", defaults.report_retry.max_retries)?;
        let base_ms: u64 = parse_optional_env(
            "BROKER_REPORT_RETRY_BASE_MS",
            defaults.report_retry.base_delay.as_millis() as u64,
        )?;

        Ok(Self {
            skip_raise_plan_events: parse_bool_env("BROKER_SKIP_PLAN_EVENTS", false)?,
            request_timeout: Duration::from_secs(parse_optional_env(
                "BROKER_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            report_timeout: Duration::from_secs(parse_optional_env(
                "BROKER_REPORT_TIMEOUT_SECS",
                defaults.report_timeout.as_secs(),
            )?),
            report_retry: RetryConfig {
                max_retries,
                base_delay: Duration::from_millis(base_ms),
                ..defaults.report_retry
            },
        })
    }
}

/// Artifact transfer settings.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub transfer: TransferOptions,
    /// Keep a per-provider memo of directories already ensured.
    pub directory_cache: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            transfer: TransferOptions::default(),
            directory_cache: true,
        }
    }
}

impl ArtifactConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = TransferOptions::default();

        let parallel_limit: usize =
            parse_optional_env("ARTIFACT_PARALLEL_LIMIT", defaults.parallel_limit)?;
        if parallel_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ARTIFACT_PARALLEL_LIMIT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let item_pattern =
            optional_env("ARTIFACT_ITEM_PATTERN")?.unwrap_or(defaults.item_pattern.clone());
        if let Err(e) = glob::Pattern::new(&item_pattern) {
            return Err(ConfigError::InvalidValue {
                key: "ARTIFACT_ITEM_PATTERN".to_string(),
                message: e.to_string(),
            });
        }

        Ok(Self {
            transfer: TransferOptions {
                parallel_limit,
                item_pattern,
                retry_limit: parse_optional_env("ARTIFACT_RETRY_LIMIT", defaults.retry_limit)?,
                retry_interval: Duration::from_millis(parse_optional_env(
                    "ARTIFACT_RETRY_INTERVAL_MS",
                    defaults.retry_interval.as_millis() as u64,
                )?),
            },
            directory_cache: parse_bool_env("ARTIFACT_DIRECTORY_CACHE", true)?,
        })
    }
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

/// Parse a boolean flag, accepting `true/false`, `1/0`, `yes/no` and `on/off`.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{s}'"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global, so serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn optional_env_returns_none_for_missing_var() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::remove_var("_TEST_BROKER_MISSING_42") };
        assert!(optional_env("_TEST_BROKER_MISSING_42").unwrap().is_none());
    }

    #[test]
    fn optional_env_returns_none_for_empty_string() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_BROKER_EMPTY_42", "") };
        assert!(optional_env("_TEST_BROKER_EMPTY_42").unwrap().is_none());
        unsafe { std::env::remove_var("_TEST_BROKER_EMPTY_42") };
    }

    #[test]
    fn parse_optional_env_returns_error_for_invalid_value() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("_TEST_BROKER_BAD_42", "lots") };
        let result: Result<usize, _> = parse_optional_env("_TEST_BROKER_BAD_42", 1);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("_TEST_BROKER_BAD_42") };
    }

    #[test]
    fn parse_bool_env_accepts_common_spellings() {
        let _lock = ENV_LOCK.lock();
        for (raw, expected) in [("TRUE", true), ("1", true), ("off", false), ("no", false)] {
            unsafe { std::env::set_var("_TEST_BROKER_BOOL_42", raw) };
            assert_eq!(parse_bool_env("_TEST_BROKER_BOOL_42", !expected).unwrap(), expected);
        }
        unsafe { std::env::set_var("_TEST_BROKER_BOOL_42", "maybe") };
        assert!(parse_bool_env("_TEST_BROKER_BOOL_42", false).is_err());
        unsafe { std::env::remove_var("_TEST_BROKER_BOOL_42") };
    }

    #[test]
    fn orchestrator_config_defaults() {
        let _lock = ENV_LOCK.lock();
        for key in [
            "BROKER_SKIP_PLAN_EVENTS",
            "BROKER_REQUEST_TIMEOUT_SECS",
            "BROKER_REPORT_TIMEOUT_SECS",
            "BROKER_REPORT_MAX_RETRIES",
            "BROKER_REPORT_RETRY_BASE_MS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
        let cfg = OrchestratorConfig::resolve().unwrap();
        assert!(!cfg.skip_raise_plan_events);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.report_retry.max_retries, RetryConfig::default().max_retries);
    }

    #[test]
    fn artifact_config_rejects_zero_parallel_limit() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("ARTIFACT_PARALLEL_LIMIT", "0") };
        let result = ArtifactConfig::resolve();
        unsafe { std::env::remove_var("ARTIFACT_PARALLEL_LIMIT") };
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key, .. }) if key == "ARTIFACT_PARALLEL_LIMIT"
        ));
    }

    #[test]
    fn artifact_config_rejects_bad_pattern() {
        let _lock = ENV_LOCK.lock();
        unsafe { std::env::set_var("ARTIFACT_ITEM_PATTERN", "[") };
        let result = ArtifactConfig::resolve();
        unsafe { std::env::remove_var("ARTIFACT_ITEM_PATTERN") };
        assert!(result.is_err());
    }

    #[test]
    fn artifact_config_reads_overrides() {
        let _lock = ENV_LOCK.lock();
        unsafe {
            std::env::set_var("ARTIFACT_PARALLEL_LIMIT", "2");
            std::env::set_var("ARTIFACT_DIRECTORY_CACHE", "false");
            std::env::set_var("ARTIFACT_ITEM_PATTERN", "**/*.log");
        }
        let cfg = ArtifactConfig::resolve().unwrap();
        unsafe {
            std::env::remove_var("ARTIFACT_PARALLEL_LIMIT");
            std::env::remove_var("ARTIFACT_DIRECTORY_CACHE");
            std::env::remove_var("ARTIFACT_ITEM_PATTERN");
        }
        assert_eq!(cfg.transfer.parallel_limit, 2);
        assert!(!cfg.directory_cache);
        assert_eq!(cfg.transfer.item_pattern, "**/*.log");
    }
}
