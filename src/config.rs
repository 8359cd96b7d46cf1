//! Configuration management for review-gate.
//!
//! Configuration can be set via environment variables:
//! - `REVIEW_GATE_DATA_DIR` - Optional. Database and flag directory. Defaults to `./.review-gate`.
//! - `REVIEW_GATE_STORE` - Optional. `sqlite` or `memory`. Defaults to `sqlite`.
//! - `REVIEW_GATE_QUIET_PERIOD_MS` - Optional. Settle debounce window. Defaults to `5000`.
//! - `REVIEW_GATE_STALE_AFTER_SECS` - Optional. Flag expiry. Defaults to `600`.
//! - `REVIEW_GATE_REVIEW_TIMEOUT_SECS` - Optional. Reviewer ceiling. Defaults to `300`.
//! - `REVIEW_GATE_REVIEWER_CMD` - Optional. Shell command producing verdicts.
//!   Without it every holistic review escalates to `needs_human_review`.
//! - `REVIEW_GATE_STANDARDS_DIR` - Optional. Directory of `*.md`/`*.txt` standards.
//! - `REVIEW_GATE_REVIEW_PATTERN` - Optional. Regex naming review tasks.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3080`.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::interceptor::DEFAULT_REVIEW_PATTERN;
use crate::store::StoreType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Holds `review_gate.db` and `flags/`
    pub data_dir: PathBuf,

    pub store_type: StoreType,

    /// Debounce window before a burst is reviewed
    pub quiet_period: Duration,

    /// Flags older than this never block
    pub stale_after: Duration,

    /// Ceiling on one reviewer call
    pub review_timeout: Duration,

    pub reviewer_command: Option<String>,

    pub standards_dir: Option<PathBuf>,

    /// Regex naming review tasks
    pub review_pattern: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,
}

fn parse_env<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable numbers or an
    /// invalid review pattern.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("REVIEW_GATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".review-gate"));

        let store_type = std::env::var("REVIEW_GATE_STORE")
            .map(|s| StoreType::from_str(&s))
            .unwrap_or_default();

        let quiet_period_ms: u64 = parse_env("REVIEW_GATE_QUIET_PERIOD_MS", "5000")?;
        let stale_after_secs: u64 = parse_env("REVIEW_GATE_STALE_AFTER_SECS", "600")?;
        let review_timeout_secs: u64 = parse_env("REVIEW_GATE_REVIEW_TIMEOUT_SECS", "300")?;

        let pattern = non_empty_env("REVIEW_GATE_REVIEW_PATTERN")
            .unwrap_or_else(|| DEFAULT_REVIEW_PATTERN.to_string());
        Self::compile_pattern(&pattern)?;
        let review_pattern = pattern;

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("PORT", "3080")?;

        Ok(Self {
            data_dir,
            store_type,
            quiet_period: Duration::from_millis(quiet_period_ms),
            stale_after: Duration::from_secs(stale_after_secs),
            review_timeout: Duration::from_secs(review_timeout_secs),
            reviewer_command: non_empty_env("REVIEW_GATE_REVIEWER_CMD"),
            standards_dir: non_empty_env("REVIEW_GATE_STANDARDS_DIR").map(PathBuf::from),
            review_pattern,
            host,
            port,
        })
    }

    /// Create a config rooted at `data_dir` with default values (useful for testing).
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            store_type: StoreType::Sqlite,
            quiet_period: Duration::from_secs(5),
            stale_after: Duration::from_secs(600),
            review_timeout: Duration::from_secs(300),
            reviewer_command: None,
            standards_dir: None,
            review_pattern: DEFAULT_REVIEW_PATTERN.to_string(),
            host: "127.0.0.1".to_string(),
            port: 3080,
        }
    }

    /// Compile a review naming pattern.
    pub fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
        Regex::new(pattern).map_err(|e| {
            ConfigError::InvalidValue("REVIEW_GATE_REVIEW_PATTERN".to_string(), e.to_string())
        })
    }

    pub fn flags_dir(&self) -> PathBuf {
        self.data_dir.join("flags")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(crate::store::DB_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_data_dir_defaults() {
        let config = Config::for_data_dir("/tmp/rg");
        assert_eq!(config.flags_dir(), PathBuf::from("/tmp/rg/flags"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/rg/review_gate.db"));
        assert_eq!(config.quiet_period, Duration::from_secs(5));
        let pattern = Config::compile_pattern(&config.review_pattern).unwrap();
        assert!(pattern.is_match("[review] x"));
        assert!(Config::compile_pattern("[unclosed").is_err());
    }

    #[test]
    fn test_parse_env_reports_variable() {
        std::env::set_var("REVIEW_GATE_TEST_NUMBER", "soon");
        let err = parse_env::<u64>("REVIEW_GATE_TEST_NUMBER", "1").unwrap_err();
        assert!(err.to_string().contains("REVIEW_GATE_TEST_NUMBER"));
        std::env::remove_var("REVIEW_GATE_TEST_NUMBER");

        let value: u64 = parse_env("REVIEW_GATE_TEST_UNSET", "42").unwrap();
        assert_eq!(value, 42);
    }
}
