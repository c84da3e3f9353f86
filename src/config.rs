use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::logstore::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Input
    pub input_path: PathBuf,

    // Worker Pool
    pub primary_workers: usize,
    pub fallback_workers: usize,
    pub queue_capacity: usize,
    pub dequeue_timeout: Duration,
    pub block_threshold: u32,
    pub success_reset_threshold: u32,
    /// Skip the operator gate when the block threshold is hit.
    pub unattended: bool,

    // External Tools
    pub yt_dlp_path: String,
    pub gallery_dl_path: String,
    pub rclone_path: String,

    // Remote Archive
    pub remote_base: String,

    // Run Policy
    pub skip_private: bool,
    pub skip_sync: bool,
    pub errors_only: bool,
    pub retry_errors: bool,

    // Log Store
    pub log_retry_attempts: u32,
    pub log_retry_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let primary_workers = parse_env_usize("PRIMARY_WORKERS", 5)?;

        Ok(Self {
            // Input
            input_path: PathBuf::from(required_env("INPUT_PATH")?),

            // Worker Pool
            primary_workers,
            fallback_workers: parse_env_usize("FALLBACK_WORKERS", primary_workers)?,
            queue_capacity: parse_env_usize("QUEUE_CAPACITY", 10_000)?,
            dequeue_timeout: Duration::from_millis(parse_env_u64("DEQUEUE_TIMEOUT_MS", 1000)?),
            block_threshold: parse_env_u32("BLOCK_THRESHOLD", 5)?,
            success_reset_threshold: parse_env_u32("SUCCESS_RESET_THRESHOLD", 10)?,
            unattended: parse_env_bool("UNATTENDED", false)?,

            // External Tools
            yt_dlp_path: env_or_default("YT_DLP_PATH", "yt-dlp"),
            gallery_dl_path: env_or_default("GALLERY_DL_PATH", "gallery-dl"),
            rclone_path: env_or_default("RCLONE_PATH", "rclone"),

            // Remote Archive
            remote_base: env_or_default("REMOTE_BASE", "gdrive:/TikTok Archives"),

            // Run Policy
            skip_private: parse_env_bool("SKIP_PRIVATE", false)?,
            skip_sync: parse_env_bool("SKIP_SYNC", false)?,
            errors_only: parse_env_bool("ERRORS_ONLY", false)?,
            retry_errors: parse_env_bool("RETRY_ERRORS", true)?,

            // Log Store
            log_retry_attempts: parse_env_u32("LOG_RETRY_ATTEMPTS", 3)?,
            log_retry_delay: Duration::from_millis(parse_env_u64("LOG_RETRY_DELAY_MS", 100)?),
        })
    }

    /// Defaults suitable for tests: small pool, short timeouts, no archival.
    #[must_use]
    pub fn for_testing(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            primary_workers: 2,
            fallback_workers: 2,
            queue_capacity: 100,
            dequeue_timeout: Duration::from_millis(20),
            block_threshold: 5,
            success_reset_threshold: 10,
            unattended: true,
            yt_dlp_path: "yt-dlp".to_string(),
            gallery_dl_path: "gallery-dl".to_string(),
            rclone_path: "rclone".to_string(),
            remote_base: "remote:/archive".to_string(),
            skip_private: false,
            skip_sync: true,
            errors_only: false,
            retry_errors: false,
            log_retry_attempts: 3,
            log_retry_delay: Duration::from_millis(1),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("PRIMARY_WORKERS", self.primary_workers),
            ("FALLBACK_WORKERS", self.fallback_workers),
            ("QUEUE_CAPACITY", self.queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.log_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                name: "LOG_RETRY_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.input_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "INPUT_PATH".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if !self.skip_sync && !self.remote_base.contains(':') {
            return Err(ConfigError::InvalidValue {
                name: "REMOTE_BASE".to_string(),
                message: format!("expected '<remote>:<path>', got '{}'", self.remote_base),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.log_retry_attempts,
            delay: self.log_retry_delay,
        }
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const VARS: &[&str] = &[
        "INPUT_PATH",
        "PRIMARY_WORKERS",
        "FALLBACK_WORKERS",
        "SKIP_PRIVATE",
        "REMOTE_BASE",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    #[serial]
    fn test_missing_input_path() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref name) if name == "INPUT_PATH"));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("INPUT_PATH", "/data/collections");
        std::env::set_var("PRIMARY_WORKERS", "8");

        let config = Config::from_env().unwrap();
        assert_eq!(config.input_path, PathBuf::from("/data/collections"));
        assert_eq!(config.primary_workers, 8);
        assert_eq!(config.fallback_workers, 8);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.remote_base, "gdrive:/TikTok Archives");
        assert!(config.retry_errors);
        assert!(!config.skip_private);
        assert_eq!(config.retry_policy().attempts, 3);
        config.validate().unwrap();
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values() {
        clear_env();
        std::env::set_var("INPUT_PATH", "/data");
        std::env::set_var("SKIP_PRIVATE", "maybe");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::ParseBool { .. }
        ));

        std::env::set_var("SKIP_PRIVATE", "yes");
        std::env::set_var("FALLBACK_WORKERS", "0");
        let config = Config::from_env().unwrap();
        assert!(config.skip_private);
        assert!(config.validate().is_err());
        clear_env();
    }

    #[test]
    fn test_for_testing_is_valid() {
        Config::for_testing("/tmp/x").validate().unwrap();
    }
}
