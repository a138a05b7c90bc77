// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::hostname::get_hostname;
use crate::loki::{RetryStrategy, LOKI_PORT, PUSH_PATH};
use crate::source::UNIFI_COLLECTIONS;

const DEFAULT_DATABASE: &str = "unifi";
const DEFAULT_POSITION_FILE: &str = "resume_token.bin";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_BATCH_MAX_SIZE: usize = 100;
const DEFAULT_BATCH_LINGER_MS: u64 = 1_000;
const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 30_000;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the shipper, read from the environment.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// MongoDB connection string
    pub mongodb_conn_str: String,
    pub mongodb_database: String,
    /// Collections whose inserts are forwarded
    pub collections: Vec<String>,
    /// Full Loki push URL
    pub loki_url: String,
    pub loki_tenant_id: Option<String>,
    pub loki_username: Option<String>,
    pub loki_password: Option<String>,
    /// Value of the `host` label
    pub host: String,
    /// Where the resume position is persisted
    pub position_path: PathBuf,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Per-request timeout for pushes
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub batch_max_size: usize,
    /// Longest time a partial batch waits for more events
    pub batch_linger: Duration,
    /// How long the pipeline waits idle before saving the source's own position
    pub checkpoint_interval: Duration,
    pub flatten_payload: bool,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            mongodb_conn_str: String::new(),
            mongodb_database: DEFAULT_DATABASE.to_string(),
            collections: UNIFI_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            loki_url: String::new(),
            loki_tenant_id: None,
            loki_username: None,
            loki_password: None,
            host: "unknown".to_string(),
            position_path: PathBuf::from(DEFAULT_POSITION_FILE),
            log_level: "info".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_strategy: RetryStrategy::ExponentialBackoff {
                attempts: DEFAULT_MAX_ATTEMPTS,
                base_ms: DEFAULT_BACKOFF_BASE_MS,
                max_ms: DEFAULT_BACKOFF_MAX_MS,
            },
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_linger: Duration::from_millis(DEFAULT_BATCH_LINGER_MS),
            checkpoint_interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MS),
            flatten_payload: true,
            https_proxy: None,
        }
    }
}

impl ShipperConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|val| !val.trim().is_empty());
        let number = |key: &str, default: u64| {
            non_empty(key)
                .and_then(|val| val.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let mongodb_conn_str = non_empty("MONGODB_CONN_STR")
            .ok_or_else(|| ConfigError::Missing("MONGODB_CONN_STR".to_string()))?;
        let loki_url = match (non_empty("LOKI_URL"), non_empty("LOKI_HOST")) {
            (Some(url), _) => url,
            (None, Some(host)) => format!("http://{host}:{LOKI_PORT}{PUSH_PATH}"),
            (None, None) => {
                return Err(ConfigError::Missing("LOKI_URL or LOKI_HOST".to_string()));
            }
        };
        let host = non_empty("LOG_HOST").unwrap_or_else(get_hostname);
        let log_level = lookup("LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|| "info".to_string());
        let flatten_payload = lookup("FLATTEN_PAYLOAD")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);

        let config = Self {
            mongodb_conn_str,
            mongodb_database: non_empty("MONGODB_DATABASE")
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            loki_url,
            loki_tenant_id: non_empty("LOKI_TENANT_ID"),
            loki_username: non_empty("LOKI_USERNAME"),
            loki_password: lookup("LOKI_PASSWORD"),
            host,
            position_path: non_empty("RESUME_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_POSITION_FILE)),
            log_level,
            timeout: Duration::from_secs(number("LOKI_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)),
            retry_strategy: RetryStrategy::ExponentialBackoff {
                attempts: number("LOKI_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                base_ms: number("LOKI_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
                max_ms: number("LOKI_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            },
            batch_max_size: number("BATCH_MAX_SIZE", DEFAULT_BATCH_MAX_SIZE as u64) as usize,
            batch_linger: Duration::from_millis(number("BATCH_LINGER_MS", DEFAULT_BATCH_LINGER_MS)),
            checkpoint_interval: Duration::from_millis(number(
                "CHECKPOINT_INTERVAL_MS",
                DEFAULT_CHECKPOINT_INTERVAL_MS,
            )),
            flatten_payload,
            https_proxy: non_empty("HTTPS_PROXY"),
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mongodb_conn_str.trim().is_empty() {
            return Err(ConfigError::Missing("MONGODB_CONN_STR".to_string()));
        }

        if !(self.loki_url.starts_with("http://") || self.loki_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "Loki URL '{}' must start with http:// or https://",
                self.loki_url
            )));
        }

        if self.collections.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one collection must be monitored".to_string(),
            ));
        }

        if self.batch_max_size == 0 {
            return Err(ConfigError::Invalid(
                "BATCH_MAX_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "CHECKPOINT_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "LOKI_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}
