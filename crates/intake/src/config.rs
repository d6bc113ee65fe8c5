// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferConfig;
use crate::constants::{
    DEFAULT_API_KEY_HEADER, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_BACKOFF_MS, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_FLUSH_RETRIES, DEFAULT_MAX_FAILED_ITEMS, DEFAULT_RATE_LIMIT_BURST,
    DEFAULT_RATE_LIMIT_PER_SECOND, DEFAULT_SESSION_COOKIE,
};
use crate::credentials::{CredentialStrategy, CredentialValidator, KeyAuthority};
use crate::errors::IngestError;
use crate::limiter::AdmissionLimiter;
use crate::sink::RetryStrategy;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the intake pipeline
#[derive(Clone)]
pub struct IntakeConfig {
    /// Items per batch before a size-triggered flush
    pub batch_size: usize,
    /// Interval of the background flush timer
    pub flush_interval: Duration,
    /// Sink attempts per flush, including the first
    pub flush_retries: u64,
    /// Linear backoff step between sink attempts
    pub flush_backoff: Duration,
    /// Capacity of each buffer's failed-items list
    pub max_failed_items: usize,
    /// Whether admission control is applied
    pub rate_limit_enabled: bool,
    /// Tokens refilled per identity per second
    pub rate_limit_per_second: u32,
    /// Bucket capacity per identity
    pub rate_limit_burst: u32,
    /// Header carrying the API key
    pub api_key_header: String,
    /// HMAC secret for session tokens; the token strategy is off when unset
    pub token_secret: Option<String>,
    /// Cookie carrying the session token
    pub session_cookie: String,
    /// Allowed clock skew when checking token expiry
    pub token_leeway_secs: u64,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            flush_backoff: Duration::from_millis(DEFAULT_FLUSH_BACKOFF_MS),
            max_failed_items: DEFAULT_MAX_FAILED_ITEMS,
            rate_limit_enabled: true,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            token_secret: None,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            token_leeway_secs: 0,
            log_level: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for IntakeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntakeConfig")
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("flush_retries", &self.flush_retries)
            .field("flush_backoff", &self.flush_backoff)
            .field("max_failed_items", &self.max_failed_items)
            .field("rate_limit_enabled", &self.rate_limit_enabled)
            .field("rate_limit_per_second", &self.rate_limit_per_second)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("api_key_header", &self.api_key_header)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<redacted>"))
            .field("session_cookie", &self.session_cookie)
            .field("token_leeway_secs", &self.token_leeway_secs)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl IntakeConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, IngestError> {
        let defaults = Self::default();

        let batch_size = parse_var("INTAKE_BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        let flush_interval = parse_var("INTAKE_FLUSH_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_interval);
        let flush_retries = parse_var("INTAKE_FLUSH_RETRIES")?.unwrap_or(defaults.flush_retries);
        let flush_backoff = parse_var("INTAKE_FLUSH_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_backoff);
        let max_failed_items =
            parse_var("INTAKE_MAX_FAILED_ITEMS")?.unwrap_or(defaults.max_failed_items);
        let rate_limit_enabled = env::var("INTAKE_RATE_LIMIT_ENABLED")
            .map(|val| val.trim().to_lowercase() != "false")
            .unwrap_or(defaults.rate_limit_enabled);
        let rate_limit_per_second =
            parse_var("INTAKE_RATE_LIMIT_PER_SECOND")?.unwrap_or(defaults.rate_limit_per_second);
        let rate_limit_burst =
            parse_var("INTAKE_RATE_LIMIT_BURST")?.unwrap_or(defaults.rate_limit_burst);
        let api_key_header = env::var("INTAKE_API_KEY_HEADER")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or(defaults.api_key_header);
        let token_secret = env::var("INTAKE_TOKEN_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty());
        let session_cookie = env::var("INTAKE_SESSION_COOKIE")
            .map(|val| val.trim().to_string())
            .unwrap_or(defaults.session_cookie);
        let token_leeway_secs =
            parse_var("INTAKE_TOKEN_LEEWAY_SECS")?.unwrap_or(defaults.token_leeway_secs);
        let log_level = env::var("INTAKE_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            batch_size,
            flush_interval,
            flush_retries,
            flush_backoff,
            max_failed_items,
            rate_limit_enabled,
            rate_limit_per_second,
            rate_limit_burst,
            api_key_header,
            token_secret,
            session_cookie,
            token_leeway_secs,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::Configuration(
                "INTAKE_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(IngestError::Configuration(
                "INTAKE_FLUSH_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        if self.flush_retries == 0 {
            return Err(IngestError::Configuration(
                "INTAKE_FLUSH_RETRIES must be at least 1".to_string(),
            ));
        }

        let empty_bucket = self.rate_limit_per_second == 0 || self.rate_limit_burst == 0;
        if self.rate_limit_enabled && empty_bucket {
            return Err(IngestError::Configuration(
                "INTAKE_RATE_LIMIT_PER_SECOND and INTAKE_RATE_LIMIT_BURST must be greater than 0"
                    .to_string(),
            ));
        }

        if self.api_key_header.trim().is_empty() {
            return Err(IngestError::Configuration(
                "INTAKE_API_KEY_HEADER cannot be empty".to_string(),
            ));
        }

        if self.token_secret.is_some() && self.session_cookie.is_empty() {
            return Err(IngestError::Configuration(
                "INTAKE_SESSION_COOKIE cannot be empty when a token secret is set".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(IngestError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Buffer settings derived from this configuration.
    #[must_use]
    pub fn buffer_config(&self, name: &str) -> BufferConfig {
        BufferConfig {
            name: name.to_string(),
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            retry_strategy: RetryStrategy::LinearBackoff(
                self.flush_retries,
                self.flush_backoff.as_millis() as u64,
            ),
            max_failed_items: self.max_failed_items,
        }
    }

    /// The API key strategy, followed by the token strategy when a secret is set.
    pub fn credential_validator(
        &self,
        authority: Arc<dyn KeyAuthority>,
    ) -> Result<CredentialValidator, IngestError> {
        let mut strategies = vec![CredentialStrategy::api_key(&self.api_key_header, authority)?];
        if let Some(secret) = &self.token_secret {
            strategies.push(CredentialStrategy::signed_token(
                secret.as_bytes(),
                &self.session_cookie,
                self.token_leeway_secs,
            )?);
        }
        CredentialValidator::new(strategies)
    }

    pub fn admission_limiter(&self) -> Result<AdmissionLimiter, IngestError> {
        if self.rate_limit_enabled {
            AdmissionLimiter::new(self.rate_limit_per_second, self.rate_limit_burst)
        } else {
            Ok(AdmissionLimiter::disabled())
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, IngestError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| IngestError::Configuration(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}
