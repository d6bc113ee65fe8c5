// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured log records and their validation.
//!
//! Clients send [`LogRecordInput`], a loosely typed shape where every field is
//! optional. Conversion into [`LogRecord`] is where per-item validation happens;
//! a record that fails is reported back to the caller and never reaches a buffer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ValidationError;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Warning,
    Error,
    Fatal,
    Critical,
}

impl Level {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "FATAL" => Ok(Self::Fatal),
            "CRITICAL" => Ok(Self::Critical),
            _ => Err(ValidationError::UnknownLevel(s.to_string())),
        }
    }
}

/// A validated, immutable log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl LogRecord {
    #[must_use]
    pub fn new(service: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.into(),
            level,
            message: message.into(),
            metadata: None,
        }
    }
}

/// Wire shape of a log record before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecordInput {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl TryFrom<LogRecordInput> for LogRecord {
    type Error = ValidationError;

    fn try_from(input: LogRecordInput) -> Result<Self, Self::Error> {
        let service = input
            .service
            .ok_or(ValidationError::MissingField("service"))?;
        if service.trim().is_empty() {
            return Err(ValidationError::BlankField("service"));
        }

        let message = input
            .message
            .ok_or(ValidationError::MissingField("message"))?;

        let timestamp = match input.timestamp {
            None => Utc::now(),
            Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| ValidationError::InvalidTimestamp(raw))?,
        };

        let level = match input.level {
            None => Level::Info,
            Some(raw) => raw.parse()?,
        };

        let metadata = match input.metadata {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => return Err(ValidationError::InvalidMetadata),
        };

        Ok(Self {
            timestamp,
            service,
            level,
            message,
            metadata,
        })
    }
}
