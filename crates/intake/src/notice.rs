// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error occurrences as reported by clients, and the notices persisted for them.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::DEFAULT_ENVIRONMENT;
use crate::errors::ValidationError;
use crate::fault::FaultId;

/// Globally unique, time-sortable notice identifier (UUIDv7).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NoticeId(Uuid);

impl NoticeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for NoticeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktraceFrame {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub method: Option<String>,
}

/// One error occurrence as reported by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub project_id: String,
    pub error_class: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub backtrace: Vec<BacktraceFrame>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session: Value,
    #[serde(default)]
    pub breadcrumbs: Value,
}

impl Occurrence {
    /// Checks required fields and fills in the default environment.
    pub fn normalize(mut self) -> Result<Self, ValidationError> {
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::BlankField("project_id"));
        }
        if self.error_class.trim().is_empty() {
            return Err(ValidationError::BlankField("error_class"));
        }
        if self.environment.trim().is_empty() {
            self.environment = DEFAULT_ENVIRONMENT.to_string();
        }
        Ok(self)
    }
}

/// A persisted occurrence, always linked to exactly one fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub id: NoticeId,
    pub fault_id: FaultId,
    pub message: String,
    pub backtrace: Vec<BacktraceFrame>,
    pub context: Value,
    pub params: Value,
    pub session: Value,
    pub breadcrumbs: Value,
    pub created_at: DateTime<Utc>,
}

impl Notice {
    #[must_use]
    pub fn from_occurrence(occurrence: Occurrence, fault_id: FaultId) -> Self {
        Self {
            id: NoticeId::new(),
            fault_id,
            message: occurrence.message,
            backtrace: occurrence.backtrace,
            context: occurrence.context,
            params: occurrence.params,
            session: occurrence.session,
            breadcrumbs: occurrence.breadcrumbs,
            created_at: Utc::now(),
        }
    }
}

/// What the caller gets back after reporting an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NoticeReceipt {
    pub id: NoticeId,
    pub fault_id: FaultId,
}
