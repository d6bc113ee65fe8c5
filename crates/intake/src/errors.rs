// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the intake pipeline.

use std::fmt;

/// Why a credential was rejected.
///
/// Ordered from least to most specific so that, when several strategies fail,
/// the most informative reason is the one recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RejectionReason {
    /// No credential was supplied for any configured strategy.
    Missing,
    /// A credential was supplied but could not be parsed.
    Malformed,
    /// The credential was parsed but is not valid (unknown key, bad signature,
    /// wrong algorithm, authority unreachable).
    Invalid,
    /// The credential was valid but has expired.
    Expired,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
        };
        f.write_str(reason)
    }
}

/// A single record failed validation. Reported per item, never fatal to a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("field '{0}' is required")]
    MissingField(&'static str),
    #[error("field '{0}' must not be blank")]
    BlankField(&'static str),
    #[error("invalid timestamp '{0}': expected RFC 3339")]
    InvalidTimestamp(String),
    #[error("unknown level '{0}'")]
    UnknownLevel(String),
    #[error("metadata must be a JSON object")]
    InvalidMetadata,
}

/// Failure reported by a durable sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Transient failure; the write may be retried.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// Permanent failure; retrying the same batch will not help.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

impl SinkError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Failure of the key authority lookup. Always treated as an invalid key.
#[derive(Debug, Clone, thiserror::Error)]
#[error("key authority lookup failed: {0}")]
pub struct AuthorityError(pub String);

/// Failure of the fault store.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fault store error: {0}")]
pub struct StoreError(pub String);

/// Top-level error returned by the intake pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    /// Every rejection reason renders the same message to callers.
    #[error("authentication required")]
    AuthRejected(RejectionReason),

    #[error("rate limit exceeded, retry later")]
    AdmissionRejected,

    #[error("validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    #[error("sink unavailable after retries, {items} items moved to the failed list: {reason}")]
    SinkUnavailable { items: usize, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("buffer is shut down")]
    BufferClosed,

    #[error(transparent)]
    FaultStore(#[from] StoreError),
}

impl IngestError {
    /// The internal rejection reason, when this is an authentication failure.
    #[must_use]
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            Self::AuthRejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejections_render_identically() {
        let missing = IngestError::AuthRejected(RejectionReason::Missing).to_string();
        let expired = IngestError::AuthRejected(RejectionReason::Expired).to_string();
        let invalid = IngestError::AuthRejected(RejectionReason::Invalid).to_string();
        assert_eq!(missing, "authentication required");
        assert_eq!(missing, expired);
        assert_eq!(missing, invalid);
    }

    #[test]
    fn test_rejection_reason_accessor() {
        let error = IngestError::AuthRejected(RejectionReason::Malformed);
        assert_eq!(error.rejection_reason(), Some(RejectionReason::Malformed));
        assert_eq!(IngestError::AdmissionRejected.rejection_reason(), None);
    }

    #[test]
    fn test_rejection_reasons_ordered_by_specificity() {
        assert!(RejectionReason::Missing < RejectionReason::Malformed);
        assert!(RejectionReason::Malformed < RejectionReason::Invalid);
        assert!(RejectionReason::Invalid < RejectionReason::Expired);
    }

    #[test]
    fn test_sink_error_retryable() {
        assert!(SinkError::Unavailable("timeout".into()).is_retryable());
        assert!(!SinkError::Rejected("schema".into()).is_retryable());
    }

    #[test]
    fn test_validation_error_display() {
        let error = IngestError::from(ValidationError::BlankField("service"));
        assert_eq!(
            error.to_string(),
            "validation failed: field 'service' must not be blank"
        );
    }
}
