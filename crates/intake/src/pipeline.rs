// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The intake facade handed to the routing layer.
//!
//! Requests flow through authentication, then admission, then validation, and
//! only then reach a buffer. Error occurrences are additionally resolved to a
//! fault before their notice is buffered.

use std::sync::Arc;

use http::HeaderMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::buffer::{BufferMetrics, IngestionBuffer};
use crate::config::IntakeConfig;
use crate::credentials::{CredentialValidator, Identity, KeyAuthority};
use crate::errors::{IngestError, ValidationError};
use crate::fault::{FaultKeyResolver, FaultStore};
use crate::limiter::AdmissionLimiter;
use crate::notice::{Notice, NoticeReceipt, Occurrence};
use crate::record::{LogRecord, LogRecordInput};
use crate::sink::Sink;

/// External collaborators the pipeline writes to and reads from.
#[derive(Clone)]
pub struct IntakeDeps {
    pub key_authority: Arc<dyn KeyAuthority>,
    pub log_sink: Arc<dyn Sink<LogRecord>>,
    pub notice_sink: Arc<dyn Sink<Notice>>,
    pub fault_store: Arc<dyn FaultStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// Position of the rejected record in the submitted batch.
    pub index: usize,
    pub error: ValidationError,
}

/// Outcome of an ingest call. Invalid records are reported here, never as an `Err`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntakeMetrics {
    pub logs: BufferMetrics,
    pub notices: BufferMetrics,
}

#[derive(Debug)]
pub struct Intake {
    validator: CredentialValidator,
    limiter: AdmissionLimiter,
    logs: IngestionBuffer<LogRecord>,
    notices: IngestionBuffer<Notice>,
    faults: FaultKeyResolver,
}

impl Intake {
    /// Builds every component from `config`. Must be called inside a tokio runtime.
    pub fn new(config: &IntakeConfig, deps: IntakeDeps) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self {
            validator: config.credential_validator(deps.key_authority)?,
            limiter: config.admission_limiter()?,
            logs: IngestionBuffer::new(config.buffer_config("logs"), deps.log_sink)?,
            notices: IngestionBuffer::new(config.buffer_config("notices"), deps.notice_sink)?,
            faults: FaultKeyResolver::new(deps.fault_store),
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, IngestError> {
        self.validator.validate(headers).await
    }

    /// Takes one admission token for `identity`.
    pub fn admit(&self, identity: &Identity) -> Result<(), IngestError> {
        if self.limiter.allow(identity) {
            Ok(())
        } else {
            Err(IngestError::AdmissionRejected)
        }
    }

    pub async fn ingest_one(
        &self,
        record: LogRecordInput,
        identity: &Identity,
    ) -> Result<IngestSummary, IngestError> {
        self.ingest_batch(vec![record], identity).await
    }

    /// Admits the request once, validates every record, and buffers the valid
    /// ones in submission order.
    pub async fn ingest_batch(
        &self,
        records: Vec<LogRecordInput>,
        identity: &Identity,
    ) -> Result<IngestSummary, IngestError> {
        self.admit(identity)?;

        let mut summary = IngestSummary::default();
        let mut valid = Vec::with_capacity(records.len());
        for (index, input) in records.into_iter().enumerate() {
            match LogRecord::try_from(input) {
                Ok(record) => valid.push(record),
                Err(error) => {
                    debug!(index, "Rejected log record: {error}");
                    summary.errors.push(ItemError { index, error });
                }
            }
        }

        summary.accepted = valid.len();
        summary.rejected = summary.errors.len();
        self.logs.add_many(valid).await?;

        debug!(
            identity = ?identity,
            accepted = summary.accepted,
            rejected = summary.rejected,
            "Ingested log records"
        );
        Ok(summary)
    }

    /// Groups the occurrence into its fault and buffers a notice linked to it.
    pub async fn report_occurrence(
        &self,
        occurrence: Occurrence,
        identity: &Identity,
    ) -> Result<NoticeReceipt, IngestError> {
        self.admit(identity)?;
        let occurrence = occurrence.normalize()?;
        // Resolving counts the occurrence, so refuse before touching the store.
        if self.notices.is_closed() {
            return Err(IngestError::BufferClosed);
        }

        let fault = self.faults.resolve(&occurrence).await?;
        let notice = Notice::from_occurrence(occurrence, fault.id);
        let receipt = NoticeReceipt {
            id: notice.id,
            fault_id: fault.id,
        };
        self.notices.add(notice).await?;

        debug!(
            notice_id = %receipt.id,
            fault_id = %receipt.fault_id,
            new_fault = fault.created,
            "Recorded occurrence"
        );
        Ok(receipt)
    }

    #[must_use]
    pub fn metrics(&self) -> IntakeMetrics {
        IntakeMetrics {
            logs: self.logs.metrics(),
            notices: self.notices.metrics(),
        }
    }

    /// Re-attempts both failed-items lists. Returns the number of items written.
    pub async fn retry_failed(&self) -> Result<usize, IngestError> {
        let logs = self.logs.retry_failed().await;
        let notices = self.notices.retry_failed().await;
        Ok(logs? + notices?)
    }

    pub fn logs(&self) -> &IngestionBuffer<LogRecord> {
        &self.logs
    }

    pub fn notices(&self) -> &IngestionBuffer<Notice> {
        &self.notices
    }

    /// Drains both buffers. Safe to call more than once.
    pub async fn shutdown(&self) {
        for result in [self.logs.shutdown().await, self.notices.shutdown().await] {
            if let Err(e) = result {
                warn!("Buffer shutdown reported an error: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticKeyAuthority;
    use crate::errors::{RejectionReason, SinkError};
    use crate::fault::InMemoryFaultStore;
    use crate::record::Level;
    use crate::test_support::RecordingSink;
    use http::HeaderValue;
    use std::time::Duration;

    struct Harness {
        intake: Intake,
        logs: Arc<RecordingSink<LogRecord>>,
        notices: Arc<RecordingSink<Notice>>,
        faults: Arc<InMemoryFaultStore>,
    }

    fn harness(config: IntakeConfig) -> Harness {
        let logs = RecordingSink::<LogRecord>::new();
        let notices = RecordingSink::<Notice>::new();
        let faults = Arc::new(InMemoryFaultStore::new());
        let intake = Intake::new(
            &config,
            IntakeDeps {
                key_authority: Arc::new(StaticKeyAuthority::new(["k1", "k2"])),
                log_sink: logs.clone(),
                notice_sink: notices.clone(),
                fault_store: faults.clone(),
            },
        )
        .unwrap();
        Harness {
            intake,
            logs,
            notices,
            faults,
        }
    }

    fn config() -> IntakeConfig {
        IntakeConfig {
            batch_size: 10,
            flush_interval: Duration::from_secs(3600),
            flush_retries: 1,
            ..Default::default()
        }
    }

    fn record(message: &str) -> LogRecordInput {
        LogRecordInput {
            service: Some("checkout".to_string()),
            level: Some("warn".to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn occurrence(location: &str) -> Occurrence {
        Occurrence {
            project_id: "p1".to_string(),
            error_class: "TimeoutError".to_string(),
            message: "upstream timed out".to_string(),
            location: Some(location.to_string()),
            ..Default::default()
        }
    }

    fn key(value: &'static str) -> Identity {
        Identity::ApiKey(value.to_string())
    }

    #[tokio::test]
    async fn test_authenticate_with_api_key() {
        let h = harness(config());
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("k1"));
        assert_eq!(h.intake.authenticate(&headers).await.unwrap(), key("k1"));

        let error = h.intake.authenticate(&HeaderMap::new()).await.unwrap_err();
        assert_eq!(error.rejection_reason(), Some(RejectionReason::Missing));
    }

    #[tokio::test]
    async fn test_batch_reports_invalid_items_without_failing() {
        let h = harness(config());
        let batch = vec![
            record("one"),
            LogRecordInput {
                service: Some("  ".to_string()),
                ..record("blank service")
            },
            record("two"),
            LogRecordInput {
                level: Some("loud".to_string()),
                ..record("bad level")
            },
        ];

        let summary = h.intake.ingest_batch(batch, &key("k1")).await.unwrap();
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.errors[0].index, 1);
        assert_eq!(summary.errors[0].error, ValidationError::BlankField("service"));
        assert_eq!(summary.errors[1].index, 3);
        assert_eq!(h.intake.logs().len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_one_flushes_on_shutdown() {
        let h = harness(config());
        let summary = h.intake.ingest_one(record("only"), &key("k1")).await.unwrap();
        assert_eq!(summary.accepted, 1);
        assert!(h.logs.items().is_empty());

        h.intake.shutdown().await;
        h.intake.shutdown().await;

        let written = h.logs.items();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].level, Level::Warn);
        assert_eq!(h.logs.calls(), 1);
    }

    #[tokio::test]
    async fn test_admission_consumes_one_token_per_request() {
        let h = harness(IntakeConfig {
            rate_limit_per_second: 1,
            rate_limit_burst: 2,
            ..config()
        });
        let identity = key("k1");
        let batch = || (0..5).map(|i| record(&i.to_string())).collect::<Vec<_>>();

        assert_eq!(h.intake.ingest_batch(batch(), &identity).await.unwrap().accepted, 5);
        assert!(h.intake.ingest_batch(batch(), &identity).await.is_ok());
        assert!(matches!(
            h.intake.ingest_batch(batch(), &identity).await,
            Err(IngestError::AdmissionRejected)
        ));
        assert!(h.intake.ingest_batch(batch(), &key("k2")).await.is_ok());
        assert_eq!(h.intake.logs().len(), 5);
        assert_eq!(h.logs.items().len(), 10);
    }

    #[tokio::test]
    async fn test_rejected_admission_buffers_nothing() {
        let h = harness(IntakeConfig {
            rate_limit_per_second: 1,
            rate_limit_burst: 1,
            ..config()
        });
        let identity = key("k1");
        h.intake.ingest_one(record("a"), &identity).await.unwrap();
        let result = h.intake.ingest_one(record("b"), &identity).await;
        assert!(matches!(result, Err(IngestError::AdmissionRejected)));
        assert_eq!(h.intake.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_report_occurrence_groups_into_faults() {
        let h = harness(config());
        let identity = key("k1");

        let first = h
            .intake
            .report_occurrence(occurrence("a.rs:1"), &identity)
            .await
            .unwrap();
        let second = h
            .intake
            .report_occurrence(occurrence("a.rs:1"), &identity)
            .await
            .unwrap();
        let other = h
            .intake
            .report_occurrence(occurrence("b.rs:2"), &identity)
            .await
            .unwrap();

        assert_eq!(first.fault_id, second.fault_id);
        assert_ne!(first.fault_id, other.fault_id);
        assert_ne!(first.id, second.id);
        assert_eq!(h.faults.get(first.fault_id).unwrap().occurrence_count, 2);
        assert_eq!(
            h.faults.get(first.fault_id).unwrap().environment,
            "production"
        );

        h.intake.shutdown().await;
        let notices = h.notices.items();
        assert_eq!(notices.len(), 3);
        assert_eq!(notices[0].id, first.id);
        assert_eq!(notices[2].fault_id, other.fault_id);
    }

    #[tokio::test]
    async fn test_invalid_occurrence_creates_no_fault() {
        let h = harness(config());
        let result = h
            .intake
            .report_occurrence(
                Occurrence {
                    error_class: " ".to_string(),
                    ..occurrence("a.rs:1")
                },
                &key("k1"),
            )
            .await;
        assert!(matches!(
            result,
            Err(IngestError::ValidationFailed(ValidationError::BlankField("error_class")))
        ));
        assert!(h.faults.faults().is_empty());
        assert!(h.intake.notices().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_after_shutdown_is_rejected() {
        let h = harness(config());
        h.intake.shutdown().await;
        let result = h.intake.ingest_one(record("late"), &key("k1")).await;
        assert!(matches!(result, Err(IngestError::BufferClosed)));
    }

    #[tokio::test]
    async fn test_occurrence_after_shutdown_leaves_fault_untouched() {
        let h = harness(config());
        let identity = key("k1");
        let first = h
            .intake
            .report_occurrence(occurrence("a.rs:1"), &identity)
            .await
            .unwrap();
        h.intake.shutdown().await;
        let before = h.faults.get(first.fault_id).unwrap();

        let result = h
            .intake
            .report_occurrence(occurrence("a.rs:1"), &identity)
            .await;
        assert!(matches!(result, Err(IngestError::BufferClosed)));
        let late = h
            .intake
            .report_occurrence(occurrence("c.rs:3"), &identity)
            .await;
        assert!(matches!(late, Err(IngestError::BufferClosed)));

        let after = h.faults.get(first.fault_id).unwrap();
        assert_eq!(after.occurrence_count, 1);
        assert_eq!(after.last_seen_at, before.last_seen_at);
        assert_eq!(h.faults.faults().len(), 1);
        assert_eq!(h.notices.items().len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_and_retry_failed() {
        let logs = RecordingSink::<LogRecord>::failing(1, SinkError::Unavailable("down".into()));
        let intake = Intake::new(
            &IntakeConfig {
                batch_size: 2,
                ..config()
            },
            IntakeDeps {
                key_authority: Arc::new(StaticKeyAuthority::new(["k1"])),
                log_sink: logs.clone(),
                notice_sink: RecordingSink::<Notice>::new(),
                fault_store: Arc::new(InMemoryFaultStore::new()),
            },
        )
        .unwrap();

        let summary = intake
            .ingest_batch(vec![record("a"), record("b")], &key("k1"))
            .await
            .unwrap();
        assert_eq!(summary.accepted, 2);

        let metrics = intake.metrics();
        assert_eq!(metrics.logs.failed_items, 2);
        assert_eq!(metrics.logs.error_count, 1);
        assert_eq!(metrics.notices.flush_count, 0);

        assert_eq!(intake.retry_failed().await.unwrap(), 2);
        assert_eq!(intake.metrics().logs.failed_items, 0);
        assert_eq!(logs.items().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_construction() {
        let result = Intake::new(
            &IntakeConfig {
                batch_size: 0,
                ..config()
            },
            IntakeDeps {
                key_authority: Arc::new(StaticKeyAuthority::new(["k1"])),
                log_sink: RecordingSink::<LogRecord>::new(),
                notice_sink: RecordingSink::<Notice>::new(),
                fault_store: Arc::new(InMemoryFaultStore::new()),
            },
        );
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }
}
