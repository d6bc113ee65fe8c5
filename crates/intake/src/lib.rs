// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Intake
//!
//! Admission and buffering for log records and error occurrences.
//!
//! ## Pipeline
//!
//! ```text
//! request ─► CredentialValidator ─► AdmissionLimiter ─► validation ─► IngestionBuffer ─► Sink
//!                                                          │
//!                                   occurrence ─► FaultKeyResolver ─► notice buffer ─► Sink
//! ```
//!
//! - [`credentials`]: API key and signed session token authentication
//! - [`limiter`]: per-identity token buckets
//! - [`buffer`]: size and timer triggered batching with graceful drain
//! - [`fault`]: grouping of error occurrences into faults
//! - [`pipeline`]: the [`Intake`] facade tying them together

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod errors;
pub mod fault;
pub mod limiter;
pub mod notice;
pub mod pipeline;
pub mod record;
pub mod sink;

#[cfg(test)]
mod test_support;

pub use buffer::{BufferConfig, BufferMetrics, IngestionBuffer};
pub use config::IntakeConfig;
pub use credentials::{
    CredentialStrategy, CredentialValidator, Identity, KeyAuthority, StaticKeyAuthority,
};
pub use errors::{IngestError, RejectionReason, SinkError, ValidationError};
pub use fault::{FaultKeyResolver, FaultStore, InMemoryFaultStore};
pub use limiter::AdmissionLimiter;
pub use notice::{Notice, NoticeReceipt, Occurrence};
pub use pipeline::{IngestSummary, Intake, IntakeDeps, IntakeMetrics};
pub use record::{Level, LogRecord, LogRecordInput};
pub use sink::{JsonLinesSink, RetryStrategy, Sink};
