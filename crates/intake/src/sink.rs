// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable sinks that flushed batches are handed to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::SinkError;

/// Destination for flushed batches.
///
/// Implementations must tolerate the same batch being written more than once:
/// a batch is retried after a transient failure, so delivery is at-least-once.
#[async_trait]
pub trait Sink<T>: Send + Sync {
    async fn insert_batch(&self, items: &[T]) -> Result<(), SinkError>;
}

/// How many times a flush tries the sink, and how long it waits in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry right away, up to `attempts` in total.
    Immediate(u64),
    /// `attempts` in total, waiting `step_ms * n` before the n-th retry.
    LinearBackoff(u64, u64),
    /// Doubling delay from `base_ms`, capped at `max_ms`.
    ExponentialBackoff { attempts: u64, base_ms: u64, max_ms: u64 },
}

impl RetryStrategy {
    #[must_use]
    pub fn max_attempts(&self) -> u64 {
        let attempts = match self {
            Self::Immediate(attempts) | Self::LinearBackoff(attempts, _) => *attempts,
            Self::ExponentialBackoff { attempts, .. } => *attempts,
        };
        attempts.max(1)
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u64) -> Duration {
        match self {
            Self::Immediate(_) => Duration::ZERO,
            Self::LinearBackoff(_, step_ms) => Duration::from_millis(step_ms.saturating_mul(retry)),
            Self::ExponentialBackoff {
                base_ms, max_ms, ..
            } => {
                let shift = retry.saturating_sub(1).min(32) as u32;
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}

/// Appends each batch to a file as newline-delimited JSON.
///
/// The file is synced before a write is reported as successful.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    // Serializes appends so concurrent batches never interleave lines.
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> Sink<T> for JsonLinesSink
where
    T: Serialize + Send + Sync,
{
    async fn insert_batch(&self, items: &[T]) -> Result<(), SinkError> {
        let mut payload = Vec::with_capacity(items.len() * 128);
        for item in items {
            serde_json::to_writer(&mut payload, item)
                .map_err(|e| SinkError::Rejected(format!("failed to serialize item: {e}")))?;
            payload.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&payload).await?;
        file.sync_data().await?;

        debug!("Wrote {} items to {}", items.len(), self.path.display());
        Ok(())
    }
}
