// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching engine that accumulates accepted items and flushes them to a sink.
//!
//! # Flush triggers
//!
//! ```text
//!   add / add_many ──► queue ──(len >= batch_size)──► flush ──► Sink::insert_batch
//!                        ▲                              ▲
//!                        │                              │
//!                   shutdown drain               flush timer task
//! ```
//!
//! - **Size**: the `add` call that brings the queue to `batch_size` flushes it.
//! - **Time**: a background task ticks every `flush_interval` and flushes when
//!   the queue is non-empty and no flush is running.
//! - **Shutdown**: stops the timer, waits for any in-flight flush, then drains.
//!
//! # Guarantees
//!
//! - One flush at a time. A flush requested while another runs is a no-op.
//! - A flush swaps the queue out under the state lock and writes with the lock
//!   released, so producers keep filling the next batch during the write.
//! - Items reach the sink in the order they were added, and each item appears in
//!   exactly one successful batch unless it is dropped from the failed list.
//! - A batch that still fails after the retry strategy is exhausted is moved to a
//!   bounded failed-items list instead of being discarded. Overflow drops the
//!   oldest failed items and is counted in [`BufferMetrics::dropped_items`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_BACKOFF_MS, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_RETRIES,
    DEFAULT_MAX_FAILED_ITEMS,
};
use crate::errors::{IngestError, SinkError};
use crate::sink::{RetryStrategy, Sink};

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Used in log lines to tell buffers apart.
    pub name: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_strategy: RetryStrategy,
    pub max_failed_items: usize,
}

impl BufferConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_strategy: RetryStrategy::LinearBackoff(
                DEFAULT_FLUSH_RETRIES,
                DEFAULT_FLUSH_BACKOFF_MS,
            ),
            max_failed_items: DEFAULT_MAX_FAILED_ITEMS,
        }
    }

    fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::Configuration(format!(
                "{}: batch size must be greater than 0",
                self.name
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(IngestError::Configuration(format!(
                "{}: flush interval must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a buffer, read under the same lock used for mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferMetrics {
    pub queue_depth: usize,
    pub items_processed: u64,
    pub flush_count: u64,
    pub error_count: u64,
    pub failed_items: usize,
    pub dropped_items: u64,
    pub uptime: Duration,
}

struct State<T> {
    queue: Vec<T>,
    failed: VecDeque<T>,
    items_processed: u64,
    flush_count: u64,
    error_count: u64,
    dropped_items: u64,
    closed: bool,
}

struct Shared<T> {
    config: BufferConfig,
    sink: Arc<dyn Sink<T>>,
    state: Mutex<State<T>>,
    // Held for the duration of a sink write.
    flush_lock: TokioMutex<()>,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Thread-safe batching buffer. Cheap to clone; clones share the same queue.
pub struct IngestionBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for IngestionBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for IngestionBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionBuffer")
            .field("name", &self.shared.config.name)
            .finish()
    }
}

impl<T> IngestionBuffer<T>
where
    T: Send + Sync + 'static,
{
    /// Creates the buffer and starts its flush timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: BufferConfig, sink: Arc<dyn Sink<T>>) -> Result<Self, IngestError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            IngestError::Configuration(format!(
                "{}: buffer must be created inside a tokio runtime",
                config.name
            ))
        })?;

        let period = config.flush_interval;
        let buffer = Self {
            shared: Arc::new(Shared {
                config,
                sink,
                state: Mutex::new(State {
                    queue: Vec::new(),
                    failed: VecDeque::new(),
                    items_processed: 0,
                    flush_count: 0,
                    error_count: 0,
                    dropped_items: 0,
                    closed: false,
                }),
                flush_lock: TokioMutex::new(()),
                cancel: CancellationToken::new(),
                timer: Mutex::new(None),
                started_at: Instant::now(),
            }),
        };

        let timer = runtime.spawn(run_flush_timer(
            Arc::downgrade(&buffer.shared),
            period,
            buffer.shared.cancel.clone(),
        ));
        *buffer.lock_timer() = Some(timer);

        Ok(buffer)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Queues one item, flushing if the batch size is reached.
    ///
    /// A failed size-triggered flush does not fail the `add`: the item was
    /// accepted and now sits in the failed-items list.
    pub async fn add(&self, item: T) -> Result<(), IngestError> {
        let should_flush = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(IngestError::BufferClosed);
            }
            state.queue.push(item);
            state.queue.len() >= self.shared.config.batch_size
        };
        if should_flush {
            self.size_triggered_flush().await;
        }
        Ok(())
    }

    /// Queues all items under one lock acquisition, preserving their order.
    pub async fn add_many(&self, items: Vec<T>) -> Result<(), IngestError> {
        if items.is_empty() {
            return Ok(());
        }
        let should_flush = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(IngestError::BufferClosed);
            }
            state.queue.extend(items);
            state.queue.len() >= self.shared.config.batch_size
        };
        if should_flush {
            self.size_triggered_flush().await;
        }
        Ok(())
    }

    /// Writes the current queue to the sink.
    ///
    /// Returns the number of items written. Returns `Ok(0)` without touching the
    /// sink when the queue is empty or another flush is already running.
    pub async fn flush(&self) -> Result<usize, IngestError> {
        let Ok(_flushing) = self.shared.flush_lock.try_lock() else {
            debug!(buffer = %self.name(), "Flush already in progress, skipping");
            return Ok(0);
        };
        self.flush_queue().await
    }

    /// Re-attempts the failed-items list as a single batch.
    ///
    /// Items that fail again go back to the front of the list.
    pub async fn retry_failed(&self) -> Result<usize, IngestError> {
        let _flushing = self.shared.flush_lock.lock().await;
        let batch: Vec<T> = {
            let mut state = self.lock_state();
            state.failed.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        info!(buffer = %self.name(), "Retrying {count} failed items");
        let result = self.write(&batch).await;

        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                state.items_processed += count as u64;
                Ok(count)
            }
            Err(e) => {
                state.error_count += 1;
                for item in batch.into_iter().rev() {
                    state.failed.push_front(item);
                }
                self.enforce_failed_capacity(&mut state);
                Err(IngestError::SinkUnavailable {
                    items: count,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Hands the failed-items list to the caller, leaving it empty.
    pub fn take_failed(&self) -> Vec<T> {
        self.lock_state().failed.drain(..).collect()
    }

    /// Stops the timer and drains the queue.
    ///
    /// Waits for an in-flight flush to finish first. Calls after the first
    /// return immediately. Never fails: a failed final drain is logged and the
    /// items remain visible through [`Self::take_failed`] and the metrics.
    pub async fn shutdown(&self) -> Result<(), IngestError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        self.shared.cancel.cancel();
        let timer = self.lock_timer().take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                error!(buffer = %self.name(), "Flush timer task failed: {e}");
            }
        }

        let _flushing = self.shared.flush_lock.lock().await;
        match self.flush_queue().await {
            Ok(count) => {
                debug!(buffer = %self.name(), "Drained {count} items on shutdown");
            }
            Err(e) => {
                error!(buffer = %self.name(), "Final flush failed on shutdown: {e}");
            }
        }

        let failed = self.lock_state().failed.len();
        if failed > 0 {
            warn!(buffer = %self.name(), "Shut down with {failed} items in the failed list");
        }
        Ok(())
    }

    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        let state = self.lock_state();
        BufferMetrics {
            queue_depth: state.queue.len(),
            items_processed: state.items_processed,
            flush_count: state.flush_count,
            error_count: state.error_count,
            failed_items: state.failed.len(),
            dropped_items: state.dropped_items,
            uptime: self.shared.started_at.elapsed(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().queue.is_empty()
    }

    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.shared.flush_lock.try_lock().is_err()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    async fn size_triggered_flush(&self) {
        debug!(buffer = %self.name(), "Batch size reached, flushing");
        if let Err(e) = self.flush().await {
            warn!(buffer = %self.name(), "Size-triggered flush failed: {e}");
        }
    }

    // Caller must hold `flush_lock`.
    async fn flush_queue(&self) -> Result<usize, IngestError> {
        let batch = {
            let mut state = self.lock_state();
            std::mem::take(&mut state.queue)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        let result = self.write(&batch).await;

        let mut state = self.lock_state();
        state.flush_count += 1;
        match result {
            Ok(()) => {
                state.items_processed += count as u64;
                Ok(count)
            }
            Err(e) => {
                state.error_count += 1;
                state.failed.extend(batch);
                self.enforce_failed_capacity(&mut state);
                Err(IngestError::SinkUnavailable {
                    items: count,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn write(&self, batch: &[T]) -> Result<(), SinkError> {
        let strategy = self.shared.config.retry_strategy;
        let max_attempts = strategy.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let time = Instant::now();
            match self.shared.sink.insert_batch(batch).await {
                Ok(()) => {
                    debug!(
                        buffer = %self.name(),
                        "Flushed {} items in {} ms",
                        batch.len(),
                        time.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    error!(
                        buffer = %self.name(),
                        "Sink rejected {} items, not retrying: {e}",
                        batch.len()
                    );
                    return Err(e);
                }
                Err(e) if attempts >= max_attempts => {
                    error!(
                        buffer = %self.name(),
                        "Failed to flush {} items after {attempts} attempts: {e}",
                        batch.len()
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        buffer = %self.name(),
                        "Flush attempt {attempts}/{max_attempts} failed, retrying: {e}"
                    );
                    tokio::time::sleep(strategy.delay(attempts)).await;
                }
            }
        }
    }

    fn enforce_failed_capacity(&self, state: &mut State<T>) {
        let overflow = state
            .failed
            .len()
            .saturating_sub(self.shared.config.max_failed_items);
        if overflow > 0 {
            state.failed.drain(..overflow);
            state.dropped_items += overflow as u64;
            error!(
                buffer = %self.name(),
                "Failed-items list full, dropped {overflow} oldest items"
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        #[allow(clippy::expect_used)]
        self.shared.state.lock().expect("lock poisoned")
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        #[allow(clippy::expect_used)]
        self.shared.timer.lock().expect("lock poisoned")
    }
}

/// Ticks every `period` and flushes through the buffer's public entry point.
///
/// Holds only a weak reference so a dropped buffer also ends the task.
async fn run_flush_timer<T>(shared: Weak<Shared<T>>, period: Duration, cancel: CancellationToken)
where
    T: Send + Sync + 'static,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is instantaneous

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let buffer = IngestionBuffer { shared };
                if buffer.is_empty() || buffer.is_flushing() {
                    continue;
                }
                debug!(buffer = %buffer.name(), "Flush interval elapsed, flushing");
                if let Err(e) = buffer.flush().await {
                    warn!(buffer = %buffer.name(), "Timer-triggered flush failed: {e}");
                }
            }
        }
    }
    debug!("Flush timer stopped");
}
