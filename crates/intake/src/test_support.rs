// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sinks used by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::errors::SinkError;
use crate::sink::Sink;

/// Records every batch it receives. Fails the first `fail_first` calls with
/// `failure`, then succeeds.
pub struct RecordingSink<T> {
    batches: Mutex<Vec<Vec<T>>>,
    calls: AtomicUsize,
    fail_first: AtomicUsize,
    failure: SinkError,
}

impl<T: Clone> RecordingSink<T> {
    pub fn new() -> Arc<Self> {
        Self::failing(0, SinkError::Unavailable("unused".to_string()))
    }

    pub fn failing(fail_first: usize, failure: SinkError) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(fail_first),
            failure,
        })
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recover(&self) {
        self.fail_first.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Sink<T> for RecordingSink<T> {
    async fn insert_batch(&self, items: &[T]) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(self.failure.clone());
        }
        self.batches.lock().unwrap().push(items.to_vec());
        Ok(())
    }
}

/// Blocks every write until the test releases it.
pub struct GatedSink<T> {
    pub inner: Arc<RecordingSink<T>>,
    pub started: Notify,
    gate: Semaphore,
}

impl<T: Clone> GatedSink<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RecordingSink::new(),
            started: Notify::new(),
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Sink<T> for GatedSink<T> {
    async fn insert_batch(&self, items: &[T]) -> Result<(), SinkError> {
        self.started.notify_one();
        self.gate.acquire().await.unwrap().forget();
        self.inner.insert_batch(items).await
    }
}
