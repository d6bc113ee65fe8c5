// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use intake::{
    InMemoryFaultStore, IntakeDeps, LogRecord, Notice, Sink, SinkError, StaticKeyAuthority,
};

pub const API_KEY: &str = "integration-key";
pub const TOKEN_SECRET: &str = "integration-secret";

/// Keeps every batch in memory. Fails while `outage` is above zero,
/// counting down once per call.
pub struct MemorySink<T> {
    batches: Mutex<Vec<Vec<T>>>,
    outage: AtomicUsize,
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Arc<Self> {
        Self::with_outage(0)
    }

    pub fn with_outage(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
            outage: AtomicUsize::new(failures),
        })
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Sink<T> for MemorySink<T> {
    async fn insert_batch(&self, items: &[T]) -> Result<(), SinkError> {
        let failing = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("connection reset".to_string()));
        }
        self.batches.lock().unwrap().push(items.to_vec());
        Ok(())
    }
}

pub struct Collaborators {
    pub logs: Arc<MemorySink<LogRecord>>,
    pub notices: Arc<MemorySink<Notice>>,
    pub faults: Arc<InMemoryFaultStore>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self {
            logs: MemorySink::new(),
            notices: MemorySink::new(),
            faults: Arc::new(InMemoryFaultStore::new()),
        }
    }

    pub fn deps(&self) -> IntakeDeps {
        IntakeDeps {
            key_authority: Arc::new(StaticKeyAuthority::new([API_KEY])),
            log_sink: self.logs.clone(),
            notice_sink: self.notices.clone(),
            fault_store: self.faults.clone(),
        }
    }
}
