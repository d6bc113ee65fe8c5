// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Grouping of error occurrences into faults.
//!
//! A fault is identified by its project and the `(error_class, location,
//! environment)` triple. [`FaultKeyResolver::resolve`] finds the fault for an
//! occurrence, creating it on first sight and otherwise bumping its occurrence
//! count and `last_seen_at`. Resolution of the same key is serialized so two
//! simultaneous first occurrences never create two faults.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use fnv::FnvHasher;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use crate::constants::{FAULT_LOCK_STRIPES, UNKNOWN_LOCATION};
use crate::errors::{IngestError, StoreError};
use crate::notice::Occurrence;

#[derive(
    Debug,
    Display,
    From,
    Into,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct FaultId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultKey {
    pub project_id: String,
    pub error_class: String,
    pub location: String,
    pub environment: String,
}

impl FaultKey {
    /// Expects an occurrence that has already been normalized.
    #[must_use]
    pub fn from_occurrence(occurrence: &Occurrence) -> Self {
        let location = occurrence
            .location
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty())
            .unwrap_or(UNKNOWN_LOCATION);
        Self {
            project_id: occurrence.project_id.clone(),
            error_class: occurrence.error_class.clone(),
            location: location.to_string(),
            environment: occurrence.environment.clone(),
        }
    }

    fn stripe(&self, stripes: usize) -> usize {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        (hasher.finish() % stripes as u64) as usize
    }
}

impl fmt::Display for FaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}[{}]",
            self.project_id, self.error_class, self.location, self.environment
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub id: FaultId,
    pub error_class: String,
    pub message: String,
    pub location: Option<String>,
    pub environment: String,
    pub resolved: bool,
    pub ignored: bool,
    pub assignee: Option<String>,
    pub tags: BTreeSet<String>,
    pub occurrence_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Data used to create a fault the first time its key is seen.
#[derive(Debug, Clone)]
pub struct NewFault<'a> {
    pub key: &'a FaultKey,
    pub message: &'a str,
    pub location: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultRef {
    pub id: FaultId,
    pub created: bool,
}

/// Persistent fault storage.
#[async_trait]
pub trait FaultStore: Send + Sync {
    /// Returns the fault for `fault.key`, creating it with an occurrence count of 1
    /// when absent. The boolean is true when the fault was created by this call.
    async fn find_or_create_fault(
        &self,
        fault: NewFault<'_>,
        now: DateTime<Utc>,
    ) -> Result<(FaultId, bool), StoreError>;

    /// Adds one occurrence and moves `last_seen_at` forward to `now` if later.
    async fn increment_occurrence(&self, id: FaultId, now: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Default)]
struct FaultTable {
    ids: HashMap<FaultKey, FaultId>,
    faults: HashMap<FaultId, Fault>,
}

/// Fault store held in process memory.
#[derive(Default)]
pub struct InMemoryFaultStore {
    table: Mutex<FaultTable>,
    next_id: AtomicU64,
}

impl InMemoryFaultStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: FaultId) -> Option<Fault> {
        self.lock_table().faults.get(&id).cloned()
    }

    #[must_use]
    pub fn faults(&self) -> Vec<Fault> {
        let mut faults: Vec<Fault> = self.lock_table().faults.values().cloned().collect();
        faults.sort_by_key(|fault| fault.id);
        faults
    }

    fn lock_table(&self) -> MutexGuard<'_, FaultTable> {
        #[allow(clippy::expect_used)]
        self.table.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl FaultStore for InMemoryFaultStore {
    async fn find_or_create_fault(
        &self,
        fault: NewFault<'_>,
        now: DateTime<Utc>,
    ) -> Result<(FaultId, bool), StoreError> {
        let mut table = self.lock_table();
        if let Some(id) = table.ids.get(fault.key) {
            return Ok((*id, false));
        }

        let id = FaultId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        table.ids.insert(fault.key.clone(), id);
        table.faults.insert(
            id,
            Fault {
                id,
                error_class: fault.key.error_class.clone(),
                message: fault.message.to_string(),
                location: fault.location.map(str::to_string),
                environment: fault.key.environment.clone(),
                resolved: false,
                ignored: false,
                assignee: None,
                tags: BTreeSet::new(),
                occurrence_count: 1,
                first_seen_at: now,
                last_seen_at: now,
            },
        );
        Ok((id, true))
    }

    async fn increment_occurrence(
        &self,
        id: FaultId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut table = self.lock_table();
        let fault = table
            .faults
            .get_mut(&id)
            .ok_or_else(|| StoreError(format!("fault {id} not found")))?;
        fault.occurrence_count += 1;
        fault.last_seen_at = fault.last_seen_at.max(now);
        Ok(())
    }
}

/// Maps occurrences to faults, creating or updating them in the store.
pub struct FaultKeyResolver {
    store: Arc<dyn FaultStore>,
    stripes: Vec<TokioMutex<()>>,
}

impl FaultKeyResolver {
    pub fn new(store: Arc<dyn FaultStore>) -> Self {
        Self {
            store,
            stripes: (0..FAULT_LOCK_STRIPES).map(|_| TokioMutex::new(())).collect(),
        }
    }

    /// Resolves `occurrence` to its fault. Only the occurrence counters and
    /// timestamps are written; triage fields are left alone.
    pub async fn resolve(&self, occurrence: &Occurrence) -> Result<FaultRef, IngestError> {
        let key = FaultKey::from_occurrence(occurrence);
        let _guard = self.stripes[key.stripe(self.stripes.len())].lock().await;

        let now = Utc::now();
        let (id, created) = self
            .store
            .find_or_create_fault(
                NewFault {
                    key: &key,
                    message: &occurrence.message,
                    location: occurrence.location.as_deref(),
                },
                now,
            )
            .await?;
        if created {
            debug!(fault_id = %id, "Created fault for {key}");
        } else {
            self.store.increment_occurrence(id, now).await?;
        }
        Ok(FaultRef { id, created })
    }
}

impl fmt::Debug for FaultKeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultKeyResolver")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
