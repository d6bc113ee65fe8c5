// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-identity admission control.
//!
//! Every identity gets its own token bucket, created on first use and kept for
//! the life of the limiter. All buckets share one quota. Checks never block:
//! a request either takes a token or is turned away.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::HashMapStateStore;
use governor::{Quota, RateLimiter};
use tracing::debug;

use crate::credentials::Identity;
use crate::errors::IngestError;

// Keyed by `Identity::accounting_key`, so checks on a known identity never allocate.
type KeyedLimiter = RateLimiter<u64, HashMapStateStore<u64>, DefaultClock>;

pub struct AdmissionLimiter {
    // None when admission control is disabled.
    buckets: Option<KeyedLimiter>,
}

impl AdmissionLimiter {
    /// Creates a limiter refilling `per_second` tokens per second up to `burst`.
    pub fn new(per_second: u32, burst: u32) -> Result<Self, IngestError> {
        let per_second = NonZeroU32::new(per_second).ok_or_else(|| {
            IngestError::Configuration("rate limit must be greater than 0".to_string())
        })?;
        let burst = NonZeroU32::new(burst).ok_or_else(|| {
            IngestError::Configuration("rate limit burst must be greater than 0".to_string())
        })?;

        let quota = Quota::per_second(per_second).allow_burst(burst);
        Ok(Self {
            buckets: Some(RateLimiter::hashmap(quota)),
        })
    }

    /// A limiter that admits everything and tracks nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { buckets: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.buckets.is_some()
    }

    /// Takes one token from `identity`'s bucket.
    pub fn allow(&self, identity: &Identity) -> bool {
        let Some(buckets) = &self.buckets else {
            return true;
        };
        match buckets.check_key(&identity.accounting_key()) {
            Ok(()) => true,
            Err(_) => {
                debug!(identity = ?identity, "Admission rejected, rate limit exceeded");
                false
            }
        }
    }
}

impl std::fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLimiter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
