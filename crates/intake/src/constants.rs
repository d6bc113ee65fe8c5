// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Items buffered before a size-triggered flush.
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Sink attempts per flush, including the first one.
pub const DEFAULT_FLUSH_RETRIES: u64 = 3;

pub const DEFAULT_FLUSH_BACKOFF_MS: u64 = 250;

/// Capacity of the failed-items list. Oldest items are dropped beyond this.
pub const DEFAULT_MAX_FAILED_ITEMS: usize = 10_000;

pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 10;
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 20;

pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_SESSION_COOKIE: &str = "session";

pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Location placeholder used in fault keys when the occurrence has none.
pub const UNKNOWN_LOCATION: &str = "unknown";

/// Number of lock stripes serializing fault resolution per key.
pub const FAULT_LOCK_STRIPES: usize = 64;
