// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lock-free counters describing slot health.
//!
//! Every counter is written with `Relaxed` ordering from whichever thread
//! observes the event, so bumping one is safe on the audio thread.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter {
    inner: AtomicU64,
}

impl Counter {
    /// Create a new counter starting at zero.
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Get the current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }

    /// Increment and return the new value.
    #[inline]
    pub fn increment(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Add `n` and return the new value.
    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.inner.fetch_add(n, Ordering::Relaxed).wrapping_add(n)
    }
}

/// Per-slot event counters.
#[derive(Debug, Default)]
pub struct HandoffStats {
    /// Cycles the consumer completed.
    pub cycles: Counter,
    /// Reserve attempts that found the slot already claimed.
    pub contract_violations: Counter,
    /// Cycles abandoned by stall recovery.
    pub stalled_cycles: Counter,
    /// Backoff sleeps taken in the wait phase.
    pub backoff_sleeps: Counter,
    /// Consumer releases that arrived after the producer gave up.
    pub stale_releases: Counter,
}

impl HandoffStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.get(),
            contract_violations: self.contract_violations.get(),
            stalled_cycles: self.stalled_cycles.get(),
            backoff_sleeps: self.backoff_sleeps.get(),
            stale_releases: self.stale_releases.get(),
        }
    }
}

/// Point-in-time copy of [`HandoffStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub contract_violations: u64,
    pub stalled_cycles: u64,
    pub backoff_sleeps: u64,
    pub stale_releases: u64,
}

impl StatsSnapshot {
    /// Cycles whose data never reached the consumer intact.
    pub fn dropped_cycles(&self) -> u64 {
        self.stalled_cycles
    }

    /// Render as a JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
