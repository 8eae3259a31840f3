// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Slot sizing and spin/backoff tuning.

use crate::error::HandoffError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wait-phase tuning for the producer side of the handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Wait iterations before the consumer is declared stalled.
    #[serde(default = "default_spin_limit")]
    pub spin_limit: u32,
    /// Iterations of pure spinning before sleeps are allowed.
    #[serde(default = "default_sleep_threshold")]
    pub sleep_threshold: u32,
    /// Past the threshold, sleep once every this many iterations.
    #[serde(default = "default_sleep_every")]
    pub sleep_every: u32,
    /// Length of each backoff sleep in nanoseconds.
    #[serde(default = "default_sleep_interval_ns")]
    pub sleep_interval_ns: u64,
    /// Reserve attempts on an already claimed slot before giving up the cycle.
    #[serde(default = "default_violation_retry_limit")]
    pub violation_retry_limit: u32,
}

fn default_spin_limit() -> u32 {
    1_000_000
}

fn default_sleep_threshold() -> u32 {
    1_000
}

fn default_sleep_every() -> u32 {
    50
}

fn default_sleep_interval_ns() -> u64 {
    1_000
}

fn default_violation_retry_limit() -> u32 {
    10_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_limit: default_spin_limit(),
            sleep_threshold: default_sleep_threshold(),
            sleep_every: default_sleep_every(),
            sleep_interval_ns: default_sleep_interval_ns(),
            violation_retry_limit: default_violation_retry_limit(),
        }
    }
}

impl BackoffConfig {
    /// Sleep duration used once spinning has gone on too long.
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_nanos(self.sleep_interval_ns)
    }

    /// Whether wait iteration `i` (1-based) should sleep instead of spin.
    #[inline]
    pub fn should_sleep(&self, i: u32) -> bool {
        i >= self.sleep_threshold && i % self.sleep_every == 0
    }
}

/// Configuration for one handoff slot (one audio stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Maximum frames per callback cycle.
    pub capacity_frames: u32,
    /// Stream sample rate, if known. Used to check sleeps against the buffer budget.
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            capacity_frames: 512,
            sample_rate: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl HandoffConfig {
    /// Config with the given capacity and default backoff.
    pub fn with_capacity(capacity_frames: u32) -> Self {
        Self {
            capacity_frames,
            ..Self::default()
        }
    }

    /// Load config from TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Real-time duration of one full buffer, if the sample rate is known.
    pub fn buffer_duration(&self) -> Option<Duration> {
        self.sample_rate
            .filter(|&rate| rate > 0)
            .map(|rate| Duration::from_secs_f64(self.capacity_frames as f64 / rate as f64))
    }

    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> Result<(), HandoffError> {
        if self.capacity_frames == 0 {
            return Err(HandoffError::Config(
                "capacity_frames must be greater than zero".into(),
            ));
        }
        let b = &self.backoff;
        if b.spin_limit == 0 {
            return Err(HandoffError::Config(
                "spin_limit must be greater than zero".into(),
            ));
        }
        if b.sleep_every == 0 {
            return Err(HandoffError::Config(
                "sleep_every must be greater than zero".into(),
            ));
        }
        if b.violation_retry_limit == 0 {
            return Err(HandoffError::Config(
                "violation_retry_limit must be greater than zero".into(),
            ));
        }
        if let Some(budget) = self.buffer_duration() {
            if b.sleep_interval() >= budget {
                return Err(HandoffError::Config(format!(
                    "sleep interval {:?} does not fit in buffer budget {:?}",
                    b.sleep_interval(),
                    budget
                )));
            }
        }
        Ok(())
    }
}
