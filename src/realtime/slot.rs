// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared state for one producer/consumer handoff.
//!
//! A [`HandoffSlot`] is created once per audio stream and reused for every
//! callback of that stream. It holds pointers and frame counts only; the
//! sample memory behind them stays owned by the driver glue.

use crate::config::HandoffConfig;
use crate::error::HandoffError;
use crate::realtime::request::IoMode;
use crate::realtime::stats::HandoffStats;
use std::alloc::{alloc, Layout};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};

/// Flag value while no cycle is in flight.
pub(crate) const IDLE: u32 = 0;
/// Flag value while the producer has reserved the slot and is writing fields.
pub(crate) const FILLING: u32 = u32::MAX;

/// Observable state of the claim flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// No cycle in flight.
    Idle,
    /// Producer is populating the slot.
    Filling,
    /// Cycle `generation` is published and waiting for the consumer.
    Claimed(u32),
}

impl ClaimState {
    pub(crate) fn from_flag(flag: u32) -> Self {
        match flag {
            IDLE => ClaimState::Idle,
            FILLING => ClaimState::Filling,
            g => ClaimState::Claimed(g),
        }
    }
}

/// Single-slot rendezvous between a driver callback thread and a worker thread.
///
/// Field access is serialized by the claim flag alone: the producer writes the
/// buffer fields before publishing a claim, the consumer writes results before
/// releasing it. The fields themselves are atomics so a consumer that wakes up
/// after stall recovery cannot cause a data race, only a detected stale release.
#[derive(Debug)]
pub struct HandoffSlot {
    config: HandoffConfig,
    pub(crate) flag: AtomicU32,
    /// Last generation handed out; only touched while the producer holds `FILLING`.
    pub(crate) generation: AtomicU32,
    pub(crate) mode: AtomicU8,
    pub(crate) input: AtomicPtr<c_void>,
    pub(crate) input_frames: AtomicU32,
    pub(crate) output: AtomicPtr<c_void>,
    pub(crate) output_requested: AtomicU32,
    pub(crate) output_actual: AtomicU32,
    /// Set while a consumer holds a [`Claim`](crate::realtime::Claim).
    pub(crate) consumer_held: AtomicBool,
    /// Generation whose buffers the consumer is touching, `IDLE` otherwise.
    pub(crate) access: AtomicU32,
    stats: HandoffStats,
}

impl HandoffSlot {
    /// Create a slot for a stream after validating its configuration.
    pub fn new(config: HandoffConfig) -> Result<Self, HandoffError> {
        config.validate()?;
        Ok(Self {
            config,
            flag: AtomicU32::new(IDLE),
            generation: AtomicU32::new(0),
            mode: AtomicU8::new(IoMode::Capture as u8),
            input: AtomicPtr::new(ptr::null_mut()),
            input_frames: AtomicU32::new(0),
            output: AtomicPtr::new(ptr::null_mut()),
            output_requested: AtomicU32::new(0),
            output_actual: AtomicU32::new(0),
            consumer_held: AtomicBool::new(false),
            access: AtomicU32::new(IDLE),
            stats: HandoffStats::default(),
        })
    }

    /// Create a heap-allocated slot, reporting allocator failure instead of aborting.
    pub fn try_boxed(config: HandoffConfig) -> Result<Box<Self>, HandoffError> {
        let slot = Self::new(config)?;
        let layout = Layout::new::<Self>();
        // SAFETY: `Self` is not zero-sized, so `layout` has a nonzero size.
        let raw = unsafe { alloc(layout) } as *mut Self;
        if raw.is_null() {
            return Err(HandoffError::Allocation {
                bytes: layout.size(),
            });
        }
        // SAFETY: `raw` is non-null, properly aligned for `Self` and
        // uninitialized; writing moves `slot` into it and Box takes ownership
        // of an allocation made with the global allocator and `Self`'s layout.
        unsafe {
            raw.write(slot);
            Ok(Box::from_raw(raw))
        }
    }

    /// Maximum frames per cycle.
    pub fn capacity_frames(&self) -> u32 {
        self.config.capacity_frames
    }

    /// Configuration the slot was built with.
    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// Current claim state, for diagnostics only.
    pub fn claim_state(&self) -> ClaimState {
        ClaimState::from_flag(self.flag.load(Ordering::Acquire))
    }

    /// Whether no cycle is in flight.
    pub fn is_idle(&self) -> bool {
        self.flag.load(Ordering::Acquire) == IDLE
    }

    /// Most recently published generation (0 before the first cycle).
    pub fn last_generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Event counters for this slot.
    pub fn stats(&self) -> &HandoffStats {
        &self.stats
    }

    /// Mode of the current or most recent cycle.
    pub(crate) fn current_mode(&self) -> IoMode {
        IoMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Advance to the next generation, skipping the reserved flag values.
    ///
    /// Must only be called while the producer holds `FILLING`.
    pub(crate) fn next_generation(&self) -> u32 {
        let mut g = self.generation.load(Ordering::Relaxed).wrapping_add(1);
        if g == IDLE || g == FILLING {
            g = 1;
        }
        self.generation.store(g, Ordering::Relaxed);
        g
    }
}

/// Allocate a slot for the driver glue (`createSlot`).
pub fn create_slot(config: HandoffConfig) -> Result<Box<HandoffSlot>, HandoffError> {
    HandoffSlot::try_boxed(config)
}

/// Tear down a slot once its stream has closed (`destroySlot`).
///
/// The producer must not be inside a submit call; the borrow checker enforces
/// this for Rust callers since the slot is consumed.
pub fn destroy_slot(slot: Box<HandoffSlot>) {
    if !slot.is_idle() {
        tracing::warn!(
            "Destroying handoff slot with cycle in flight ({:?})",
            slot.claim_state()
        );
    }
    drop(slot);
}
