// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Real-time safe buffer handoff.
//!
//! This module moves buffer pointers and frame counts from an audio driver's
//! callback thread to a worker thread through a single lock-free slot.
//!
//! # Real-Time Safety
//!
//! The producer (driver callback) side has strict requirements:
//! - No memory allocation
//! - No locks (mutexes, RwLocks)
//! - No system calls on the common path
//! - Bounded execution time
//!
//! The submit operations meet these on the common path. The only syscall is
//! the short backoff sleep taken after prolonged spinning. Logging happens
//! only when a cycle is already lost.

pub mod consumer;
pub mod protocol;
pub mod request;
pub mod slot;
pub mod stats;

pub use consumer::{BufferAccess, Claim, CyclePacer};
pub use request::{AudioCallback, IoMode};
pub use slot::{create_slot, destroy_slot, ClaimState, HandoffSlot};
pub use stats::{Counter, HandoffStats, StatsSnapshot};
