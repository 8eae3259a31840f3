// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! audio-handoff - lock-free buffer handoff for audio callbacks.
//!
//! Bridges a real-time callback thread owned by an audio driver and a worker
//! thread owned by the application, without the callback thread ever
//! allocating, locking or making a blocking call on its common path.

pub mod config;
pub mod error;
pub mod realtime;
pub mod simulate;

pub use config::{BackoffConfig, ConfigError, ConfigManager, HandoffConfig};
pub use error::HandoffError;
pub use realtime::{
    create_slot, destroy_slot, AudioCallback, BufferAccess, Claim, ClaimState, CyclePacer,
    HandoffSlot, IoMode, StatsSnapshot,
};
