// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management for handoff slots.

pub mod handoff_config;
pub mod persistence;

pub use handoff_config::{BackoffConfig, HandoffConfig};
pub use persistence::{load_from_path, ConfigError, ConfigManager};
