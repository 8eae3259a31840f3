// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors surfaced by the handoff primitive.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// Slot configuration rejected at construction.
    #[error("Invalid handoff configuration: {0}")]
    Config(String),
    /// Backing storage for the slot could not be obtained.
    #[error("Failed to allocate handoff slot ({bytes} bytes)")]
    Allocation { bytes: usize },
    /// A claim was attempted while another cycle was in flight.
    #[error("Slot already claimed after {attempts} attempts; does the driver run more than one callback at a time?")]
    ContractViolation { attempts: u32 },
    /// The consumer did not release within the spin bound; the cycle's data is lost.
    #[error("Consumer stalled on cycle {generation} after {iterations} iterations, slot reset")]
    StalledConsumer { generation: u32, iterations: u32 },
    /// The consumer released a cycle the producer had already abandoned.
    #[error("Late release of cycle {generation} discarded")]
    StaleRelease { generation: u32 },
    /// The driver handed over more frames than the slot was sized for.
    #[error("Frame count {frames} exceeds slot capacity {capacity}")]
    Oversized { frames: u32, capacity: u32 },
    /// A simulation thread could not be started.
    #[error("Thread error: {0}")]
    Thread(String),
}

impl HandoffError {
    /// Whether the cycle's buffers must be treated as never processed.
    pub fn is_cycle_lost(&self) -> bool {
        matches!(
            self,
            HandoffError::ContractViolation { .. }
                | HandoffError::StalledConsumer { .. }
                | HandoffError::Oversized { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_lost_classification() {
        assert!(HandoffError::StalledConsumer {
            generation: 3,
            iterations: 10
        }
        .is_cycle_lost());
        assert!(HandoffError::ContractViolation { attempts: 5 }.is_cycle_lost());
        assert!(!HandoffError::StaleRelease { generation: 3 }.is_cycle_lost());
        assert!(!HandoffError::Allocation { bytes: 64 }.is_cycle_lost());
        assert!(!HandoffError::Thread("spawn failed".into()).is_cycle_lost());
    }

    #[test]
    fn test_error_messages() {
        let err = HandoffError::Oversized {
            frames: 1024,
            capacity: 512,
        };
        assert_eq!(err.to_string(), "Frame count 1024 exceeds slot capacity 512");
        assert_eq!(
            HandoffError::Thread("out of threads".into()).to_string(),
            "Thread error: out of threads"
        );
    }
}
