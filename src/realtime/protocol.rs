// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Producer-side claim/wait state machine.
//!
//! ```text
//!   IDLE --reserve (CAS)--> FILLING --publish(g)--> CLAIMED(g)
//!     ^                                                |
//!     +------- consumer release / stall reset ---------+
//! ```
//!
//! The producer never blocks on an OS primitive. It spins on the flag, and
//! only after `sleep_threshold` iterations does it take short sleeps every
//! `sleep_every` iterations. After `spin_limit` iterations it resets the flag
//! itself and reports the cycle as lost. A consumer holding a
//! [`BufferAccess`](crate::realtime::BufferAccess) for the cycle delays that
//! return until it lets go of the buffers.

use crate::error::HandoffError;
use crate::realtime::slot::{HandoffSlot, FILLING, IDLE};
use std::hint::spin_loop;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::warn;

impl HandoffSlot {
    /// Run one complete handoff cycle.
    ///
    /// `fill` writes the cycle's buffer fields while the slot is reserved and
    /// before the claim becomes visible to the consumer. Returns the cycle's
    /// generation once the consumer has released it.
    pub(crate) fn run_cycle<F>(&self, fill: F) -> Result<u32, HandoffError>
    where
        F: FnOnce(&HandoffSlot),
    {
        self.reserve()?;
        fill(self);
        let generation = self.publish();
        self.wait_for_release(generation)?;
        self.stats().cycles.increment();
        Ok(generation)
    }

    /// Move the flag from idle to filling.
    ///
    /// A non-idle flag means a second producer is inside a cycle. The fields
    /// are left untouched and the attempt is retried up to
    /// `violation_retry_limit` times.
    fn reserve(&self) -> Result<(), HandoffError> {
        let limit = self.config().backoff.violation_retry_limit;
        let mut attempts = 0u32;
        loop {
            let observed = self.flag.load(Ordering::Acquire);
            if observed != IDLE {
                attempts += 1;
                if attempts == 1 {
                    self.stats().contract_violations.increment();
                }
                if attempts >= limit {
                    warn!(
                        "Handoff slot still claimed ({}) after {} attempts, dropping cycle; \
                         does the driver run more than one callback at a time?",
                        observed, attempts
                    );
                    return Err(HandoffError::ContractViolation { attempts });
                }
                spin_loop();
                continue;
            }
            if self
                .flag
                .compare_exchange_weak(IDLE, FILLING, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Make the filled fields visible to the consumer under a fresh generation.
    fn publish(&self) -> u32 {
        let generation = self.next_generation();
        self.flag.store(generation, Ordering::Release);
        generation
    }

    /// Wait for the consumer to release `generation`, recovering from a stall.
    fn wait_for_release(&self, generation: u32) -> Result<(), HandoffError> {
        let backoff = &self.config().backoff;
        let interval = backoff.sleep_interval();

        for i in 1..=backoff.spin_limit {
            if self.flag.load(Ordering::Acquire) != generation {
                return Ok(());
            }
            if backoff.should_sleep(i) {
                self.stats().backoff_sleeps.increment();
                thread::sleep(interval);
            } else {
                spin_loop();
            }
        }

        // A failed exchange means the consumer released between the last poll
        // and here, so the cycle completed after all.
        match self
            .flag
            .compare_exchange(generation, IDLE, Ordering::SeqCst, Ordering::Acquire)
        {
            Ok(_) => {
                // The buffers go back to the driver on return; a consumer that
                // pinned them before the reset must let go first.
                while self.access.load(Ordering::SeqCst) == generation {
                    spin_loop();
                }
                self.stats().stalled_cycles.increment();
                warn!(
                    "Consumer did not release cycle {} within {} iterations, resetting slot",
                    generation, backoff.spin_limit
                );
                Err(HandoffError::StalledConsumer {
                    generation,
                    iterations: backoff.spin_limit,
                })
            }
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandoffConfig;
    use crate::realtime::ClaimState;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config(spin_limit: u32) -> HandoffConfig {
        let mut config = HandoffConfig::with_capacity(64);
        config.backoff.spin_limit = spin_limit;
        config.backoff.violation_retry_limit = 100;
        config
    }

    #[test]
    fn test_cycle_completes_when_consumer_releases() {
        let slot = Arc::new(HandoffSlot::new(fast_config(10_000_000)).unwrap());
        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let claim = slot.acquire();
                claim.generation()
            })
        };

        let generation = slot.run_cycle(|_| {}).unwrap();
        assert_eq!(consumer.join().unwrap(), generation);
        assert!(slot.is_idle());
        assert_eq!(slot.stats().snapshot().cycles, 1);
    }

    #[test]
    fn test_stall_resets_flag() {
        let slot = HandoffSlot::new(fast_config(2_000)).unwrap();
        let err = slot.run_cycle(|_| {}).unwrap_err();
        assert!(matches!(
            err,
            HandoffError::StalledConsumer {
                generation: 1,
                iterations: 2_000
            }
        ));
        assert_eq!(slot.claim_state(), ClaimState::Idle);
        assert_eq!(slot.stats().snapshot().stalled_cycles, 1);
        assert_eq!(slot.stats().snapshot().cycles, 0);
    }

    #[test]
    fn test_reserve_on_claimed_slot_is_bounded() {
        let slot = HandoffSlot::new(fast_config(2_000)).unwrap();
        // Simulate a second producer mid-cycle.
        slot.flag.store(42, Ordering::Release);

        let err = slot.run_cycle(|_| panic!("fields must not be touched")).unwrap_err();
        assert_eq!(err, HandoffError::ContractViolation { attempts: 100 });
        assert_eq!(slot.claim_state(), ClaimState::Claimed(42));
        assert_eq!(slot.stats().snapshot().contract_violations, 1);
    }

    #[test]
    fn test_violation_clears_when_other_cycle_finishes() {
        let mut config = fast_config(10_000_000);
        config.backoff.violation_retry_limit = u32::MAX;
        let slot = Arc::new(HandoffSlot::new(config).unwrap());
        slot.flag.store(FILLING, Ordering::Release);

        let releaser = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                slot.flag.store(IDLE, Ordering::Release);
                let claim = slot.acquire();
                claim.release(0).unwrap();
            })
        };

        slot.run_cycle(|_| {}).unwrap();
        releaser.join().unwrap();
        assert_eq!(slot.stats().snapshot().contract_violations, 1);
        assert!(slot.is_idle());
    }

    #[test]
    fn test_generations_increase_per_cycle() {
        let slot = Arc::new(HandoffSlot::new(fast_config(10_000_000)).unwrap());
        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                (0..3)
                    .map(|_| {
                        let claim = slot.acquire();
                        claim.generation()
                    })
                    .collect::<Vec<_>>()
            })
        };

        let produced: Vec<u32> = (0..3).map(|_| slot.run_cycle(|_| {}).unwrap()).collect();
        assert_eq!(produced, vec![1, 2, 3]);
        assert_eq!(consumer.join().unwrap(), produced);
    }
}
