// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Worker-thread side of the handoff.
//!
//! # Contract
//!
//! When a claim is observed the consumer reads the buffer fields, does its
//! processing, writes any results (the output frame count for playback and
//! duplex) and only then releases. [`Claim::release`] performs the result
//! write and the release in that order. A consumer that shares the audio
//! deadline should avoid allocating or taking contended locks while it holds
//! a claim; nothing here enforces that.
//!
//! # End of stream
//!
//! A zero frame count marks the end of a stream. A capture cycle with
//! `input_frames() == 0` means the driver has no more input to deliver, and a
//! playback or duplex claim released with `0` output frames tells the driver
//! the consumer has nothing left to play.
//!
//! # Buffer access
//!
//! Stall recovery hands the buffers back to the driver glue, which may reuse
//! or free them as soon as the submit call returns. Sample memory is only
//! reachable through a [`BufferAccess`] taken with [`Claim::access`], which
//! fails once the producer has given up on the cycle and otherwise keeps the
//! producer from returning until it is dropped. Keep it short.
//!
//! # Example
//!
//! ```ignore
//! use audio_handoff::{HandoffConfig, HandoffSlot};
//!
//! let slot = HandoffSlot::new(HandoffConfig::with_capacity(256))?;
//!
//! // Worker thread
//! let claim = slot.acquire();
//! let frames = match claim.access() {
//!     Some(access) => render(unsafe { access.output_slice_mut::<f32>(2) }),
//!     None => 0,
//! };
//! claim.release(frames)?;
//! ```

use crate::config::HandoffConfig;
use crate::error::HandoffError;
use crate::realtime::request::IoMode;
use crate::realtime::slot::{HandoffSlot, FILLING, IDLE};
use std::ffi::c_void;
use std::slice;
use std::sync::atomic::{fence, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A published cycle held by the consumer.
///
/// The buffer fields are copied when the claim is taken, so they keep
/// describing this cycle even after the producer has moved on.
///
/// Dropping a claim without calling [`release`](Claim::release) releases it
/// with the output frame count left at the requested value.
#[derive(Debug)]
pub struct Claim<'a> {
    slot: &'a HandoffSlot,
    generation: u32,
    mode: IoMode,
    input: *const c_void,
    input_frames: u32,
    output: *mut c_void,
    requested: u32,
    released: bool,
}

impl HandoffSlot {
    /// Take the current claim, if one is published.
    ///
    /// Returns `None` while the slot is idle or being filled, and while this
    /// slot's single consumer already holds a claim.
    pub fn try_acquire(&self) -> Option<Claim<'_>> {
        let flag = self.flag.load(Ordering::Acquire);
        if flag == IDLE || flag == FILLING {
            return None;
        }
        if self.consumer_held.swap(true, Ordering::AcqRel) {
            debug!("Claim {} already held by the consumer", flag);
            return None;
        }
        // Re-check under the consumer marker: the producer may have reset a
        // stalled cycle between the two loads.
        let generation = self.flag.load(Ordering::Acquire);
        if generation == IDLE || generation == FILLING {
            self.consumer_held.store(false, Ordering::Release);
            return None;
        }

        let claim = Claim {
            slot: self,
            generation,
            mode: self.current_mode(),
            input: self.input.load(Ordering::Relaxed) as *const c_void,
            input_frames: self.input_frames.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            requested: self.output_requested.load(Ordering::Relaxed),
            released: false,
        };

        // The fields belong to `generation` only if no later cycle was
        // published while they were being read.
        fence(Ordering::Acquire);
        if self.flag.load(Ordering::Relaxed) != generation {
            self.consumer_held.store(false, Ordering::Release);
            return None;
        }
        Some(claim)
    }

    /// Wait for the next claim, yielding the thread between polls.
    pub fn acquire(&self) -> Claim<'_> {
        loop {
            if let Some(claim) = self.try_acquire() {
                return claim;
            }
            thread::yield_now();
        }
    }

    /// Wait up to `timeout` for the next claim.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Claim<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(claim) = self.try_acquire() {
                return Some(claim);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::yield_now();
        }
    }

    /// Write the result for `generation` and clear the claim.
    fn finish(&self, generation: u32, actual: u32) -> Result<(), HandoffError> {
        let result = if self.flag.load(Ordering::Acquire) != generation {
            Err(HandoffError::StaleRelease { generation })
        } else {
            let requested = self.output_requested.load(Ordering::Relaxed);
            if actual > requested {
                debug!(
                    "Consumer reported {} frames for cycle {}, clamping to {}",
                    actual, generation, requested
                );
            }
            self.output_actual
                .store(actual.min(requested), Ordering::Relaxed);
            self.flag
                .compare_exchange(generation, IDLE, Ordering::AcqRel, Ordering::Relaxed)
                .map(|_| ())
                .map_err(|_| HandoffError::StaleRelease { generation })
        };

        self.consumer_held.store(false, Ordering::Release);

        if result.is_err() {
            self.stats().stale_releases.increment();
            warn!(
                "Cycle {} was abandoned by the producer before release, result discarded",
                generation
            );
        }
        result
    }
}

impl Claim<'_> {
    /// Generation identifying this cycle.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Direction of this cycle.
    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// Captured buffer, null for playback cycles.
    pub fn input_ptr(&self) -> *const c_void {
        self.input
    }

    /// Frames available behind [`input_ptr`](Self::input_ptr); zero marks end of stream.
    pub fn input_frames(&self) -> u32 {
        self.input_frames
    }

    /// Buffer to fill, null for capture cycles.
    pub fn output_ptr(&self) -> *mut c_void {
        self.output
    }

    /// Frames the driver asked for.
    pub fn requested_output_frames(&self) -> u32 {
        self.requested
    }

    /// Whether the producer still waits on this cycle.
    pub fn is_current(&self) -> bool {
        self.slot.flag.load(Ordering::Acquire) == self.generation
    }

    /// Pin this cycle's buffers for reading or writing.
    ///
    /// Returns `None` once stall recovery has abandoned the cycle. While the
    /// returned guard lives, a stall reset still clears the flag but the
    /// producer does not return to the driver until the guard is dropped.
    pub fn access(&self) -> Option<BufferAccess<'_>> {
        // Pairs with the SeqCst reset in `wait_for_release`: either the
        // producer sees the pin or this load sees the reset.
        self.slot.access.store(self.generation, Ordering::SeqCst);
        if self.slot.flag.load(Ordering::SeqCst) != self.generation {
            self.slot.access.store(IDLE, Ordering::Release);
            return None;
        }
        Some(BufferAccess { claim: self })
    }

    /// Report `actual_output_frames` and hand the slot back to the producer.
    ///
    /// Counts above the requested frame count are clamped. Fails with
    /// [`HandoffError::StaleRelease`] if the producer already gave up on
    /// this cycle, in which case the result is discarded.
    pub fn release(mut self, actual_output_frames: u32) -> Result<(), HandoffError> {
        self.released = true;
        self.slot.finish(self.generation, actual_output_frames)
    }
}

/// Pinned buffers of a current [`Claim`].
#[derive(Debug)]
pub struct BufferAccess<'c> {
    claim: &'c Claim<'c>,
}

impl BufferAccess<'_> {
    /// View the captured frames as `input_frames() * channels` samples of `T`.
    ///
    /// # Safety
    ///
    /// The driver must have published a buffer holding at least that many
    /// properly aligned `T`s.
    pub unsafe fn input_slice<T>(&self, channels: usize) -> &[T] {
        let ptr = self.claim.input as *const T;
        if ptr.is_null() {
            return &[];
        }
        slice::from_raw_parts(ptr, self.claim.input_frames as usize * channels)
    }

    /// View the output buffer as `requested_output_frames() * channels` samples of `T`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`input_slice`](Self::input_slice), for the output
    /// buffer. At most one view of the output may be live at a time.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn output_slice_mut<T>(&self, channels: usize) -> &mut [T] {
        let ptr = self.claim.output as *mut T;
        if ptr.is_null() {
            return &mut [];
        }
        slice::from_raw_parts_mut(ptr, self.claim.requested as usize * channels)
    }
}

impl Drop for BufferAccess<'_> {
    fn drop(&mut self) {
        self.claim.slot.access.store(IDLE, Ordering::Release);
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.slot.finish(self.generation, self.requested);
        }
    }
}

/// Paces a consumer so it wakes shortly before the driver's next buffer.
///
/// Sleeping through most of the buffer period keeps the consumer from burning
/// a core in [`HandoffSlot::acquire`], while the slack absorbs scheduler
/// latency so the producer still finds the consumer spinning.
#[derive(Debug, Clone)]
pub struct CyclePacer {
    buffer_duration: Duration,
    slack: Duration,
    last_cycle: Option<Instant>,
}

impl CyclePacer {
    /// Slack for one preempting task plus worker scheduling jitter.
    pub const DEFAULT_SLACK: Duration = Duration::from_millis(5);

    pub fn new(buffer_duration: Duration) -> Self {
        Self {
            buffer_duration,
            slack: Self::DEFAULT_SLACK,
            last_cycle: None,
        }
    }

    /// Pacer for a slot config; `None` when the sample rate is unknown.
    pub fn from_config(config: &HandoffConfig) -> Option<Self> {
        config.buffer_duration().map(Self::new)
    }

    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// Record that a cycle was just observed.
    pub fn mark(&mut self) {
        self.last_cycle = Some(Instant::now());
    }

    /// How long the consumer may sleep at `now` before the next cycle is due.
    pub fn pause_at(&self, now: Instant) -> Duration {
        let Some(last) = self.last_cycle else {
            return Duration::ZERO;
        };
        let passed = now.saturating_duration_since(last);
        self.buffer_duration
            .saturating_sub(passed)
            .saturating_sub(self.slack)
    }

    /// Sleep until shortly before the next cycle, returning the time slept.
    pub fn wait(&self) -> Duration {
        let pause = self.pause_at(Instant::now());
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        pause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ClaimState;
    use std::sync::Arc;

    #[test]
    fn test_no_claim_when_idle() {
        let slot = HandoffSlot::new(HandoffConfig::default()).unwrap();
        assert!(slot.try_acquire().is_none());
        assert!(slot
            .acquire_timeout(Duration::from_millis(2))
            .is_none());
    }

    #[test]
    fn test_single_consumer_holds_claim() {
        let slot = HandoffSlot::new(HandoffConfig::default()).unwrap();
        slot.flag.store(9, Ordering::Release);

        let claim = slot.try_acquire().unwrap();
        assert_eq!(claim.generation(), 9);
        assert!(slot.try_acquire().is_none());

        claim.release(0).unwrap();
        assert_eq!(slot.claim_state(), ClaimState::Idle);
        assert!(slot.try_acquire().is_none());
    }

    #[test]
    fn test_drop_releases_with_requested_count() {
        let slot = HandoffSlot::new(HandoffConfig::default()).unwrap();
        slot.output_requested.store(256, Ordering::Relaxed);
        slot.output_actual.store(0, Ordering::Relaxed);
        slot.flag.store(3, Ordering::Release);

        drop(slot.try_acquire().unwrap());
        assert!(slot.is_idle());
        assert_eq!(slot.output_actual.load(Ordering::Relaxed), 256);
    }

    #[test]
    fn test_late_release_is_detected() {
        let mut config = HandoffConfig::with_capacity(64);
        config.backoff.spin_limit = 50_000;
        let slot = Arc::new(HandoffSlot::new(config).unwrap());

        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.submit_capture(std::ptr::null(), 0))
        };

        // Hold the claim until the producer gives up on it.
        let claim = slot.acquire();
        let generation = claim.generation();
        let result = producer.join().unwrap();
        assert!(matches!(result, Err(HandoffError::StalledConsumer { .. })));
        assert!(!claim.is_current());

        assert_eq!(
            claim.release(0),
            Err(HandoffError::StaleRelease { generation })
        );
        assert!(slot.is_idle());
        assert_eq!(slot.stats().snapshot().stale_releases, 1);
    }

    #[test]
    fn test_late_release_does_not_clobber_next_cycle() {
        let mut config = HandoffConfig::with_capacity(64);
        config.backoff.spin_limit = 50_000;
        let slot = Arc::new(HandoffSlot::new(config).unwrap());

        let stalled = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.submit_playback(std::ptr::null_mut(), 16))
        };
        let old = slot.acquire();
        assert!(stalled.join().unwrap().is_err());

        // Next cycle is published while the old claim is still held.
        let mut out = [0u8; 32];
        let out_addr = out.as_mut_ptr() as usize;
        let next = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.submit_playback(out_addr as *mut c_void, 32))
        };
        while !matches!(slot.claim_state(), ClaimState::Claimed(g) if g != old.generation()) {
            thread::yield_now();
        }

        // The stale claim still describes its own cycle.
        assert_eq!(old.requested_output_frames(), 16);
        assert!(old.output_ptr().is_null());
        assert!(old.access().is_none());

        assert!(old.release(1).is_err());
        let claim = slot.acquire();
        assert_eq!(claim.requested_output_frames(), 32);
        claim.release(30).unwrap();
        assert_eq!(next.join().unwrap(), Ok(30));
    }

    #[test]
    fn test_typed_slices() {
        let slot = Arc::new(HandoffSlot::new(HandoffConfig::with_capacity(4)).unwrap());
        let input: Vec<f32> = vec![0.5, -0.5, 0.25, -0.25, 1.0, -1.0, 0.0, 0.0];
        let mut output = vec![0.0f32; 8];

        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let claim = slot.acquire();
                let access = claim.access().unwrap();
                // SAFETY: the producer below published 4 stereo f32 frames in
                // each direction.
                unsafe {
                    let src = access.input_slice::<f32>(2);
                    let dst = access.output_slice_mut::<f32>(2);
                    assert_eq!(src.len(), 8);
                    for (d, s) in dst.iter_mut().zip(src) {
                        *d = s * 2.0;
                    }
                }
                drop(access);
                claim.release(4).unwrap();
            })
        };

        let actual = slot
            .submit_duplex(output.as_mut_ptr().cast(), 4, input.as_ptr().cast(), 4)
            .unwrap();
        consumer.join().unwrap();
        assert_eq!(actual, 4);
        assert_eq!(output, vec![1.0, -1.0, 0.5, -0.5, 2.0, -2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_access_refused_after_stall() {
        let mut config = HandoffConfig::with_capacity(64);
        config.backoff.spin_limit = 50_000;
        let slot = Arc::new(HandoffSlot::new(config).unwrap());

        let mut out = vec![0u8; 64];
        let out_addr = out.as_mut_ptr() as usize;
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.submit_playback(out_addr as *mut c_void, 64))
        };

        let claim = slot.acquire();
        assert!(matches!(
            producer.join().unwrap(),
            Err(HandoffError::StalledConsumer { .. })
        ));
        assert!(claim.access().is_none());
        assert_eq!(slot.access.load(Ordering::Relaxed), IDLE);
        assert!(claim.release(64).is_err());
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_access_holds_stall_reset_until_dropped() {
        let mut config = HandoffConfig::with_capacity(64);
        config.backoff.spin_limit = 3_000;
        let slot = Arc::new(HandoffSlot::new(config).unwrap());

        let mut out = vec![0u8; 64];
        let out_addr = out.as_mut_ptr() as usize;
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.submit_playback(out_addr as *mut c_void, 64))
        };

        let claim = slot.acquire();
        let access = claim.access().unwrap();

        // The stall reset fires but the producer must keep off the buffer.
        while !slot.is_idle() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        // SAFETY: 64 one-byte frames were published and are pinned.
        unsafe { access.output_slice_mut::<u8>(1).fill(7) };
        drop(access);

        assert!(matches!(
            producer.join().unwrap(),
            Err(HandoffError::StalledConsumer { .. })
        ));
        assert!(out.iter().all(|&b| b == 7));
        assert_eq!(
            claim.release(64),
            Err(HandoffError::StaleRelease { generation: 1 })
        );
    }

    #[test]
    fn test_zero_frames_mark_end_of_stream() {
        let slot = Arc::new(HandoffSlot::new(HandoffConfig::with_capacity(64)).unwrap());
        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let claim = slot.acquire();
                let ended = claim.input_frames() == 0;
                claim.release(0).unwrap();

                // Nothing left to play.
                slot.acquire().release(0).unwrap();
                ended
            })
        };

        let mut out = [0u8; 64];
        slot.submit_capture(std::ptr::null(), 0).unwrap();
        assert_eq!(slot.submit_playback(out.as_mut_ptr().cast(), 64), Ok(0));
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_pacer_pause() {
        let mut pacer = CyclePacer::new(Duration::from_millis(20));
        assert_eq!(pacer.pause_at(Instant::now()), Duration::ZERO);

        pacer.mark();
        let last = pacer.last_cycle.unwrap();
        assert_eq!(
            pacer.pause_at(last + Duration::from_millis(5)),
            Duration::from_millis(10)
        );
        assert_eq!(
            pacer.pause_at(last + Duration::from_millis(18)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_pacer_from_config() {
        let mut config = HandoffConfig::with_capacity(480);
        assert!(CyclePacer::from_config(&config).is_none());

        config.sample_rate = Some(48_000);
        let pacer = CyclePacer::from_config(&config)
            .unwrap()
            .with_slack(Duration::from_millis(1));
        assert_eq!(pacer.buffer_duration, Duration::from_millis(10));
        assert_eq!(pacer.slack, Duration::from_millis(1));
    }
}
