// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Simulated driver and scripted consumers.
//!
//! [`DriverSim`] stands in for an audio driver: it owns sample buffers and
//! issues callbacks from a dedicated thread at a fixed period. A
//! [`ScriptedConsumer`] plays the worker side with a chosen behavior and
//! records what it observed for each claim.

use crate::error::HandoffError;
use crate::realtime::{CyclePacer, HandoffSlot, IoMode};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How a scripted consumer responds to each claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerBehavior {
    /// Release at once, reporting the requested output count.
    Passthrough,
    /// Release at once, reporting this many output frames.
    Report(u32),
    /// Hold each claim until the producer has taken this many backoff sleeps.
    HoldUntilBackoff(u64),
    /// Never pick up a claim.
    Never,
}

/// What the consumer saw for one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub generation: u32,
    pub mode: IoMode,
    pub input_addr: usize,
    pub input_frames: u32,
    pub output_addr: usize,
    pub requested_output_frames: u32,
    /// Byte sum of the captured buffer.
    pub input_checksum: u64,
    /// Whether the release reached the producer.
    pub released: bool,
}

/// Builder for a consumer thread with scripted behavior.
#[derive(Debug, Clone)]
pub struct ScriptedConsumer {
    behavior: ConsumerBehavior,
    frame_bytes: usize,
    pacer: Option<CyclePacer>,
}

impl ScriptedConsumer {
    pub fn new(behavior: ConsumerBehavior) -> Self {
        Self {
            behavior,
            frame_bytes: 0,
            pacer: None,
        }
    }

    /// Bytes per frame; when nonzero the consumer checksums input and fills output.
    pub fn frame_bytes(mut self, frame_bytes: usize) -> Self {
        self.frame_bytes = frame_bytes;
        self
    }

    /// Sleep between cycles according to `pacer`.
    pub fn paced(mut self, pacer: CyclePacer) -> Self {
        self.pacer = Some(pacer);
        self
    }

    /// Start the consumer thread on `slot`.
    pub fn spawn(self, slot: Arc<HandoffSlot>) -> Result<ConsumerHandle, HandoffError> {
        let stop = Arc::new(AtomicBool::new(false));
        let observations = Arc::new(Mutex::new(Vec::new()));

        let thread = {
            let stop = Arc::clone(&stop);
            let observations = Arc::clone(&observations);
            thread::Builder::new()
                .name("handoff-consumer".into())
                .spawn(move || self.run(&slot, &stop, &observations))
                .map_err(|e| HandoffError::Thread(e.to_string()))?
        };

        Ok(ConsumerHandle {
            stop,
            observations,
            thread: Some(thread),
        })
    }

    fn run(mut self, slot: &HandoffSlot, stop: &AtomicBool, observations: &Mutex<Vec<Observation>>) {
        while !stop.load(Ordering::Relaxed) {
            if self.behavior == ConsumerBehavior::Never {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            if let Some(pacer) = &self.pacer {
                pacer.wait();
            }
            let Some(claim) = slot.acquire_timeout(Duration::from_millis(10)) else {
                continue;
            };
            if let Some(pacer) = &mut self.pacer {
                pacer.mark();
            }

            let mode = claim.mode();
            let requested = claim.requested_output_frames();
            let mut observation = Observation {
                generation: claim.generation(),
                mode,
                input_addr: claim.input_ptr() as usize,
                input_frames: claim.input_frames(),
                output_addr: claim.output_ptr() as usize,
                requested_output_frames: requested,
                input_checksum: 0,
                released: false,
            };

            if mode.inputs() && self.frame_bytes > 0 {
                if let Some(access) = claim.access() {
                    // SAFETY: the driver publishes `frame_bytes` bytes per frame
                    // and `access` keeps the buffer pinned.
                    let input = unsafe { access.input_slice::<u8>(self.frame_bytes) };
                    observation.input_checksum = input.iter().map(|&b| b as u64).sum();
                }
            }

            let actual = match self.behavior {
                ConsumerBehavior::Passthrough => requested,
                ConsumerBehavior::Report(frames) => frames,
                ConsumerBehavior::HoldUntilBackoff(sleeps) => {
                    let baseline = slot.stats().backoff_sleeps.get();
                    while slot.stats().backoff_sleeps.get() < baseline + sleeps
                        && claim.is_current()
                    {
                        thread::yield_now();
                    }
                    requested
                }
                ConsumerBehavior::Never => 0,
            };

            if mode.outputs() && self.frame_bytes > 0 {
                // An abandoned cycle's buffer is back with the driver.
                if let Some(access) = claim.access() {
                    // SAFETY: as above, for the output buffer.
                    let output = unsafe { access.output_slice_mut::<u8>(self.frame_bytes) };
                    let filled =
                        (actual.min(requested) as usize * self.frame_bytes).min(output.len());
                    output[..filled].fill(observation.generation as u8);
                }
            }

            trace!("Consumer releasing cycle {} with {} frames", observation.generation, actual);
            observation.released = claim.release(actual).is_ok();
            observations.lock().push(observation);
        }
    }
}

/// Running consumer thread.
pub struct ConsumerHandle {
    stop: Arc<AtomicBool>,
    observations: Arc<Mutex<Vec<Observation>>>,
    thread: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Copy of everything observed so far.
    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().clone()
    }

    /// Number of claims observed so far.
    pub fn observed(&self) -> usize {
        self.observations.lock().len()
    }

    /// Stop the consumer and return its observations.
    pub fn stop(mut self) -> Vec<Observation> {
        self.shutdown();
        std::mem::take(&mut *self.observations.lock())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outcome of a simulated driver run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriverReport {
    pub completed: u64,
    pub lost: u64,
    pub violations: u64,
    pub oversized: u64,
    /// Frames captured or played across completed cycles.
    pub frames_delivered: u64,
    pub max_cycle_us: u64,
    pub mean_cycle_us: f64,
}

/// Emulated audio driver issuing periodic callbacks.
#[derive(Debug, Clone)]
pub struct DriverSim {
    mode: IoMode,
    frames: u32,
    cycles: usize,
    frame_bytes: usize,
    period: Duration,
}

impl DriverSim {
    /// Driver issuing 100 callbacks of `frames` frames, 500µs apart.
    pub fn new(mode: IoMode, frames: u32) -> Self {
        Self {
            mode,
            frames,
            cycles: 100,
            frame_bytes: 4,
            period: Duration::from_micros(500),
        }
    }

    pub fn cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn frame_bytes(mut self, frame_bytes: usize) -> Self {
        self.frame_bytes = frame_bytes;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run the callbacks on a dedicated driver thread.
    pub fn spawn(self, slot: Arc<HandoffSlot>) -> Result<JoinHandle<DriverReport>, HandoffError> {
        thread::Builder::new()
            .name("handoff-driver".into())
            .spawn(move || self.run(&slot))
            .map_err(|e| HandoffError::Thread(e.to_string()))
    }

    /// Run the callbacks on the current thread.
    ///
    /// Cycle `i` fills the capture buffer with the byte `i as u8`.
    pub fn run(&self, slot: &HandoffSlot) -> DriverReport {
        let bytes = self.frames as usize * self.frame_bytes;
        let mut input = vec![0u8; bytes];
        let mut output = vec![0u8; bytes];
        let mut report = DriverReport::default();
        let mut total = Duration::ZERO;

        for i in 0..self.cycles {
            input.fill(i as u8);
            let start = Instant::now();
            let result = match self.mode {
                IoMode::Capture => slot
                    .submit_capture(input.as_ptr().cast(), self.frames)
                    .map(|_| self.frames),
                IoMode::Playback => slot.submit_playback(output.as_mut_ptr().cast(), self.frames),
                IoMode::Duplex => slot.submit_duplex(
                    output.as_mut_ptr().cast(),
                    self.frames,
                    input.as_ptr().cast(),
                    self.frames,
                ),
            };
            let elapsed = start.elapsed();
            total += elapsed;
            report.max_cycle_us = report.max_cycle_us.max(elapsed.as_micros() as u64);

            match result {
                Ok(frames) => {
                    report.completed += 1;
                    report.frames_delivered += frames as u64;
                }
                Err(HandoffError::ContractViolation { .. }) => report.violations += 1,
                Err(HandoffError::Oversized { .. }) => report.oversized += 1,
                Err(e) => {
                    debug!("Driver cycle {} lost: {}", i, e);
                    report.lost += 1;
                }
            }

            if !self.period.is_zero() {
                thread::sleep(self.period);
            }
        }

        if self.cycles > 0 {
            report.mean_cycle_us = total.as_micros() as f64 / self.cycles as f64;
        }
        report
    }
}
