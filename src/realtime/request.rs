// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Capture, playback and duplex requests issued from the driver callback.
//!
//! Each request populates the slot, runs exactly one handoff cycle and
//! relays the consumer's result. The calling thread is blocked for the
//! duration of the cycle.

use crate::error::HandoffError;
use crate::realtime::slot::HandoffSlot;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::Ordering;

/// Direction of audio data in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IoMode {
    /// Driver hands recorded frames to the consumer.
    Capture = 0,
    /// Consumer fills frames for the driver to play.
    Playback = 1,
    /// Both directions for the same driver tick.
    Duplex = 2,
}

impl IoMode {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => IoMode::Playback,
            2 => IoMode::Duplex,
            _ => IoMode::Capture,
        }
    }

    /// Whether the cycle carries captured input.
    pub fn inputs(self) -> bool {
        matches!(self, IoMode::Capture | IoMode::Duplex)
    }

    /// Whether the cycle carries an output buffer to fill.
    pub fn outputs(self) -> bool {
        matches!(self, IoMode::Playback | IoMode::Duplex)
    }

    pub fn is_duplex(self) -> bool {
        self == IoMode::Duplex
    }
}

impl std::fmt::Display for IoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoMode::Capture => write!(f, "capture"),
            IoMode::Playback => write!(f, "playback"),
            IoMode::Duplex => write!(f, "duplex"),
        }
    }
}

impl HandoffSlot {
    /// Hand captured frames to the consumer and wait until it has read them.
    ///
    /// `input` must stay valid until this call returns.
    pub fn submit_capture(&self, input: *const c_void, frames: u32) -> Result<(), HandoffError> {
        self.check_frames(frames)?;
        self.run_cycle(|slot| {
            slot.mode.store(IoMode::Capture as u8, Ordering::Relaxed);
            slot.input.store(input as *mut c_void, Ordering::Relaxed);
            slot.input_frames.store(frames, Ordering::Relaxed);
            slot.output.store(ptr::null_mut(), Ordering::Relaxed);
            slot.output_requested.store(0, Ordering::Relaxed);
            slot.output_actual.store(0, Ordering::Relaxed);
        })?;
        Ok(())
    }

    /// Ask the consumer to fill `output` with up to `requested` frames.
    ///
    /// Returns the number of frames actually written, which may be less than
    /// requested near the end of a stream. The unfilled tail is left as is;
    /// silencing or truncating it is up to the caller.
    pub fn submit_playback(&self, output: *mut c_void, requested: u32) -> Result<u32, HandoffError> {
        self.check_frames(requested)?;
        self.run_cycle(|slot| {
            slot.mode.store(IoMode::Playback as u8, Ordering::Relaxed);
            slot.input.store(ptr::null_mut(), Ordering::Relaxed);
            slot.input_frames.store(0, Ordering::Relaxed);
            slot.output.store(output, Ordering::Relaxed);
            slot.output_requested.store(requested, Ordering::Relaxed);
            slot.output_actual.store(requested, Ordering::Relaxed);
        })?;
        Ok(self.actual_output(requested))
    }

    /// Exchange input and output for the same driver tick in one cycle.
    ///
    /// The consumer sees both buffers under a single claim. Returns the number
    /// of output frames actually written.
    pub fn submit_duplex(
        &self,
        output: *mut c_void,
        requested: u32,
        input: *const c_void,
        input_frames: u32,
    ) -> Result<u32, HandoffError> {
        self.check_frames(requested)?;
        self.check_frames(input_frames)?;
        self.run_cycle(|slot| {
            slot.mode.store(IoMode::Duplex as u8, Ordering::Relaxed);
            slot.input.store(input as *mut c_void, Ordering::Relaxed);
            slot.input_frames.store(input_frames, Ordering::Relaxed);
            slot.output.store(output, Ordering::Relaxed);
            slot.output_requested.store(requested, Ordering::Relaxed);
            slot.output_actual.store(requested, Ordering::Relaxed);
        })?;
        Ok(self.actual_output(requested))
    }

    fn check_frames(&self, frames: u32) -> Result<(), HandoffError> {
        let capacity = self.capacity_frames();
        if frames > capacity {
            return Err(HandoffError::Oversized { frames, capacity });
        }
        Ok(())
    }

    fn actual_output(&self, requested: u32) -> u32 {
        self.output_actual.load(Ordering::Relaxed).min(requested)
    }
}

/// Entry points a platform binding forwards its driver callbacks to.
///
/// Bindings hold a `T: AudioCallback` (normally a [`HandoffSlot`]) and call
/// into it directly from the driver thread.
pub trait AudioCallback: Send + Sync {
    fn on_capture(&self, input: *const c_void, frames: u32) -> Result<(), HandoffError>;

    fn on_playback(&self, output: *mut c_void, requested: u32) -> Result<u32, HandoffError>;

    fn on_duplex(
        &self,
        output: *mut c_void,
        requested: u32,
        input: *const c_void,
        input_frames: u32,
    ) -> Result<u32, HandoffError>;
}

impl AudioCallback for HandoffSlot {
    #[inline]
    fn on_capture(&self, input: *const c_void, frames: u32) -> Result<(), HandoffError> {
        self.submit_capture(input, frames)
    }

    #[inline]
    fn on_playback(&self, output: *mut c_void, requested: u32) -> Result<u32, HandoffError> {
        self.submit_playback(output, requested)
    }

    #[inline]
    fn on_duplex(
        &self,
        output: *mut c_void,
        requested: u32,
        input: *const c_void,
        input_frames: u32,
    ) -> Result<u32, HandoffError> {
        self.submit_duplex(output, requested, input, input_frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandoffConfig;
    use std::sync::Arc;
    use std::thread;

    fn slot(capacity: u32) -> Arc<HandoffSlot> {
        Arc::new(HandoffSlot::new(HandoffConfig::with_capacity(capacity)).unwrap())
    }

    #[test]
    fn test_io_mode_directions() {
        assert!(IoMode::Capture.inputs());
        assert!(!IoMode::Capture.outputs());
        assert!(IoMode::Playback.outputs());
        assert!(!IoMode::Playback.inputs());
        assert!(IoMode::Duplex.inputs() && IoMode::Duplex.outputs());
        assert!(IoMode::Duplex.is_duplex());
        assert_eq!(IoMode::from_u8(IoMode::Playback as u8), IoMode::Playback);
    }

    #[test]
    fn test_capture_immediate_release() {
        let slot = slot(512);
        let buffer = vec![0.25f32; 512];

        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let claim = slot.acquire();
                (claim.mode(), claim.input_frames(), claim.input_ptr() as usize)
            })
        };

        slot.submit_capture(buffer.as_ptr().cast(), 512).unwrap();
        let (mode, frames, ptr) = consumer.join().unwrap();
        assert_eq!(mode, IoMode::Capture);
        assert_eq!(frames, 512);
        assert_eq!(ptr, buffer.as_ptr() as usize);
        assert!(slot.is_idle());
    }

    #[test]
    fn test_playback_returns_consumer_count() {
        let slot = slot(512);
        let mut buffer = vec![0i16; 256];

        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let claim = slot.acquire();
                assert_eq!(claim.requested_output_frames(), 256);
                claim.release(200).unwrap();
            })
        };

        let actual = slot.submit_playback(buffer.as_mut_ptr().cast(), 256).unwrap();
        consumer.join().unwrap();
        assert_eq!(actual, 200);
    }

    #[test]
    fn test_playback_clamps_overreport() {
        let slot = slot(512);
        let mut buffer = vec![0u8; 128];

        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.acquire().release(4096).unwrap())
        };

        let actual = slot.submit_playback(buffer.as_mut_ptr().cast(), 128).unwrap();
        consumer.join().unwrap();
        assert_eq!(actual, 128);
    }

    #[test]
    fn test_duplex_exposes_both_buffers() {
        let slot = slot(64);
        let input = vec![1u8; 64];
        let mut output = vec![0u8; 64];
        let in_addr = input.as_ptr() as usize;
        let out_addr = output.as_ptr() as usize;

        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                let claim = slot.acquire();
                assert_eq!(claim.mode(), IoMode::Duplex);
                assert_eq!(claim.input_ptr() as usize, in_addr);
                assert_eq!(claim.output_ptr() as usize, out_addr);
                assert_eq!(claim.input_frames(), 48);
                assert_eq!(claim.requested_output_frames(), 64);
                claim.release(32).unwrap();
            })
        };

        let actual = slot
            .submit_duplex(output.as_mut_ptr().cast(), 64, input.as_ptr().cast(), 48)
            .unwrap();
        consumer.join().unwrap();
        assert_eq!(actual, 32);
    }

    #[test]
    fn test_oversized_request_rejected_before_claim() {
        let slot = slot(512);
        let buffer = vec![0u8; 1024];
        let err = slot.submit_capture(buffer.as_ptr().cast(), 1024).unwrap_err();
        assert_eq!(
            err,
            HandoffError::Oversized {
                frames: 1024,
                capacity: 512
            }
        );
        assert!(slot.is_idle());
        assert_eq!(slot.last_generation(), 0);
    }

    #[test]
    fn test_dispatch_through_trait() {
        fn drive<T: AudioCallback>(target: &T, out: &mut [u8]) -> u32 {
            target.on_playback(out.as_mut_ptr().cast(), out.len() as u32).unwrap()
        }

        let slot = slot(32);
        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.acquire().release(10).unwrap())
        };

        let mut out = [0u8; 32];
        assert_eq!(drive(&*slot, &mut out), 10);
        consumer.join().unwrap();
    }
}
