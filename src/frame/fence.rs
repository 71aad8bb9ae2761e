//! Fence
//!
//! A monotonic signal ordering two independently encoded command streams.
//!
//! `signal` and `wait` only *record* commands into a stream; neither blocks
//! the CPU. The fence keeps the highest value it has recorded a signal for,
//! so that the encoder can reject decreasing values before they reach the
//! device.
//!
//! ```text
//!  async stream:   ── producer ── signal(f, 3) ──────────────
//!                                       │
//!  primary stream: ── wait(f, 3) ───────┴── consumer ────────
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{Device, FenceHandle, StreamHandle};
use crate::errors::{DeviceError, FenceOrderingError};

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of a fence's recorded progress.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FenceState {
    pub id: u64,
    pub last_signaled_value: u64,
}

#[derive(Debug)]
pub struct Fence {
    id: u64,
    handle: FenceHandle,
    last_signaled: u64,
}

impl Fence {
    /// Creates a device fence at value zero.
    pub fn new(device: &dyn Device) -> Result<Self, DeviceError> {
        Ok(Self::from_handle(device.create_fence()?))
    }

    /// Wraps an existing device fence assumed to be at value zero.
    #[must_use]
    pub fn from_handle(handle: FenceHandle) -> Self {
        Self {
            id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
            handle,
            last_signaled: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> FenceHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    #[must_use]
    pub fn state(&self) -> FenceState {
        FenceState {
            id: self.id,
            last_signaled_value: self.last_signaled,
        }
    }

    /// Records a signal of `value` at the current end of `stream`.
    ///
    /// Repeating the last value is allowed; a lower value is rejected and
    /// nothing is recorded.
    pub fn signal(
        &mut self,
        device: &dyn Device,
        stream: StreamHandle,
        value: u64,
    ) -> Result<(), FenceOrderingError> {
        if value < self.last_signaled {
            return Err(FenceOrderingError {
                fence: self.id,
                last_signaled: self.last_signaled,
                attempted: value,
            });
        }
        device.encode_signal(stream, self.handle, value);
        self.last_signaled = value;
        log::trace!("fence {}: signal {value} on {stream:?}", self.id);
        Ok(())
    }

    /// Records a signal of `last_signaled + 1` and returns that value.
    pub fn signal_next(&mut self, device: &dyn Device, stream: StreamHandle) -> u64 {
        let value = self.last_signaled + 1;
        device.encode_signal(stream, self.handle, value);
        self.last_signaled = value;
        log::trace!("fence {}: signal {value} on {stream:?}", self.id);
        value
    }

    /// Records a GPU-side wait for `fence >= value` into `stream`.
    ///
    /// Waiting for a value no signal has been recorded for yet is legal (the
    /// signal may be recorded later on another stream) but is logged, since
    /// the waiting stream stalls until it happens.
    pub fn wait(&self, device: &dyn Device, stream: StreamHandle, value: u64) {
        if value > self.last_signaled {
            log::warn!(
                "fence {}: wait for {value} exceeds last recorded signal {}",
                self.id,
                self.last_signaled
            );
        }
        device.encode_wait(stream, self.handle, value);
        log::trace!("fence {}: wait {value} on {stream:?}", self.id);
    }
}
