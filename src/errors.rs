//! Error Types
//!
//! This module defines every error produced by the frame scheduling core.
//!
//! # Overview
//!
//! Errors fall into two groups:
//!
//! - **Synchronous** errors, returned from the call that caused them:
//!   [`GraphConsistencyError`] from graph construction, [`ArenaExhausted`]
//!   from resolution, [`DeviceError`] from submission, [`FenceOrderingError`]
//!   and [`PoolError`] from direct use of `Fence` and `BufferPool`.
//!   [`SchedulingError`] wraps all of them as the crate-wide error.
//! - **Asynchronous** faults, delivered on the scheduler's fault channel after
//!   `commit_frame` already returned: [`FrameFault::Hang`] and
//!   [`FrameFault::DeviceFault`].
//!
//! The core never retries. By the time any of these errors reaches the
//! caller, the affected frame's arena ranges, pooled buffers and admission
//! slot have been returned.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kairos::errors::{Result, SchedulingError};
//!
//! fn render(scheduler: &FrameScheduler) -> Result<()> {
//!     let ticket = scheduler.begin_frame();
//!     scheduler.commit_frame(ticket)
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::frame::FrameId;
use crate::utils::interner::ResourceName;

// ============================================================================
// Graph Errors
// ============================================================================

/// A pass graph has an invalid shape.
///
/// Raised by `add_pass` / `validate`, always before any allocation or GPU work
/// happens, so it is recoverable locally: fix the graph and try again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphConsistencyError {
    /// Two passes in the same frame share a name.
    #[error("duplicate pass name `{0}`")]
    DuplicatePass(String),

    /// A pass reads a resource that no earlier pass writes and that was not
    /// imported as a frame-external input.
    #[error("pass `{pass}` reads `{resource}` before any pass writes it")]
    ReadBeforeWrite {
        /// Reading pass
        pass: String,
        /// Resource that has no producer yet
        resource: ResourceName,
    },

    /// A resource name is written by more than one pass (or both imported and written).
    #[error("pass `{pass}` writes `{resource}`, which is already produced by `{producer}`")]
    DuplicateWriter {
        /// Offending pass
        pass: String,
        /// Resource being written twice
        resource: ResourceName,
        /// Pass (or `<external>`) that already produces it
        producer: String,
    },

    /// The same external input was imported twice.
    #[error("external input `{0}` imported twice")]
    DuplicateExternal(ResourceName),

    /// A write declaration carries a size of zero.
    #[error("pass `{pass}` declares zero-sized resource `{resource}`")]
    ZeroSizedResource {
        /// Offending pass
        pass: String,
        /// Zero-sized resource
        resource: ResourceName,
    },
}

// ============================================================================
// Resource Errors
// ============================================================================

/// The resource arena has neither a free range nor a lifetime-disjoint alias
/// candidate large enough for a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "arena exhausted: requested {requested} bytes, largest free range {largest_free} of {capacity}"
)]
pub struct ArenaExhausted {
    /// Aligned size of the failed request
    pub requested: u64,
    /// Largest contiguous free range at the time of failure
    pub largest_free: u64,
    /// Total arena capacity
    pub capacity: u64,
}

/// Misuse of the buffer pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The buffer is already free (double release).
    #[error("pooled buffer {0} is not in use")]
    NotInUse(u64),

    /// The buffer was never handed out by this pool.
    #[error("pooled buffer {0} does not belong to this pool")]
    UnknownBuffer(u64),
}

// ============================================================================
// Synchronization Errors
// ============================================================================

/// A fence was signaled with a value lower than one it already carries.
///
/// This is a programmer error: fatal to the frame and never retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("fence {fence}: signal value {attempted} is below last signaled value {last_signaled}")]
pub struct FenceOrderingError {
    /// Fence identifier
    pub fence: u64,
    /// Highest value signaled so far
    pub last_signaled: u64,
    /// Rejected value
    pub attempted: u64,
}

/// A committed frame stopped making progress.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame {frame} (slot {slot}) hung: no progress for {silent_for:?} (timeout {timeout:?})")]
pub struct HangDetected {
    /// Hung frame
    pub frame: FrameId,
    /// Admission slot the frame occupied
    pub slot: usize,
    /// Time since the last ping (or since submission)
    pub silent_for: Duration,
    /// Configured timeout
    pub timeout: Duration,
}

// ============================================================================
// Device Errors
// ============================================================================

/// Failure reported by the external graphics device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device was lost (driver reset, GPU removed).
    #[error("device lost")]
    Lost,

    /// The device could not allocate memory for a buffer or backing store.
    #[error("device out of memory ({0} bytes requested)")]
    OutOfMemory(u64),

    /// A handle passed to the device is unknown to it.
    #[error("invalid device handle {0}")]
    InvalidHandle(u64),

    /// Backend-specific failure.
    #[error("device error: {0}")]
    Other(String),
}

// ============================================================================
// Scheduling Errors
// ============================================================================

/// Error of the scheduling layer: returned from `commit_frame` and
/// scheduler construction, and the crate-wide [`Result`] error.
///
/// Every variant `commit_frame` returns is fatal to the frame; its resources
/// are released before the error is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// The frame's graph failed validation.
    #[error(transparent)]
    Graph(#[from] GraphConsistencyError),

    /// Resource resolution ran out of arena space.
    #[error(transparent)]
    Arena(#[from] ArenaExhausted),

    /// Fence values were encoded out of order.
    ///
    /// The scheduler only encodes through `Fence::signal_next`, which cannot
    /// go backwards. Code that calls `Fence::signal` itself (for example
    /// next to `PassGraph::encode`) gets this variant from `?`.
    #[error(transparent)]
    Fence(#[from] FenceOrderingError),

    /// The device refused a stream, buffer or submission.
    #[error("submission failed: {0}")]
    Device(#[from] DeviceError),

    /// The buffer pool was misused.
    ///
    /// Not returned by `commit_frame`: pool errors while releasing a frame
    /// are logged. Code driving a `BufferPool` directly gets this variant
    /// from `?`.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The ticket belongs to a different scheduler.
    #[error("frame ticket {0} does not belong to this scheduler")]
    StaleTicket(FrameId),

    /// Construction was given invalid settings.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The watchdog timer thread could not be started.
    #[error("failed to start watchdog thread: {0}")]
    WatchdogSpawn(String),
}

/// Asynchronous fault of an already committed frame.
///
/// Delivered on the scheduler's fault channel, independent of `commit_frame`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameFault {
    /// The watchdog declared the frame hung; it has been retired.
    #[error(transparent)]
    Hang(#[from] HangDetected),

    /// The device reported a failure when completing the frame.
    #[error("frame {frame} failed on device: {error}")]
    DeviceFault {
        /// Failed frame
        frame: FrameId,
        /// Device-reported error
        error: DeviceError,
    },
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// `frames_in_flight` must be at least 1.
    #[error("frames_in_flight must be at least 1")]
    NoFramesInFlight,

    /// The arena needs a non-zero capacity.
    #[error("arena capacity must be non-zero")]
    ZeroArenaCapacity,

    /// Arena alignment must be a non-zero power of two.
    #[error("arena alignment {0} is not a power of two")]
    BadAlignment(u64),

    /// Watchdog timeouts and poll intervals must be non-zero.
    #[error("watchdog {0} must be non-zero")]
    ZeroDuration(&'static str),
}

/// Alias for `Result<T, SchedulingError>`.
pub type Result<T> = std::result::Result<T, SchedulingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::interner::intern;

    #[test]
    fn graph_errors_wrap_transparently() {
        let inner = GraphConsistencyError::ReadBeforeWrite {
            pass: "lighting".into(),
            resource: intern("gbuffer"),
        };
        let wrapped: SchedulingError = inner.clone().into();
        assert_eq!(wrapped.to_string(), inner.to_string());
        assert!(wrapped.to_string().contains("gbuffer"));
    }

    #[test]
    fn hang_converts_into_fault() {
        let hang = HangDetected {
            frame: FrameId(7),
            slot: 1,
            silent_for: Duration::from_millis(40),
            timeout: Duration::from_millis(30),
        };
        let fault: FrameFault = hang.into();
        assert!(matches!(fault, FrameFault::Hang(h) if h.frame == FrameId(7)));
    }
}
