//! External Device Interface
//!
//! The scheduling core never talks to a graphics API directly. Everything it
//! needs from the backend goes through the [`Device`] trait:
//!
//! | Operation | Used by |
//! |-----------|---------|
//! | `create_command_stream` / `submit` / `discard_stream` | `FrameScheduler` |
//! | `allocate_backing_store` | `ResourceArena` (once per arena) |
//! | `create_buffer` / `destroy_buffer` | `BufferPool` |
//! | `create_fence` / `encode_signal` / `encode_wait` | `Fence` |
//!
//! All handles are opaque integers chosen by the device. A backend maps them
//! to its own objects (command buffers, heaps, shared events, ...).
//!
//! The device is the scheduler's *context handle*: constructed once by the
//! application, shared as an `Arc<dyn Device>`, and injected into the
//! scheduler rather than looked up globally.
//!
//! [`HeadlessDevice`] is a CPU implementation used for tests and for running
//! the scheduling logic without a GPU.

pub mod headless;

pub use headless::{HeadlessCommand, HeadlessDevice, HeadlessDriver, HeadlessStats};

use std::fmt;

use crate::errors::DeviceError;

macro_rules! device_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw device value.
            #[inline]
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

device_handle!(
    /// A command stream being recorded (one command buffer).
    StreamHandle
);
device_handle!(
    /// Backing memory of one resource arena (one heap).
    ArenaBackingHandle
);
device_handle!(
    /// A standalone device buffer handed out by the buffer pool.
    BufferHandle
);
device_handle!(
    /// A monotonic GPU-side signal.
    FenceHandle
);

/// Continuation invoked by the device once a submitted stream has finished
/// executing (or failed). Runs on an arbitrary device thread.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), DeviceError>) + Send + 'static>;

/// Minimal surface the scheduling core requires from a graphics backend.
///
/// # Contract
///
/// - `submit` either returns `Err` and drops `completion` without calling it,
///   or returns `Ok` and calls `completion` exactly once, later, from any thread.
/// - `encode_wait` is a GPU-side wait: it delays the commands recorded after
///   it on `stream` until `fence` reaches at least `value`. It never blocks
///   the calling thread.
/// - `encode_signal` sets `fence` to at least `value` once all commands
///   recorded before it on `stream` have executed.
/// - Completion callbacks must not be invoked while the device holds locks
///   that `destroy_buffer` needs: the scheduler returns pooled buffers from
///   inside the callback.
pub trait Device: Send + Sync {
    /// Begins recording a new command stream.
    fn create_command_stream(&self, label: &str) -> Result<StreamHandle, DeviceError>;

    /// Submits a recorded stream for execution.
    fn submit(&self, stream: StreamHandle, completion: CompletionCallback)
    -> Result<(), DeviceError>;

    /// Drops a stream that was recorded but will never be submitted.
    fn discard_stream(&self, stream: StreamHandle);

    /// Allocates the fixed-capacity backing store of one arena.
    fn allocate_backing_store(&self, capacity: u64) -> Result<ArenaBackingHandle, DeviceError>;

    /// Creates a standalone buffer of `size` bytes.
    fn create_buffer(&self, size: u64) -> Result<BufferHandle, DeviceError>;

    /// Destroys a buffer created with [`create_buffer`](Self::create_buffer).
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Creates a fence with value zero.
    fn create_fence(&self) -> Result<FenceHandle, DeviceError>;

    /// Records a signal of `fence` to `value` into `stream`.
    fn encode_signal(&self, stream: StreamHandle, fence: FenceHandle, value: u64);

    /// Records a wait for `fence >= value` into `stream`.
    fn encode_wait(&self, stream: StreamHandle, fence: FenceHandle, value: u64);
}
