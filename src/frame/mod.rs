//! Frame Scheduling Core
//!
//! Everything between `begin_frame` and frame completion.
//!
//! # Components (leaf first)
//!
//! | Module | Type | Responsibility |
//! |--------|------|----------------|
//! | [`arena`] | [`ResourceArena`] | Sub-allocates per-frame transients from one backing store, aliasing lifetime-disjoint ones |
//! | [`pool`] | [`BufferPool`] | Cross-frame free list of fixed-size buffers |
//! | [`fence`] | [`Fence`] | Monotonic GPU-side signal/wait between two streams |
//! | [`graph`] | [`PassGraph`] | Ordered passes with declared reads/writes; resolve + encode |
//! | [`watchdog`] | [`Watchdog`] | Per-frame liveness timeouts on a timer thread |
//! | [`scheduler`] | [`FrameScheduler`] | Admission of at most N frames, commit, completion, retirement |
//!
//! # Frame Lifecycle
//!
//! ```text
//!  begin_frame ──► FrameTicket ──► add_pass* ──► commit_frame ──► device
//!      ▲ (blocks while N in flight)                  │               │
//!      │                                             │ validate      │ completion
//!      │                                             │ resolve       ▼
//!      │                                             │ encode     release arena
//!      └──────────── slot returned ◄─────────────────┴──────────  return buffers
//!                                                                 watchdog.complete
//! ```

pub mod arena;
pub mod fence;
pub mod graph;
pub mod pool;
pub mod scheduler;
pub mod watchdog;

use std::fmt;

pub use arena::{AliasGroup, AllocationKey, ArenaAllocation, ArenaStats, Lifetime, ResourceArena};
pub use fence::{Fence, FenceState};
pub use graph::{
    EncodeContext, EncodedFrame, LifetimeHint, Pass, PassEncode, PassGraph, PassKind,
    ResolvedResources, ResourceBindings, ResourceDesc, ResourceHandle, SlotFences,
};
pub use pool::{BufferId, BufferPool, BufferState, PoolStats, PooledBuffer};
pub use scheduler::{FramePinger, FrameScheduler, FrameTicket, SchedulerStats};
pub use watchdog::{Watchdog, WatchdogEntry, WatchdogPinger, WatchdogState};

/// Identity of one frame, unique per scheduler and increasing in
/// `begin_frame` order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FrameId(pub u64);

impl FrameId {
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}
