#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

//! Kairos
//!
//! Frame scheduling core for GPU render loops: a bounded number of frames in
//! flight, ordered pass graphs with declared resource reads and writes, a
//! fixed-capacity arena that aliases lifetime-disjoint transients, a
//! cross-frame buffer pool, fence ordering between a primary and an async
//! stream, and a watchdog for stalled frames.
//!
//! The graphics backend is reached only through the [`Device`] trait;
//! [`HeadlessDevice`] runs everything on the CPU.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kairos::{FrameScheduler, HeadlessDevice, Pass, SchedulerSettings};
//!
//! let device = Arc::new(HeadlessDevice::new());
//! let _driver = device.spawn_driver()?;
//! let scheduler = FrameScheduler::new(device, SchedulerSettings::default())?;
//!
//! let mut ticket = scheduler.begin_frame();
//! ticket.add(Pass::compute("simulate").write("height-texture", 1 << 16))?;
//! ticket.add(Pass::render("draw").read("height-texture"))?;
//! scheduler.commit_frame(ticket)?;
//! scheduler.wait_idle();
//! ```

pub mod device;
pub mod errors;
pub mod frame;
pub mod settings;
pub mod utils;

pub use device::{Device, HeadlessDevice};
pub use errors::{
    ArenaExhausted, DeviceError, FenceOrderingError, FrameFault, GraphConsistencyError,
    HangDetected, SchedulingError,
};
pub use frame::{
    AliasGroup, BufferPool, Fence, FrameId, FrameScheduler, FrameTicket, Lifetime, LifetimeHint,
    Pass, PassGraph, PassKind, ResourceArena, ResourceBindings, ResourceHandle, Watchdog,
};
pub use settings::{ArenaSettings, PoolSettings, SchedulerSettings, WatchdogSettings};
pub use utils::interner::{self, ResourceName};
