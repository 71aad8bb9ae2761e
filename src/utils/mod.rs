//! Utility Module
//!
//! - [`interner`]: process-wide interning of resource names
//! - [`time`]: monotonic clocks, real and simulated
//!
//! # Resource Names
//!
//! Interned names compare in O(1) and are `Copy`, so pass declarations and
//! bindings can be passed around freely.
//!
//! ```rust,ignore
//! use kairos::utils::interner;
//!
//! let a = interner::intern("height-texture");
//! let b = interner::intern("height-texture");
//! assert_eq!(a, b);
//! ```

pub mod interner;
pub mod time;

pub use interner::ResourceName;
pub use time::{Clock, ManualClock, SystemClock};
