//! Scheduler Settings
//!
//! Configuration for the frame scheduler and the resources it owns.
//!
//! Every value has a default, but none of them is derived from first
//! principles: three frames in flight and a 20 MiB arena are common
//! starting points for triple-buffered renderers. Tune them per workload.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use kairos::settings::{SchedulerSettings, WatchdogSettings};
//!
//! // Triple buffering, default arena and pool, no watchdog
//! let settings = SchedulerSettings::default();
//!
//! // Double buffering with a 60 Hz watchdog (8 frame intervals of slack)
//! let settings = SchedulerSettings::default()
//!     .with_frames_in_flight(2)
//!     .with_watchdog(WatchdogSettings::from_frame_interval(
//!         Duration::from_micros(16_667),
//!         8,
//!     ));
//! ```

use std::time::Duration;

use crate::errors::SettingsError;

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// Configuration of the per-scheduler [`ResourceArena`](crate::frame::ResourceArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSettings {
    /// Size of the backing store in bytes.
    pub capacity: u64,
    /// Every allocation offset and reserved size is a multiple of this.
    pub alignment: u64,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            capacity: 20 * 1024 * 1024,
            alignment: 16,
        }
    }
}

impl ArenaSettings {
    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.capacity == 0 {
            return Err(SettingsError::ZeroArenaCapacity);
        }
        if !self.alignment.is_power_of_two() {
            return Err(SettingsError::BadAlignment(self.alignment));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Buffer Pool
// ---------------------------------------------------------------------------

/// Configuration of the cross-frame [`BufferPool`](crate::frame::BufferPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// At most this many free buffers are retained per size class. A release
    /// into a class that already holds this many destroys the buffer, so the
    /// class never grows past the cap.
    pub max_buffers_per_size: usize,
    /// Free buffers idle for more than this many frames are destroyed by
    /// [`BufferPool::end_frame`](crate::frame::BufferPool::end_frame).
    pub max_idle_frames: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_buffers_per_size: 8,
            max_idle_frames: 120,
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn with_max_buffers_per_size(mut self, cap: usize) -> Self {
        self.max_buffers_per_size = cap;
        self
    }

    #[must_use]
    pub fn with_max_idle_frames(mut self, frames: u32) -> Self {
        self.max_idle_frames = frames;
        self
    }
}

// ---------------------------------------------------------------------------
// Watchdog
// ---------------------------------------------------------------------------

/// Liveness monitoring for committed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// A frame without a ping for longer than this is declared hung.
    pub timeout: Duration,
    /// How often the timer thread scans for hung frames.
    pub poll_interval: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from_frame_interval(Duration::from_micros(16_667), 8)
    }
}

impl WatchdogSettings {
    /// Timeout of `interval * safety_factor`, scanned four times per timeout.
    #[must_use]
    pub fn from_frame_interval(interval: Duration, safety_factor: u32) -> Self {
        let timeout = interval * safety_factor.max(1);
        Self {
            timeout,
            poll_interval: (timeout / 4).max(Duration::from_millis(1)),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.timeout.is_zero() {
            return Err(SettingsError::ZeroDuration("timeout"));
        }
        if self.poll_interval.is_zero() {
            return Err(SettingsError::ZeroDuration("poll_interval"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Top-level configuration of a [`FrameScheduler`](crate::frame::FrameScheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Maximum number of frames between `begin_frame` and completion.
    pub frames_in_flight: usize,
    pub arena: ArenaSettings,
    pub pool: PoolSettings,
    /// `None` disables hang detection.
    pub watchdog: Option<WatchdogSettings>,
    /// Upper bound on how long a blocked `begin_frame` sleeps before it
    /// re-checks for hung frames to retire.
    pub admission_poll: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            arena: ArenaSettings::default(),
            pool: PoolSettings::default(),
            watchdog: None,
            admission_poll: Duration::from_millis(5),
        }
    }
}

impl SchedulerSettings {
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    #[must_use]
    pub fn with_arena(mut self, arena: ArenaSettings) -> Self {
        self.arena = arena;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_watchdog(mut self, watchdog: WatchdogSettings) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.frames_in_flight == 0 {
            return Err(SettingsError::NoFramesInFlight);
        }
        if self.admission_poll.is_zero() {
            return Err(SettingsError::ZeroDuration("admission_poll"));
        }
        self.arena.validate()?;
        if let Some(watchdog) = &self.watchdog {
            watchdog.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(SchedulerSettings::default().frames_in_flight, 3);
        assert!(SchedulerSettings::default().validate().is_ok());
        assert!(
            SchedulerSettings::default()
                .with_watchdog(WatchdogSettings::default())
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn rejects_bad_values() {
        let s = SchedulerSettings::default().with_frames_in_flight(0);
        assert_eq!(s.validate(), Err(SettingsError::NoFramesInFlight));

        let s = SchedulerSettings::default().with_arena(ArenaSettings::default().with_alignment(24));
        assert_eq!(s.validate(), Err(SettingsError::BadAlignment(24)));

        let s = SchedulerSettings::default()
            .with_watchdog(WatchdogSettings::default().with_timeout(Duration::ZERO));
        assert_eq!(s.validate(), Err(SettingsError::ZeroDuration("timeout")));
    }

    #[test]
    fn watchdog_timeout_scales_with_frame_interval() {
        let w = WatchdogSettings::from_frame_interval(Duration::from_millis(10), 3);
        assert_eq!(w.timeout, Duration::from_millis(30));
        assert!(w.poll_interval < w.timeout);
    }
}
