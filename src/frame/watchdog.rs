//! Watchdog
//!
//! Liveness monitor for committed frames.
//!
//! # State Machine
//!
//! ```text
//!              ping (resets clock)
//!               ┌─────┐
//!               ▼     │
//!  register ─► Submitted ──── complete ────► Completed
//!                 │
//!                 └── silent > timeout ────► Hung
//! ```
//!
//! Both terminal states remove the entry. `Hung` is reported through the
//! sink given at construction; the watchdog never retries, resubmits or
//! touches frame resources. Acting on a hang is the owner's job.
//!
//! # Threading
//!
//! [`Watchdog::spawn`] starts a timer thread that calls [`Watchdog::scan`]
//! every poll interval. [`Watchdog::new`] starts none, which lets tests call
//! `scan` themselves against a [`ManualClock`](crate::utils::time::ManualClock).
//! The sink runs on whichever thread scans, without the watchdog lock held.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::{HangDetected, SchedulingError};
use crate::frame::FrameId;
use crate::utils::time::Clock;

/// Terminal states kept for [`Watchdog::state`] queries.
const HISTORY_LEN: usize = 256;

type HangSink = Box<dyn Fn(HangDetected) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WatchdogState {
    Submitted,
    Completed,
    Hung,
}

/// A frame being watched.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WatchdogEntry {
    pub frame: FrameId,
    pub slot: usize,
    pub submit_time: Duration,
    pub last_ping_time: Duration,
    pub timeout: Duration,
    pub pings: u64,
}

#[derive(Default)]
struct WatchdogInner {
    entries: FxHashMap<FrameId, WatchdogEntry>,
    history: VecDeque<(FrameId, WatchdogState)>,
    hangs: u64,
    shutdown: bool,
}

impl WatchdogInner {
    fn finish(&mut self, frame: FrameId, state: WatchdogState) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((frame, state));
    }
}

struct WatchdogShared {
    inner: Mutex<WatchdogInner>,
    wake: Condvar,
    clock: Arc<dyn Clock>,
    sink: HangSink,
}

impl WatchdogShared {
    fn ping(&self, frame: FrameId) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&frame) {
            Some(entry) => {
                entry.last_ping_time = now;
                entry.pings += 1;
                true
            }
            None => false,
        }
    }

    fn scan(&self) -> usize {
        let now = self.clock.now();
        let hung: SmallVec<[HangDetected; 4]> = {
            let mut inner = self.inner.lock();
            let hung: SmallVec<[HangDetected; 4]> = inner
                .entries
                .values()
                .filter(|e| now.saturating_sub(e.last_ping_time) > e.timeout)
                .map(|e| HangDetected {
                    frame: e.frame,
                    slot: e.slot,
                    silent_for: now.saturating_sub(e.last_ping_time),
                    timeout: e.timeout,
                })
                .collect();
            for hang in &hung {
                inner.entries.remove(&hang.frame);
                inner.finish(hang.frame, WatchdogState::Hung);
                inner.hangs += 1;
            }
            hung
        };

        for hang in &hung {
            log::error!("watchdog: {hang}");
            (self.sink)(*hang);
        }
        hung.len()
    }
}

/// Per-frame liveness timeouts.
pub struct Watchdog {
    shared: Arc<WatchdogShared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Creates a watchdog without a timer thread. Hangs are only detected
    /// when [`scan`](Self::scan) is called.
    pub fn new(clock: Arc<dyn Clock>, sink: impl Fn(HangDetected) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(WatchdogShared {
                inner: Mutex::new(WatchdogInner::default()),
                wake: Condvar::new(),
                clock,
                sink: Box::new(sink),
            }),
            thread: None,
        }
    }

    /// Creates a watchdog whose timer thread scans every `poll_interval`.
    pub fn spawn(
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        sink: impl Fn(HangDetected) + Send + Sync + 'static,
    ) -> Result<Self, SchedulingError> {
        let mut watchdog = Self::new(clock, sink);
        let shared = Arc::clone(&watchdog.shared);
        let thread = std::thread::Builder::new()
            .name("kairos-watchdog".into())
            .spawn(move || {
                loop {
                    {
                        let mut inner = shared.inner.lock();
                        if !inner.shutdown {
                            shared.wake.wait_for(&mut inner, poll_interval);
                        }
                        if inner.shutdown {
                            break;
                        }
                    }
                    shared.scan();
                }
            })
            .map_err(|e| SchedulingError::WatchdogSpawn(e.to_string()))?;
        watchdog.thread = Some(thread);
        log::debug!("watchdog: timer thread started ({poll_interval:?} poll)");
        Ok(watchdog)
    }

    /// Starts watching `frame`. The timeout clock starts now.
    pub fn register(&self, frame: FrameId, slot: usize, timeout: Duration) {
        let now = self.shared.clock.now();
        let mut inner = self.shared.inner.lock();
        let previous = inner.entries.insert(
            frame,
            WatchdogEntry {
                frame,
                slot,
                submit_time: now,
                last_ping_time: now,
                timeout,
                pings: 0,
            },
        );
        if previous.is_some() {
            log::warn!("watchdog: frame {frame} registered twice");
        }
    }

    /// Resets the timeout clock of `frame`. Returns `false` if the frame is
    /// not being watched (never registered, completed, or already hung).
    pub fn ping(&self, frame: FrameId) -> bool {
        self.shared.ping(frame)
    }

    /// Marks `frame` completed. Returns `false` if it was not being watched,
    /// in particular if it was declared hung first.
    pub fn complete(&self, frame: FrameId) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.entries.remove(&frame).is_some() {
            inner.finish(frame, WatchdogState::Completed);
            true
        } else {
            false
        }
    }

    /// Stops watching a frame that never reached the device. Nothing is
    /// recorded in the history, so `state` reports it as never registered.
    pub fn cancel(&self, frame: FrameId) -> bool {
        self.shared.inner.lock().entries.remove(&frame).is_some()
    }

    /// Runs one detection pass. Returns the number of frames declared hung.
    pub fn scan(&self) -> usize {
        self.shared.scan()
    }

    /// `None` if the frame was never registered or has fallen out of history.
    #[must_use]
    pub fn state(&self, frame: FrameId) -> Option<WatchdogState> {
        let inner = self.shared.inner.lock();
        if inner.entries.contains_key(&frame) {
            return Some(WatchdogState::Submitted);
        }
        inner
            .history
            .iter()
            .rev()
            .find(|(f, _)| *f == frame)
            .map(|(_, state)| *state)
    }

    #[must_use]
    pub fn entry(&self, frame: FrameId) -> Option<WatchdogEntry> {
        self.shared.inner.lock().entries.get(&frame).copied()
    }

    /// Number of frames currently watched.
    #[must_use]
    pub fn active(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    /// Frames declared hung since construction.
    #[must_use]
    pub fn hangs_detected(&self) -> u64 {
        self.shared.inner.lock().hangs
    }

    /// A `Send` handle for pinging from other threads.
    #[must_use]
    pub fn pinger(&self) -> WatchdogPinger {
        WatchdogPinger {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.inner.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("watchdog thread panicked");
        }
    }
}

/// Cloneable ping handle. Pings after the watchdog is dropped return `false`.
#[derive(Clone)]
pub struct WatchdogPinger {
    shared: Weak<WatchdogShared>,
}

impl WatchdogPinger {
    pub fn ping(&self, frame: FrameId) -> bool {
        self.shared.upgrade().is_some_and(|shared| shared.ping(frame))
    }
}

impl std::fmt::Debug for WatchdogPinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogPinger").finish_non_exhaustive()
    }
}
