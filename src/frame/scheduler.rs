//! Frame Scheduler
//!
//! Admits at most N frames at a time and drives each one from
//! `begin_frame` to the release of its resources.
//!
//! # Threads
//!
//! | Thread | Calls | Mutates |
//! |--------|-------|---------|
//! | Producer (one at a time) | `begin_frame`, `commit_frame`, `abort_frame`, `poll` | tickets, graphs, arena/pool during resolve |
//! | Device callbacks (any) | stream completion | frame table, arena/pool during release |
//! | Watchdog timer | `scan` | watchdog entries; sends hangs to a channel |
//!
//! Arena and pool are each behind a mutex shared by the producer and the
//! completion path, always locked in that order. The frame table has its
//! own mutex and is never held across an arena/pool lock or a device call.
//!
//! # Hang Retirement
//!
//! The watchdog thread never retires frames itself. Its sink pushes each
//! [`HangDetected`] into a channel and wakes the producer; the producer
//! drains that channel in [`FrameScheduler::poll`] (which `begin_frame` runs
//! before every admission attempt) and retires the frame: resources are
//! released, the slot is freed and [`FrameFault::Hang`] goes out on the
//! fault channel. A completion that arrives for a frame already retired as
//! hung is logged and ignored.
//!
//! # Partial Submission
//!
//! A frame with an async stream submits it first. If that succeeds and the
//! primary submission then fails, `commit_frame` returns the device error
//! but the frame stays in flight until the async stream completes (or is
//! declared hung), because the device may still be executing it. No second
//! fault is reported for it.
//!
//! The async stream may wait on primary fence values that only the rejected
//! primary stream would have signalled. Those values are signalled instead by
//! a small recovery stream submitted right after the failure, so the async
//! stream drains and the frame retires without a watchdog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::device::{CompletionCallback, Device, StreamHandle};
use crate::errors::{
    DeviceError, FrameFault, GraphConsistencyError, HangDetected, PoolError, Result,
    SchedulingError,
};
use crate::frame::FrameId;
use crate::frame::arena::{ArenaStats, ResourceArena};
use crate::frame::fence::Fence;
use crate::frame::graph::{
    EncodeContext, Pass, PassGraph, PassKind, ResolvedResources, ResourceDesc, ResourceHandle,
    SlotFences,
};
use crate::frame::pool::{BufferPool, PoolStats, PooledBuffer};
use crate::frame::watchdog::{Watchdog, WatchdogPinger};
use crate::settings::SchedulerSettings;
use crate::utils::interner::ResourceName;
use crate::utils::time::{Clock, SystemClock};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Admission
// ============================================================================

/// Counting semaphore over N numbered slots.
struct AdmissionGate {
    free: Mutex<Vec<usize>>,
    released: Condvar,
    aborted: AtomicU64,
}

impl AdmissionGate {
    fn new(slots: usize) -> Self {
        Self {
            free: Mutex::new((0..slots).rev().collect()),
            released: Condvar::new(),
            aborted: AtomicU64::new(0),
        }
    }

    fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let slot = self.free.lock().pop()?;
        Some(AdmissionPermit {
            gate: Arc::clone(self),
            slot,
        })
    }

    /// Waits up to `timeout` for a slot. May return early on a wake-up.
    fn acquire_for(self: &Arc<Self>, timeout: Duration) -> Option<AdmissionPermit> {
        let mut free = self.free.lock();
        if free.is_empty() {
            self.released.wait_for(&mut free, timeout);
        }
        let slot = free.pop()?;
        Some(AdmissionPermit {
            gate: Arc::clone(self),
            slot,
        })
    }

    fn wake(&self) {
        self.released.notify_all();
    }

    fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// One occupied admission slot. Dropping it frees the slot.
struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
    slot: usize,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.free.lock().push(self.slot);
        self.gate.released.notify_all();
    }
}

// ============================================================================
// Tickets
// ============================================================================

/// Admission token of one frame, bound to that frame's empty [`PassGraph`].
///
/// Dropping a ticket without committing it aborts the frame.
pub struct FrameTicket {
    id: FrameId,
    scheduler: u64,
    graph: PassGraph,
    permit: Option<AdmissionPermit>,
}

impl FrameTicket {
    #[inline]
    #[must_use]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Admission slot held by this frame, in `0..frames_in_flight`.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.permit.as_ref().map_or(usize::MAX, |p| p.slot)
    }

    #[must_use]
    pub fn graph(&self) -> &PassGraph {
        &self.graph
    }

    pub fn add(&mut self, pass: Pass) -> std::result::Result<(), GraphConsistencyError> {
        self.graph.add(pass)
    }

    pub fn add_pass<R, W, F>(
        &mut self,
        name: &str,
        kind: PassKind,
        reads: R,
        writes: W,
        encode: F,
    ) -> std::result::Result<(), GraphConsistencyError>
    where
        R: IntoIterator,
        R::Item: Into<ResourceName>,
        W: IntoIterator,
        W::Item: Into<ResourceDesc>,
        F: FnOnce(&mut EncodeContext<'_>) + Send + 'static,
    {
        self.graph.add_pass(name, kind, reads, writes, encode)
    }

    pub fn import(
        &mut self,
        name: impl Into<ResourceName>,
        handle: ResourceHandle,
    ) -> std::result::Result<(), GraphConsistencyError> {
        self.graph.import(name, handle)
    }
}

impl Drop for FrameTicket {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.gate.aborted.fetch_add(1, Ordering::Relaxed);
            log::debug!("frame {}: aborted, slot {} returned", self.id, permit.slot);
        }
    }
}

impl std::fmt::Debug for FrameTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTicket")
            .field("id", &self.id)
            .field("slot", &self.slot())
            .field("passes", &self.graph.len())
            .finish()
    }
}

// ============================================================================
// In-flight bookkeeping
// ============================================================================

struct InFlightFrame {
    permit: AdmissionPermit,
    resources: ResolvedResources,
    pending_streams: usize,
    failure: Option<DeviceError>,
    /// The failure was already returned from `commit_frame`.
    reported: bool,
}

#[derive(Default)]
struct FrameTable {
    frames: FxHashMap<FrameId, InFlightFrame>,
    /// Frames removed from `frames` whose resources are still being released.
    retiring: usize,
}

impl FrameTable {
    fn outstanding(&self) -> usize {
        self.frames.len() + self.retiring
    }
}

/// Which slot fence a stream signals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Lane {
    Primary,
    Async,
}

enum Retirement {
    Completed,
    Hung(HangDetected),
    Abandoned,
}

#[derive(Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    hung: AtomicU64,
}

/// Scheduler counters, cumulative since construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SchedulerStats {
    pub begun: u64,
    pub committed: u64,
    /// Tickets dropped or aborted before commit.
    pub aborted: u64,
    /// Commits that returned an error.
    pub rejected: u64,
    pub completed: u64,
    /// Frames whose completion reported a device error.
    pub failed: u64,
    pub hung: u64,
}

struct SchedulerShared {
    id: u64,
    settings: SchedulerSettings,
    device: Arc<dyn Device>,
    arena: Mutex<ResourceArena>,
    pool: Mutex<BufferPool>,
    /// `(primary, async)` fence pair per admission slot.
    fences: Mutex<Vec<(Fence, Fence)>>,
    table: Mutex<FrameTable>,
    idle: Condvar,
    gate: Arc<AdmissionGate>,
    watchdog: Option<Watchdog>,
    faults: flume::Sender<FrameFault>,
    counters: Counters,
}

impl SchedulerShared {
    fn completion(self: &Arc<Self>, frame: FrameId) -> CompletionCallback {
        let shared: Weak<Self> = Arc::downgrade(self);
        Box::new(move |result: std::result::Result<(), DeviceError>| match shared.upgrade() {
            Some(shared) => shared.stream_completed(frame, result),
            None => log::warn!("frame {frame}: completion after scheduler was dropped"),
        })
    }

    fn stream_completed(&self, frame: FrameId, result: std::result::Result<(), DeviceError>) {
        let finished = {
            let mut table = self.table.lock();
            let Some(entry) = table.frames.get_mut(&frame) else {
                log::warn!("frame {frame}: late completion ignored (already retired)");
                return;
            };
            if let Err(error) = result {
                log::error!("frame {frame}: device reported {error}");
                entry.failure.get_or_insert(error);
            }
            entry.pending_streams = entry.pending_streams.saturating_sub(1);
            if entry.pending_streams > 0 {
                return;
            }
            let finished = table.frames.remove(&frame);
            if finished.is_some() {
                table.retiring += 1;
            }
            finished
        };
        if let Some(entry) = finished {
            let cause = if entry.reported {
                Retirement::Abandoned
            } else {
                Retirement::Completed
            };
            self.retire(frame, entry, cause);
        }
    }

    /// Takes a committed frame out of the table for retirement.
    fn take(&self, frame: FrameId) -> Option<InFlightFrame> {
        let mut table = self.table.lock();
        let entry = table.frames.remove(&frame)?;
        table.retiring += 1;
        Some(entry)
    }

    /// Releases everything a frame holds. The entry must already be counted
    /// in `FrameTable::retiring`.
    fn retire(&self, frame: FrameId, entry: InFlightFrame, cause: Retirement) {
        let InFlightFrame {
            permit,
            resources,
            failure,
            ..
        } = entry;
        {
            let mut arena = self.arena.lock();
            let mut pool = self.pool.lock();
            resources.release(&mut arena, &mut pool, self.device.as_ref());
        }
        if let Some(watchdog) = &self.watchdog
            && !matches!(cause, Retirement::Hung(_))
        {
            watchdog.complete(frame);
        }
        let slot = permit.slot;
        drop(permit);

        match (cause, failure) {
            (Retirement::Hung(hang), _) => {
                self.counters.hung.fetch_add(1, Ordering::Relaxed);
                log::error!("frame {frame}: retired as hung, slot {slot} returned");
                self.emit(FrameFault::Hang(hang));
            }
            (Retirement::Completed, Some(error)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.emit(FrameFault::DeviceFault { frame, error });
            }
            (Retirement::Completed, None) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                log::trace!("frame {frame}: completed, slot {slot} returned");
            }
            (Retirement::Abandoned, _) => {
                log::debug!("frame {frame}: partially submitted frame drained");
            }
        }

        self.table.lock().retiring -= 1;
        self.idle.notify_all();
    }

    fn emit(&self, fault: FrameFault) {
        if self.faults.send(fault).is_err() {
            log::warn!("fault channel closed");
        }
    }
}

// ============================================================================
// FrameScheduler
// ============================================================================

/// Bounded-concurrency frame pipeline.
///
/// ```rust,ignore
/// let scheduler = FrameScheduler::new(device, SchedulerSettings::default())?;
/// loop {
///     let mut ticket = scheduler.begin_frame();
///     ticket.add(Pass::compute("simulate").write("field", 4096).encode(simulate))?;
///     ticket.add(Pass::render("draw").read("field").encode(draw))?;
///     scheduler.commit_frame(ticket)?;
///     for fault in scheduler.faults().try_iter() {
///         recover(fault);
///     }
/// }
/// ```
pub struct FrameScheduler {
    shared: Arc<SchedulerShared>,
    hangs: flume::Receiver<HangDetected>,
    faults: flume::Receiver<FrameFault>,
    next_frame: AtomicU64,
}

impl FrameScheduler {
    /// Creates a scheduler whose watchdog (if configured) uses wall-clock time.
    pub fn new(device: Arc<dyn Device>, settings: SchedulerSettings) -> Result<Self> {
        Self::with_clock(device, settings, Arc::new(SystemClock::new()))
    }

    /// Creates a scheduler whose watchdog measures time with `clock`.
    pub fn with_clock(
        device: Arc<dyn Device>,
        settings: SchedulerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        let arena = ResourceArena::new(device.as_ref(), settings.arena)?;
        let fences = (0..settings.frames_in_flight)
            .map(|_| -> std::result::Result<(Fence, Fence), DeviceError> {
                Ok((Fence::new(device.as_ref())?, Fence::new(device.as_ref())?))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let gate = Arc::new(AdmissionGate::new(settings.frames_in_flight));
        let (hang_tx, hangs) = flume::unbounded();
        let (fault_tx, faults) = flume::unbounded();

        let watchdog = match settings.watchdog {
            Some(watchdog) => {
                let wake = Arc::clone(&gate);
                Some(Watchdog::spawn(clock, watchdog.poll_interval, move |hang| {
                    if hang_tx.send(hang).is_ok() {
                        wake.wake();
                    }
                })?)
            }
            None => None,
        };

        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "scheduler {id}: {} frames in flight, arena {} bytes, watchdog {:?}",
            settings.frames_in_flight,
            settings.arena.capacity,
            settings.watchdog.map(|w| w.timeout)
        );

        Ok(Self {
            shared: Arc::new(SchedulerShared {
                id,
                settings,
                device,
                arena: Mutex::new(arena),
                pool: Mutex::new(BufferPool::new(settings.pool)),
                fences: Mutex::new(fences),
                table: Mutex::new(FrameTable::default()),
                idle: Condvar::new(),
                gate,
                watchdog,
                faults: fault_tx,
                counters: Counters::default(),
            }),
            hangs,
            faults,
            next_frame: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    // ── Admission ──────────────────────────────────────────────────────────

    /// Blocks until fewer than N frames are outstanding, then returns a
    /// ticket with an empty graph.
    pub fn begin_frame(&self) -> FrameTicket {
        loop {
            self.poll();
            if let Some(permit) = self.shared.gate.acquire_for(self.shared.settings.admission_poll)
            {
                return self.issue(permit);
            }
        }
    }

    /// Returns a ticket only if a slot is free right now.
    pub fn try_begin_frame(&self) -> Option<FrameTicket> {
        self.poll();
        self.shared.gate.try_acquire().map(|permit| self.issue(permit))
    }

    /// Like [`begin_frame`](Self::begin_frame), giving up after `timeout`.
    pub fn begin_frame_timeout(&self, timeout: Duration) -> Option<FrameTicket> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(self.shared.settings.admission_poll);
            if let Some(permit) = self.shared.gate.acquire_for(wait) {
                return Some(self.issue(permit));
            }
            if remaining.is_zero() {
                return None;
            }
        }
    }

    fn issue(&self, permit: AdmissionPermit) -> FrameTicket {
        let id = FrameId(self.next_frame.fetch_add(1, Ordering::Relaxed));
        self.shared.counters.begun.fetch_add(1, Ordering::Relaxed);
        self.shared.pool.lock().end_frame(self.shared.device.as_ref());
        log::trace!("frame {id}: admitted in slot {}", permit.slot);
        FrameTicket {
            id,
            scheduler: self.shared.id,
            graph: PassGraph::new(),
            permit: Some(permit),
        }
    }

    /// Appends a pass to the ticket's graph.
    pub fn add_pass<R, W, F>(
        &self,
        ticket: &mut FrameTicket,
        name: &str,
        kind: PassKind,
        reads: R,
        writes: W,
        encode: F,
    ) -> std::result::Result<(), GraphConsistencyError>
    where
        R: IntoIterator,
        R::Item: Into<ResourceName>,
        W: IntoIterator,
        W::Item: Into<ResourceDesc>,
        F: FnOnce(&mut EncodeContext<'_>) + Send + 'static,
    {
        ticket.add_pass(name, kind, reads, writes, encode)
    }

    /// Discards the ticket's graph and frees its slot without submitting.
    pub fn abort_frame(&self, ticket: FrameTicket) {
        drop(ticket);
    }

    // ── Commit ─────────────────────────────────────────────────────────────

    /// Validates, resolves, encodes and submits the ticket's frame.
    ///
    /// On error nothing of the frame remains allocated once its submitted
    /// streams (if any, see the module docs) have drained, and its slot is
    /// free again.
    pub fn commit_frame(&self, ticket: FrameTicket) -> Result<()> {
        let result = self.commit(ticket);
        match &result {
            Ok(()) => self.shared.counters.committed.fetch_add(1, Ordering::Relaxed),
            Err(e) => {
                log::debug!("commit rejected: {e}");
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed)
            }
        };
        result
    }

    fn commit(&self, mut ticket: FrameTicket) -> Result<()> {
        let frame = ticket.id;
        if ticket.scheduler != self.shared.id {
            return Err(SchedulingError::StaleTicket(frame));
        }
        let Some(permit) = ticket.permit.take() else {
            return Err(SchedulingError::StaleTicket(frame));
        };
        let graph = std::mem::take(&mut ticket.graph);
        drop(ticket);

        let shared = &self.shared;
        let device = shared.device.as_ref();

        graph.validate()?;
        let resources = {
            let mut arena = shared.arena.lock();
            let mut pool = shared.pool.lock();
            graph.resolve(frame, &mut arena, &mut pool, device)?
        };

        let slot = permit.slot;
        if let (Some(watchdog), Some(settings)) = (&shared.watchdog, shared.settings.watchdog) {
            watchdog.register(frame, slot, settings.timeout);
        }

        let (signaled_before, encoded) = {
            let mut fences = shared.fences.lock();
            let (primary, async_compute) = &mut fences[slot];
            let before = [primary.last_signaled(), async_compute.last_signaled()];
            let watchdog = shared.watchdog.as_ref();
            let encoded = graph.encode(
                frame,
                &resources,
                device,
                SlotFences {
                    primary,
                    async_compute,
                },
                &mut |_| {
                    if let Some(watchdog) = watchdog {
                        watchdog.ping(frame);
                    }
                },
            );
            (before, encoded)
        };
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(error) => {
                self.unwind(frame, permit, resources);
                return Err(error.into());
            }
        };

        let mut streams: SmallVec<[(Lane, StreamHandle); 2]> = SmallVec::new();
        streams.extend(encoded.async_stream.map(|stream| (Lane::Async, stream)));
        streams.push((Lane::Primary, encoded.primary));

        shared.table.lock().frames.insert(
            frame,
            InFlightFrame {
                permit,
                resources,
                pending_streams: streams.len(),
                failure: None,
                reported: false,
            },
        );

        for (index, &(_, stream)) in streams.iter().enumerate() {
            if let Err(error) = device.submit(stream, shared.completion(frame)) {
                log::error!("frame {frame}: submission failed: {error}");
                for &(_, unsubmitted) in &streams[index + 1..] {
                    device.discard_stream(unsubmitted);
                }
                if index > 0 {
                    let lost: SmallVec<[Lane; 2]> =
                        streams[index..].iter().map(|&(lane, _)| lane).collect();
                    self.release_waits(frame, slot, &lost, signaled_before);
                }
                self.abandon(frame, streams.len() - index);
                return Err(error.into());
            }
        }
        log::trace!(
            "frame {frame}: submitted ({} signals, {} waits)",
            encoded.signals,
            encoded.waits
        );
        Ok(())
    }

    /// Rolls back a frame that never reached the table.
    fn unwind(&self, frame: FrameId, permit: AdmissionPermit, resources: ResolvedResources) {
        let shared = &self.shared;
        {
            let mut arena = shared.arena.lock();
            let mut pool = shared.pool.lock();
            resources.release(&mut arena, &mut pool, shared.device.as_ref());
        }
        if let Some(watchdog) = &shared.watchdog {
            watchdog.cancel(frame);
        }
        drop(permit);
    }

    /// Submits a stream that raises the fences of `lost` lanes to the
    /// values their unsubmitted streams would have signalled, so submitted
    /// streams waiting on them can still drain.
    fn release_waits(&self, frame: FrameId, slot: usize, lost: &[Lane], before: [u64; 2]) {
        let device = self.shared.device.as_ref();
        let mut fences = self.shared.fences.lock();
        let (primary, async_compute) = &mut fences[slot];

        let raise_primary = lost.contains(&Lane::Primary) && primary.last_signaled() > before[0];
        let raise_async = lost.contains(&Lane::Async) && async_compute.last_signaled() > before[1];
        if !raise_primary && !raise_async {
            return;
        }

        let stream = match device.create_command_stream(&format!("frame {frame} recovery")) {
            Ok(stream) => stream,
            Err(error) => {
                log::error!("frame {frame}: cannot release fence waits: {error}");
                return;
            }
        };
        for (raise, fence) in [(raise_primary, primary), (raise_async, async_compute)] {
            if raise {
                let value = fence.last_signaled();
                if let Err(error) = fence.signal(device, stream, value) {
                    log::error!("frame {frame}: {error}");
                }
            }
        }
        let completion: CompletionCallback = Box::new(move |result| {
            if let Err(error) = result {
                log::error!("frame {frame}: recovery stream failed: {error}");
            }
        });
        match device.submit(stream, completion) {
            Ok(()) => log::debug!("frame {frame}: submitted recovery signals"),
            Err(error) => log::error!("frame {frame}: cannot release fence waits: {error}"),
        }
    }

    /// Handles a failed submission: `unsubmitted` streams will never complete.
    fn abandon(&self, frame: FrameId, unsubmitted: usize) {
        let shared = &self.shared;
        let finished = {
            let mut table = shared.table.lock();
            let Some(entry) = table.frames.get_mut(&frame) else {
                return;
            };
            entry.reported = true;
            entry.pending_streams = entry.pending_streams.saturating_sub(unsubmitted);
            if entry.pending_streams > 0 {
                return;
            }
            let finished = table.frames.remove(&frame);
            if finished.is_some() {
                table.retiring += 1;
            }
            finished
        };
        if let Some(entry) = finished {
            shared.retire(frame, entry, Retirement::Abandoned);
        }
    }

    // ── Progress ───────────────────────────────────────────────────────────

    /// Retires every frame the watchdog has declared hung. Returns how many
    /// were retired.
    pub fn poll(&self) -> usize {
        let mut retired = 0;
        for hang in self.hangs.try_iter() {
            match self.shared.take(hang.frame) {
                Some(entry) => {
                    self.shared.retire(hang.frame, entry, Retirement::Hung(hang));
                    retired += 1;
                }
                None => log::debug!("frame {}: hang raced with completion", hang.frame),
            }
        }
        retired
    }

    /// Resets the watchdog timeout of a committed frame.
    pub fn ping(&self, frame: FrameId) -> bool {
        self.shared
            .watchdog
            .as_ref()
            .is_some_and(|watchdog| watchdog.ping(frame))
    }

    /// A cloneable handle for pinging from device or worker threads.
    #[must_use]
    pub fn pinger(&self) -> FramePinger {
        FramePinger {
            watchdog: self.shared.watchdog.as_ref().map(Watchdog::pinger),
        }
    }

    /// Asynchronous faults of committed frames.
    #[must_use]
    pub fn faults(&self) -> flume::Receiver<FrameFault> {
        self.faults.clone()
    }

    #[must_use]
    pub fn watchdog(&self) -> Option<&Watchdog> {
        self.shared.watchdog.as_ref()
    }

    /// Frames committed and not yet retired.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.table.lock().outstanding()
    }

    /// Tickets currently outstanding (begun and not yet retired or aborted).
    #[must_use]
    pub fn outstanding_tickets(&self) -> usize {
        self.shared.settings.frames_in_flight - self.shared.gate.available()
    }

    /// Blocks until every committed frame has been retired.
    pub fn wait_idle(&self) {
        while !self.wait_idle_timeout(self.shared.settings.admission_poll) {}
    }

    /// Like [`wait_idle`](Self::wait_idle), giving up after `timeout`.
    /// Returns `true` if the scheduler became idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            let mut table = self.shared.table.lock();
            if table.outstanding() == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.shared
                .idle
                .wait_for(&mut table, remaining.min(self.shared.settings.admission_poll));
        }
    }

    // ── Pool access ────────────────────────────────────────────────────────

    /// Checks a buffer out of the scheduler's pool for caller-managed reuse.
    pub fn acquire_buffer(&self, size: u64) -> std::result::Result<PooledBuffer, DeviceError> {
        self.shared
            .pool
            .lock()
            .acquire(self.shared.device.as_ref(), size)
    }

    pub fn release_buffer(&self, buffer: PooledBuffer) -> std::result::Result<(), PoolError> {
        self.shared
            .pool
            .lock()
            .release(self.shared.device.as_ref(), buffer)
    }

    // ── Statistics ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn arena_stats(&self) -> ArenaStats {
        self.shared.arena.lock().stats()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.lock().stats()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            begun: c.begun.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            aborted: self.shared.gate.aborted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            hung: c.hung.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            log::warn!("scheduler {} dropped with {in_flight} frames in flight", self.shared.id);
        }
    }
}

/// Cloneable, `Send` ping handle. Inert when no watchdog is configured.
#[derive(Clone, Debug)]
pub struct FramePinger {
    watchdog: Option<WatchdogPinger>,
}

impl FramePinger {
    pub fn ping(&self, frame: FrameId) -> bool {
        self.watchdog.as_ref().is_some_and(|w| w.ping(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::errors::ArenaExhausted;
    use crate::settings::ArenaSettings;

    fn scheduler(frames: usize) -> (Arc<HeadlessDevice>, FrameScheduler) {
        let device = Arc::new(HeadlessDevice::new());
        let scheduler = FrameScheduler::new(
            device.clone(),
            SchedulerSettings::default().with_frames_in_flight(frames),
        )
        .unwrap();
        (device, scheduler)
    }

    #[test]
    fn slots_are_handed_out_and_returned() {
        let (device, scheduler) = scheduler(2);
        let a = scheduler.try_begin_frame().unwrap();
        let b = scheduler.try_begin_frame().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(scheduler.try_begin_frame().is_none());

        scheduler.commit_frame(a).unwrap();
        assert!(scheduler.try_begin_frame().is_none());
        assert_eq!(device.run_fifo(), 1);
        assert!(scheduler.try_begin_frame().is_some());
        drop(b);
        assert_eq!(scheduler.outstanding_tickets(), 0);
    }

    #[test]
    fn dropped_ticket_counts_as_abort() {
        let (device, scheduler) = scheduler(1);
        let mut ticket = scheduler.begin_frame();
        ticket.add(Pass::compute("a").write("x", 64)).unwrap();
        drop(ticket);

        assert_eq!(scheduler.stats().aborted, 1);
        assert_eq!(device.stats().submitted, 0);
        assert!(scheduler.try_begin_frame().is_some());
    }

    #[test]
    fn ticket_from_another_scheduler_is_stale() {
        let (_d1, first) = scheduler(1);
        let (_d2, second) = scheduler(1);
        let ticket = first.begin_frame();
        let id = ticket.id();

        assert_eq!(second.commit_frame(ticket), Err(SchedulingError::StaleTicket(id)));
        assert!(first.try_begin_frame().is_some());
    }

    #[test]
    fn resources_are_held_until_completion() {
        let (device, scheduler) = scheduler(3);
        let mut ticket = scheduler.begin_frame();
        ticket.add(Pass::compute("a").write("x", 1024)).unwrap();
        ticket.add(Pass::render("b").read("x")).unwrap();
        scheduler.commit_frame(ticket).unwrap();

        assert_eq!(scheduler.arena_stats().live_allocations, 1);
        assert_eq!(scheduler.in_flight(), 1);

        device.run_fifo();
        assert_eq!(scheduler.arena_stats().live_allocations, 0);
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[test]
    fn arena_exhaustion_rejects_and_frees_the_slot() {
        let device = Arc::new(HeadlessDevice::new());
        let scheduler = FrameScheduler::new(
            device.clone(),
            SchedulerSettings::default()
                .with_frames_in_flight(1)
                .with_arena(ArenaSettings::default().with_capacity(256)),
        )
        .unwrap();

        let mut ticket = scheduler.begin_frame();
        ticket.add(Pass::compute("big").write("x", 4096)).unwrap();
        let err = scheduler.commit_frame(ticket).unwrap_err();

        assert_eq!(
            err,
            SchedulingError::Arena(ArenaExhausted {
                requested: 4096,
                largest_free: 256,
                capacity: 256,
            })
        );
        assert_eq!(scheduler.stats().rejected, 1);
        assert!(scheduler.try_begin_frame().is_some());
    }
}
