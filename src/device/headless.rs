//! Headless Device
//!
//! A CPU implementation of [`Device`] that records command streams as lists
//! of closures and fence operations, and executes them only when driven.
//!
//! # Execution Model
//!
//! ```text
//!  record()/encode_*()        submit()              run_*() / driver thread
//! ┌──────────────────┐     ┌────────────────┐     ┌────────────────────────┐
//! │ recording streams│ ──► │ submission FIFO│ ──► │ interleave runnable    │
//! │  Work/Signal/Wait│     │                │     │ streams, call completion│
//! └──────────────────┘     └────────────────┘     └────────────────────────┘
//! ```
//!
//! A submitted stream is *runnable* unless its next command is a `Wait` on a
//! fence that has not reached the awaited value. Drivers pick among runnable
//! streams one command at a time:
//!
//! - [`run_fifo`](HeadlessDevice::run_fifo): always the oldest runnable stream.
//! - [`run_shuffled`](HeadlessDevice::run_shuffled): a seeded random runnable
//!   stream, so the only ordering left across streams is the one fences impose.
//! - [`spawn_driver`](HeadlessDevice::spawn_driver): a background thread that
//!   drains submissions FIFO, giving genuinely asynchronous completions.
//!
//! Streams that stay blocked remain queued; a frame that never completes is
//! simply a frame whose streams are never driven.
//!
//! Completion callbacks are always invoked without any device lock held.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::{
    ArenaBackingHandle, BufferHandle, CompletionCallback, Device, FenceHandle, StreamHandle,
};
use crate::errors::DeviceError;

/// One recorded command.
pub enum HeadlessCommand {
    /// Arbitrary CPU work standing in for GPU commands.
    Work(Box<dyn FnOnce() + Send>),
    /// Raise `fence` to at least `value`.
    Signal { fence: FenceHandle, value: u64 },
    /// Block this stream until `fence >= value`.
    Wait { fence: FenceHandle, value: u64 },
}

impl std::fmt::Debug for HeadlessCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Work(_) => f.write_str("Work"),
            Self::Signal { fence, value } => write!(f, "Signal({fence:?} -> {value})"),
            Self::Wait { fence, value } => write!(f, "Wait({fence:?} >= {value})"),
        }
    }
}

/// Counters exposed for assertions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessStats {
    pub streams_created: u64,
    pub submitted: u64,
    pub completed: u64,
    pub discarded: u64,
    pub commands_executed: u64,
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub fences_created: u64,
}

struct Recording {
    label: String,
    commands: VecDeque<HeadlessCommand>,
}

struct Submission {
    label: String,
    commands: VecDeque<HeadlessCommand>,
    completion: CompletionCallback,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    recording: FxHashMap<StreamHandle, Recording>,
    queue: VecDeque<Submission>,
    fences: FxHashMap<FenceHandle, u64>,
    buffers: FxHashMap<BufferHandle, u64>,
    backing: FxHashMap<ArenaBackingHandle, u64>,
    bytes_allocated: u64,
    /// Submissions to let through before failing one, and the error to fail it with.
    fail_submit: Option<(usize, DeviceError)>,
    lost: bool,
    shutdown: bool,
    stats: HeadlessStats,
}

impl HeadlessState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn reserve(&mut self, bytes: u64, limit: Option<u64>) -> Result<(), DeviceError> {
        if self.lost {
            return Err(DeviceError::Lost);
        }
        let total = self.bytes_allocated.saturating_add(bytes);
        if limit.is_some_and(|limit| total > limit) {
            return Err(DeviceError::OutOfMemory(bytes));
        }
        self.bytes_allocated = total;
        Ok(())
    }

    fn is_runnable(&self, submission: &Submission) -> bool {
        match submission.commands.front() {
            Some(HeadlessCommand::Wait { fence, value }) => {
                self.lost || self.fences.get(fence).copied().unwrap_or(0) >= *value
            }
            _ => true,
        }
    }
}

/// CPU-backed device for tests and GPU-less execution.
pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
    submitted: Condvar,
    memory_limit: Option<u64>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Creates a device with unlimited memory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeadlessState::default()),
            submitted: Condvar::new(),
            memory_limit: None,
        }
    }

    /// Creates a device whose buffers and backing stores may not exceed
    /// `bytes` in total.
    #[must_use]
    pub fn with_memory_limit(bytes: u64) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Self::new()
        }
    }

    // ── Recording ──────────────────────────────────────────────────────────

    /// Records CPU work into a stream that is still being recorded.
    pub fn record(&self, stream: StreamHandle, work: impl FnOnce() + Send + 'static) {
        self.record_command(stream, HeadlessCommand::Work(Box::new(work)));
    }

    /// Records a raw command.
    pub fn record_command(&self, stream: StreamHandle, command: HeadlessCommand) {
        let mut state = self.state.lock();
        match state.recording.get_mut(&stream) {
            Some(recording) => recording.commands.push_back(command),
            None => log::warn!("headless: {command:?} recorded into unknown stream {stream:?}"),
        }
    }

    // ── Fault injection ────────────────────────────────────────────────────

    /// Makes the next `submit` call fail with `error`.
    pub fn fail_next_submit(&self, error: DeviceError) {
        self.fail_nth_submit(0, error);
    }

    /// Lets `skip` submissions through, then fails the following one.
    pub fn fail_nth_submit(&self, skip: usize, error: DeviceError) {
        self.state.lock().fail_submit = Some((skip, error));
    }

    /// Simulates device loss: further submissions fail, queued work is skipped
    /// and pending completions report [`DeviceError::Lost`].
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
        self.submitted.notify_all();
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    /// Current value of a fence (zero for unknown fences).
    #[must_use]
    pub fn fence_value(&self, fence: FenceHandle) -> u64 {
        self.state.lock().fences.get(&fence).copied().unwrap_or(0)
    }

    /// Number of submitted streams that have not completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Labels of submitted streams that have not completed, oldest first.
    #[must_use]
    pub fn pending_labels(&self) -> Vec<String> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|s| s.label.clone())
            .collect()
    }

    /// Number of live buffers created through [`Device::create_buffer`].
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    #[must_use]
    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    // ── Driving ────────────────────────────────────────────────────────────

    /// Executes submitted streams, oldest runnable first, until every stream
    /// has completed or the remaining ones are blocked on fences.
    ///
    /// Returns the number of streams completed.
    pub fn run_fifo(&self) -> usize {
        self.drive(|_| 0, None)
    }

    /// Executes submitted streams one command at a time, choosing a random
    /// runnable stream at each step.
    ///
    /// Returns the number of streams completed.
    pub fn run_shuffled(&self, seed: u64) -> usize {
        let mut rng = StdRng::seed_from_u64(seed);
        self.drive(move |n| rng.random_range(0..n), None)
    }

    /// Runs until exactly one stream has completed. Returns `false` if every
    /// pending stream is blocked (or nothing is pending).
    pub fn complete_next(&self) -> bool {
        self.drive(|_| 0, Some(1)) == 1
    }

    fn drive(&self, mut pick: impl FnMut(usize) -> usize, max_completions: Option<usize>) -> usize {
        let mut active: Vec<Submission> = self.state.lock().queue.drain(..).collect();
        let mut completed = 0;

        while max_completions.is_none_or(|max| completed < max) {
            let (runnable, lost): (SmallVec<[usize; 8]>, bool) = {
                let state = self.state.lock();
                let runnable = active
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| state.is_runnable(s))
                    .map(|(i, _)| i)
                    .collect();
                (runnable, state.lost)
            };
            if runnable.is_empty() {
                break;
            }
            let index = runnable[pick(runnable.len())];

            match active[index].commands.pop_front() {
                Some(command) => self.execute(command, lost),
                None => {
                    let submission = active.remove(index);
                    self.state.lock().stats.completed += 1;
                    let result = if lost { Err(DeviceError::Lost) } else { Ok(()) };
                    (submission.completion)(result);
                    completed += 1;
                }
            }

            // Completions may submit further work.
            active.extend(self.state.lock().queue.drain(..));
        }

        if !active.is_empty() {
            let mut state = self.state.lock();
            for submission in active.into_iter().rev() {
                state.queue.push_front(submission);
            }
        }
        completed
    }

    fn execute(&self, command: HeadlessCommand, lost: bool) {
        match command {
            HeadlessCommand::Work(work) => {
                if !lost {
                    work();
                }
            }
            HeadlessCommand::Signal { fence, value } => {
                let mut state = self.state.lock();
                let current = state.fences.entry(fence).or_insert(0);
                *current = (*current).max(value);
            }
            HeadlessCommand::Wait { .. } => {}
        }
        self.state.lock().stats.commands_executed += 1;
    }

    /// Starts a background thread that drains submissions FIFO as they arrive.
    pub fn spawn_driver(self: &Arc<Self>) -> std::io::Result<HeadlessDriver> {
        self.spawn_driver_with_latency(Duration::ZERO)
    }

    /// Like [`spawn_driver`](Self::spawn_driver), sleeping `latency` before
    /// each drain to simulate GPU execution time.
    pub fn spawn_driver_with_latency(
        self: &Arc<Self>,
        latency: Duration,
    ) -> std::io::Result<HeadlessDriver> {
        self.state.lock().shutdown = false;
        let device = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("kairos-headless-driver".into())
            .spawn(move || {
                loop {
                    {
                        let mut state = device.state.lock();
                        while state.queue.is_empty() && !state.shutdown {
                            device.submitted.wait(&mut state);
                        }
                        if state.shutdown {
                            break;
                        }
                    }
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    if device.run_fifo() == 0 {
                        // Everything left is blocked on a fence; back off.
                        let mut state = device.state.lock();
                        if !state.shutdown {
                            device
                                .submitted
                                .wait_for(&mut state, Duration::from_millis(1));
                        }
                    }
                }
            })?;
        Ok(HeadlessDriver {
            device: Arc::clone(self),
            thread: Some(thread),
        })
    }
}

impl Device for HeadlessDevice {
    fn create_command_stream(&self, label: &str) -> Result<StreamHandle, DeviceError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(DeviceError::Lost);
        }
        let stream = StreamHandle(state.next_handle());
        state.recording.insert(
            stream,
            Recording {
                label: label.to_owned(),
                commands: VecDeque::new(),
            },
        );
        state.stats.streams_created += 1;
        Ok(stream)
    }

    fn submit(
        &self,
        stream: StreamHandle,
        completion: CompletionCallback,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        match state.fail_submit.take() {
            Some((0, error)) => {
                state.recording.remove(&stream);
                return Err(error);
            }
            Some((skip, error)) => state.fail_submit = Some((skip - 1, error)),
            None => {}
        }
        if state.lost {
            state.recording.remove(&stream);
            return Err(DeviceError::Lost);
        }
        let Some(recording) = state.recording.remove(&stream) else {
            return Err(DeviceError::InvalidHandle(stream.raw()));
        };
        state.queue.push_back(Submission {
            label: recording.label,
            commands: recording.commands,
            completion,
        });
        state.stats.submitted += 1;
        drop(state);
        self.submitted.notify_all();
        Ok(())
    }

    fn discard_stream(&self, stream: StreamHandle) {
        let mut state = self.state.lock();
        if state.recording.remove(&stream).is_some() {
            state.stats.discarded += 1;
        }
    }

    fn allocate_backing_store(&self, capacity: u64) -> Result<ArenaBackingHandle, DeviceError> {
        let mut state = self.state.lock();
        state.reserve(capacity, self.memory_limit)?;
        let handle = ArenaBackingHandle(state.next_handle());
        state.backing.insert(handle, capacity);
        Ok(handle)
    }

    fn create_buffer(&self, size: u64) -> Result<BufferHandle, DeviceError> {
        let mut state = self.state.lock();
        state.reserve(size, self.memory_limit)?;
        let handle = BufferHandle(state.next_handle());
        state.buffers.insert(handle, size);
        state.stats.buffers_created += 1;
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(size) = state.buffers.remove(&buffer) {
            state.bytes_allocated = state.bytes_allocated.saturating_sub(size);
            state.stats.buffers_destroyed += 1;
        } else {
            log::warn!("headless: destroy of unknown buffer {buffer:?}");
        }
    }

    fn create_fence(&self) -> Result<FenceHandle, DeviceError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(DeviceError::Lost);
        }
        let fence = FenceHandle(state.next_handle());
        state.fences.insert(fence, 0);
        state.stats.fences_created += 1;
        Ok(fence)
    }

    fn encode_signal(&self, stream: StreamHandle, fence: FenceHandle, value: u64) {
        self.record_command(stream, HeadlessCommand::Signal { fence, value });
    }

    fn encode_wait(&self, stream: StreamHandle, fence: FenceHandle, value: u64) {
        self.record_command(stream, HeadlessCommand::Wait { fence, value });
    }
}

/// Background driver handle. Dropping it stops and joins the thread.
pub struct HeadlessDriver {
    device: Arc<HeadlessDevice>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for HeadlessDriver {
    fn drop(&mut self) {
        self.device.state.lock().shutdown = true;
        self.device.submitted.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("headless driver thread panicked");
        }
    }
}
