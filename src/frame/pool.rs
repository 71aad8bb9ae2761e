//! Buffer Pool
//!
//! Cross-frame free list of standalone device buffers, bucketed by exact size.
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     BufferPool                      │
//! │                                                     │
//! │  entries: BufferId -> { size, handle, state, idle } │
//! │  free:    size -> [BufferId]   (LIFO)               │
//! │                                                     │
//! │  acquire(size)  -> PooledBuffer   Free -> InUse     │
//! │  release(buf)                     InUse -> Free     │
//! │  end_frame()    age free buffers, drop stale ones   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Memory Strategy
//!
//! - Buffers are created lazily on the first request for a size.
//! - A release into a bucket already holding `max_buffers_per_size` free
//!   buffers destroys the buffer instead of retaining it.
//! - [`BufferPool::end_frame`] destroys free buffers that went unused for
//!   more than `max_idle_frames` frames.
//!
//! Unlike the [arena](super::arena), pool entries are never aliased: a buffer
//! is either `Free` or `InUse` by exactly one owner.

use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::device::{BufferHandle, Device};
use crate::errors::{DeviceError, PoolError};
use crate::settings::PoolSettings;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> BufferId {
    BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
}

// ─── Public Types ─────────────────────────────────────────────────────────────

/// Process-unique identity of a pooled buffer. Stable across reuse.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct BufferId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferState {
    Free,
    InUse,
}

/// A buffer checked out of the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PooledBuffer {
    pub id: BufferId,
    pub size: u64,
    pub handle: BufferHandle,
}

/// Pool counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PoolStats {
    /// Buffers created on the device (cumulative).
    pub created: u64,
    /// Acquisitions satisfied from the free list (cumulative).
    pub reused: u64,
    /// Releases that destroyed the buffer because its bucket was full (cumulative).
    pub destroyed_on_release: u64,
    /// Free buffers destroyed for being idle too long (cumulative).
    pub trimmed: u64,
    /// Free buffers currently held.
    pub retained: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
}

// ─── Internal Types ───────────────────────────────────────────────────────────

struct Entry {
    size: u64,
    handle: BufferHandle,
    state: BufferState,
    /// Frames spent in the free list since the last release.
    idle_frames: u32,
}

// ─── Pool Implementation ──────────────────────────────────────────────────────

pub struct BufferPool {
    settings: PoolSettings,
    entries: FxHashMap<BufferId, Entry>,
    free: FxHashMap<u64, Vec<BufferId>>,
    stats: PoolStats,
}

impl BufferPool {
    #[must_use]
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            entries: FxHashMap::default(),
            free: FxHashMap::default(),
            stats: PoolStats::default(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    /// Returns a free buffer of exactly `size` bytes, creating one if the
    /// bucket is empty.
    pub fn acquire(&mut self, device: &dyn Device, size: u64) -> Result<PooledBuffer, DeviceError> {
        if let Some(id) = self.free.get_mut(&size).and_then(Vec::pop) {
            let entry = self
                .entries
                .get_mut(&id)
                .ok_or(DeviceError::InvalidHandle(id.0))?;
            entry.state = BufferState::InUse;
            entry.idle_frames = 0;
            self.stats.reused += 1;
            self.stats.retained -= 1;
            self.stats.in_use += 1;
            return Ok(PooledBuffer {
                id,
                size,
                handle: entry.handle,
            });
        }

        let handle = device.create_buffer(size)?;
        let id = next_id();
        self.entries.insert(
            id,
            Entry {
                size,
                handle,
                state: BufferState::InUse,
                idle_frames: 0,
            },
        );
        self.stats.created += 1;
        self.stats.in_use += 1;
        log::debug!("pool: created buffer {} ({size} bytes)", id.0);
        Ok(PooledBuffer { id, size, handle })
    }

    /// Returns a buffer to its size class, or destroys it if the class is full.
    pub fn release(&mut self, device: &dyn Device, buffer: PooledBuffer) -> Result<(), PoolError> {
        let entry = self
            .entries
            .get_mut(&buffer.id)
            .ok_or(PoolError::UnknownBuffer(buffer.id.0))?;
        if entry.state == BufferState::Free {
            return Err(PoolError::NotInUse(buffer.id.0));
        }
        self.stats.in_use -= 1;

        let bucket = self.free.entry(entry.size).or_default();
        if bucket.len() >= self.settings.max_buffers_per_size {
            let handle = entry.handle;
            self.entries.remove(&buffer.id);
            device.destroy_buffer(handle);
            self.stats.destroyed_on_release += 1;
            log::debug!("pool: bucket {} full, destroyed buffer {}", buffer.size, buffer.id.0);
            return Ok(());
        }

        entry.state = BufferState::Free;
        entry.idle_frames = 0;
        bucket.push(buffer.id);
        self.stats.retained += 1;
        Ok(())
    }

    /// Ages every free buffer by one frame and destroys those idle for more
    /// than `max_idle_frames`. Returns the number destroyed.
    pub fn end_frame(&mut self, device: &dyn Device) -> usize {
        for entry in self.entries.values_mut() {
            if entry.state == BufferState::Free {
                entry.idle_frames = entry.idle_frames.saturating_add(1);
            }
        }
        self.trim(device, self.settings.max_idle_frames)
    }

    /// Destroys free buffers idle for more than `max_idle_frames`.
    ///
    /// `trim(device, 0)` empties the free list.
    pub fn trim(&mut self, device: &dyn Device, max_idle_frames: u32) -> usize {
        let mut destroyed = 0;
        for bucket in self.free.values_mut() {
            bucket.retain(|id| {
                let stale = self
                    .entries
                    .get(id)
                    .is_none_or(|e| max_idle_frames == 0 || e.idle_frames > max_idle_frames);
                if stale && let Some(entry) = self.entries.remove(id) {
                    device.destroy_buffer(entry.handle);
                    destroyed += 1;
                }
                !stale
            });
        }
        self.free.retain(|_, bucket| !bucket.is_empty());

        if destroyed > 0 {
            self.stats.trimmed += destroyed as u64;
            self.stats.retained -= destroyed;
            log::debug!("pool: trimmed {destroyed} idle buffers");
        }
        destroyed
    }

    /// `None` if the buffer is unknown (never created here, or destroyed).
    #[must_use]
    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        self.entries.get(&id).map(|e| e.state)
    }

    /// Buffers managed by the pool, free and in use.
    #[must_use]
    pub fn total_buffer_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;

    fn pool(cap: usize) -> BufferPool {
        BufferPool::new(PoolSettings::default().with_max_buffers_per_size(cap))
    }

    #[test]
    fn release_then_acquire_returns_same_identity() {
        let device = HeadlessDevice::new();
        let mut pool = pool(8);

        let b = pool.acquire(&device, 256).unwrap();
        pool.release(&device, b).unwrap();
        let again = pool.acquire(&device, 256).unwrap();

        assert_eq!(again.id, b.id);
        assert_eq!(again.handle, b.handle);
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn sizes_never_cross_buckets() {
        let device = HeadlessDevice::new();
        let mut pool = pool(8);

        let small = pool.acquire(&device, 256).unwrap();
        pool.release(&device, small).unwrap();
        let large = pool.acquire(&device, 512).unwrap();

        assert_ne!(large.id, small.id);
        assert_eq!(pool.stats().created, 2);
    }

    #[test]
    fn full_bucket_destroys_on_release() {
        let device = HeadlessDevice::new();
        let mut pool = pool(1);

        let a = pool.acquire(&device, 64).unwrap();
        let b = pool.acquire(&device, 64).unwrap();
        pool.release(&device, a).unwrap();
        pool.release(&device, b).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.destroyed_on_release, 1);
        assert_eq!(pool.state(b.id), None);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn double_release_is_rejected() {
        let device = HeadlessDevice::new();
        let mut pool = pool(8);

        let b = pool.acquire(&device, 64).unwrap();
        pool.release(&device, b).unwrap();
        assert_eq!(pool.release(&device, b), Err(PoolError::NotInUse(b.id.0)));
        assert_eq!(pool.state(b.id), Some(BufferState::Free));
    }

    #[test]
    fn idle_buffers_are_trimmed_after_max_idle_frames() {
        let device = HeadlessDevice::new();
        let mut pool = BufferPool::new(PoolSettings::default().with_max_idle_frames(2));

        let b = pool.acquire(&device, 64).unwrap();
        pool.release(&device, b).unwrap();

        assert_eq!(pool.end_frame(&device), 0);
        assert_eq!(pool.end_frame(&device), 0);
        assert_eq!(pool.end_frame(&device), 1);
        assert_eq!(pool.total_buffer_count(), 0);
        assert_eq!(pool.stats().trimmed, 1);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn in_use_buffers_are_never_trimmed() {
        let device = HeadlessDevice::new();
        let mut pool = pool(8);

        let b = pool.acquire(&device, 64).unwrap();
        assert_eq!(pool.trim(&device, 0), 0);
        assert_eq!(pool.state(b.id), Some(BufferState::InUse));
    }
}
