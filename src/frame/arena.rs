//! Resource Arena
//!
//! Sub-allocates byte ranges for per-frame transient resources from a single
//! fixed-capacity backing store.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ResourceArena                         │
//! │                                                              │
//! │  free:    [Range<u64>]         sorted, coalesced             │
//! │  regions: SlotMap<RegionKey, Region>                         │
//! │           one reserved byte range + the allocations in it    │
//! │  allocs:  SlotMap<AllocationKey, ArenaAllocation>            │
//! │  by_frame: FrameId -> [AllocationKey]                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A *region* is a byte range carved out of the free list. Usually it holds a
//! single allocation. When the free list cannot satisfy a request that names
//! an [`AliasGroup`], an existing region of the same frame and group is
//! reused, provided it is large enough and every allocation already in it
//! has a lifetime disjoint from the request. The region's bytes return to the
//! free list when its last tenant is released.
//!
//! # Allocation Policy
//!
//! 1. First fit from the free list (sizes rounded up to the alignment).
//! 2. Otherwise, if a group is given, the smallest compatible alias region.
//! 3. Otherwise [`ArenaExhausted`].
//!
//! Fresh space is always preferred over aliasing: aliasing is the fallback
//! that keeps a frame within budget, not the default placement.
//!
//! # Invariant
//!
//! At every pass index, the byte ranges of the allocations whose lifetime
//! contains that index are pairwise disjoint. Allocations of different
//! frames never share bytes.

use std::ops::Range;

use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::device::{ArenaBackingHandle, Device};
use crate::errors::{ArenaExhausted, Result, SettingsError};
use crate::frame::FrameId;
use crate::settings::ArenaSettings;

new_key_type! {
    /// Stable key of one live arena allocation.
    pub struct AllocationKey;
}

new_key_type! {
    struct RegionKey;
}

// ─── Public Types ─────────────────────────────────────────────────────────────

/// Inclusive interval of pass indices during which a resource is in use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Lifetime {
    pub first: usize,
    pub last: usize,
}

impl Lifetime {
    /// Creates `[first, last]`, swapping the bounds if given in reverse.
    #[must_use]
    pub fn new(first: usize, last: usize) -> Self {
        Self {
            first: first.min(last),
            last: first.max(last),
        }
    }

    /// Shares at least one pass index with `other`.
    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.first <= index && index <= self.last
    }
}

/// Label under which allocations agree to share bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct AliasGroup(pub u32);

/// A byte range handed out for one frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ArenaAllocation {
    pub key: AllocationKey,
    pub offset: u64,
    /// Requested size (the reserved range may be larger due to alignment or aliasing).
    pub size: u64,
    pub alias_group: Option<AliasGroup>,
    pub lifetime: Lifetime,
    pub frame: FrameId,
    /// `true` if this allocation reuses the bytes of another one.
    pub aliased: bool,
}

impl ArenaAllocation {
    #[inline]
    #[must_use]
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }
}

/// Arena counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ArenaStats {
    pub capacity: u64,
    /// Bytes currently carved out of the free list.
    pub bytes_reserved: u64,
    /// High-water mark of `bytes_reserved`.
    pub peak_reserved: u64,
    pub live_allocations: usize,
    /// Allocations placed by aliasing (cumulative).
    pub alias_hits: u64,
    /// Failed allocations (cumulative).
    pub exhausted: u64,
}

// ─── Internal Types ───────────────────────────────────────────────────────────

struct Region {
    offset: u64,
    reserved: u64,
    group: Option<AliasGroup>,
    frame: FrameId,
    tenants: SmallVec<[AllocationKey; 2]>,
}

struct Tenant {
    allocation: ArenaAllocation,
    region: RegionKey,
}

// ─── Arena ────────────────────────────────────────────────────────────────────

/// Fixed-capacity sub-allocator with lifetime-based aliasing.
///
/// Not internally synchronized; the scheduler keeps it behind a mutex shared
/// by the producer thread and device completion callbacks.
pub struct ResourceArena {
    backing: ArenaBackingHandle,
    capacity: u64,
    alignment: u64,
    free: Vec<Range<u64>>,
    regions: SlotMap<RegionKey, Region>,
    allocations: SlotMap<AllocationKey, Tenant>,
    by_frame: FxHashMap<FrameId, SmallVec<[AllocationKey; 8]>>,
    stats: ArenaStats,
}

impl ResourceArena {
    /// Allocates the backing store from `device` and creates an empty arena.
    pub fn new(device: &dyn Device, settings: ArenaSettings) -> Result<Self> {
        settings.validate()?;
        let backing = device.allocate_backing_store(settings.capacity)?;
        log::debug!(
            "arena: backing store {backing:?} of {} bytes (alignment {})",
            settings.capacity,
            settings.alignment
        );
        Ok(Self::with_backing(backing, settings)?)
    }

    /// Creates an arena over an existing backing store.
    pub fn with_backing(
        backing: ArenaBackingHandle,
        settings: ArenaSettings,
    ) -> std::result::Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            backing,
            capacity: settings.capacity,
            alignment: settings.alignment,
            free: vec![0..settings.capacity],
            regions: SlotMap::with_key(),
            allocations: SlotMap::with_key(),
            by_frame: FxHashMap::default(),
            stats: ArenaStats {
                capacity: settings.capacity,
                ..ArenaStats::default()
            },
        })
    }

    #[inline]
    #[must_use]
    pub fn backing(&self) -> ArenaBackingHandle {
        self.backing
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    // ── Allocation ─────────────────────────────────────────────────────────

    /// Reserves `size` bytes for `frame`, used during `lifetime`.
    ///
    /// With `alias_group` set, the request may share the bytes of an existing
    /// allocation of the same frame and group whose lifetime is disjoint.
    pub fn allocate(
        &mut self,
        frame: FrameId,
        size: u64,
        lifetime: Lifetime,
        alias_group: Option<AliasGroup>,
    ) -> std::result::Result<ArenaAllocation, ArenaExhausted> {
        let Some(reserved) = size.max(1).checked_next_multiple_of(self.alignment) else {
            return Err(self.exhausted(size));
        };

        if let Some(offset) = self.take_free(reserved) {
            let region = self.regions.insert(Region {
                offset,
                reserved,
                group: alias_group,
                frame,
                tenants: SmallVec::new(),
            });
            self.stats.bytes_reserved += reserved;
            self.stats.peak_reserved = self.stats.peak_reserved.max(self.stats.bytes_reserved);
            return Ok(self.place(region, frame, size, lifetime, alias_group, false));
        }

        if let Some(group) = alias_group
            && let Some(region) = self.find_alias_region(frame, group, reserved, lifetime)
        {
            self.stats.alias_hits += 1;
            log::trace!(
                "arena: frame {frame} aliases {size} bytes at offset {} (group {})",
                self.regions[region].offset,
                group.0
            );
            return Ok(self.place(region, frame, size, lifetime, alias_group, true));
        }

        Err(self.exhausted(reserved))
    }

    fn place(
        &mut self,
        region: RegionKey,
        frame: FrameId,
        size: u64,
        lifetime: Lifetime,
        alias_group: Option<AliasGroup>,
        aliased: bool,
    ) -> ArenaAllocation {
        let offset = self.regions[region].offset;
        let key = self.allocations.insert_with_key(|key| Tenant {
            allocation: ArenaAllocation {
                key,
                offset,
                size,
                alias_group,
                lifetime,
                frame,
                aliased,
            },
            region,
        });
        self.regions[region].tenants.push(key);
        self.by_frame.entry(frame).or_default().push(key);
        self.stats.live_allocations += 1;
        self.allocations[key].allocation
    }

    fn find_alias_region(
        &self,
        frame: FrameId,
        group: AliasGroup,
        reserved: u64,
        lifetime: Lifetime,
    ) -> Option<RegionKey> {
        self.regions
            .iter()
            .filter(|(_, r)| r.frame == frame && r.group == Some(group) && r.reserved >= reserved)
            .filter(|(_, r)| {
                r.tenants
                    .iter()
                    .all(|t| !self.allocations[*t].allocation.lifetime.overlaps(&lifetime))
            })
            .min_by_key(|(_, r)| (r.reserved, r.offset))
            .map(|(key, _)| key)
    }

    fn exhausted(&mut self, requested: u64) -> ArenaExhausted {
        self.stats.exhausted += 1;
        let err = ArenaExhausted {
            requested,
            largest_free: self.largest_free(),
            capacity: self.capacity,
        };
        log::debug!("arena: {err}");
        err
    }

    // ── Release ────────────────────────────────────────────────────────────

    /// Releases one allocation. Returns `None` if the key is not live.
    pub fn release(&mut self, key: AllocationKey) -> Option<ArenaAllocation> {
        let allocation = self.release_inner(key)?;
        if let Some(keys) = self.by_frame.get_mut(&allocation.frame) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_frame.remove(&allocation.frame);
            }
        }
        Some(allocation)
    }

    /// Releases every allocation of `frame`. Returns how many were released.
    pub fn release_frame(&mut self, frame: FrameId) -> usize {
        let Some(keys) = self.by_frame.remove(&frame) else {
            return 0;
        };
        keys.into_iter()
            .filter(|key| self.release_inner(*key).is_some())
            .count()
    }

    fn release_inner(&mut self, key: AllocationKey) -> Option<ArenaAllocation> {
        let tenant = self.allocations.remove(key)?;
        self.stats.live_allocations -= 1;

        let region = &mut self.regions[tenant.region];
        region.tenants.retain(|t| *t != key);
        if region.tenants.is_empty()
            && let Some(region) = self.regions.remove(tenant.region)
        {
            self.stats.bytes_reserved -= region.reserved;
            self.free_range(region.offset..region.offset + region.reserved);
        }
        Some(tenant.allocation)
    }

    // ── Free list ──────────────────────────────────────────────────────────

    fn take_free(&mut self, size: u64) -> Option<u64> {
        let index = self.free.iter().position(|r| r.end - r.start >= size)?;
        let offset = self.free[index].start;
        self.free[index].start += size;
        if self.free[index].is_empty() {
            self.free.remove(index);
        }
        Some(offset)
    }

    fn free_range(&mut self, mut range: Range<u64>) {
        let mut index = self.free.partition_point(|r| r.start < range.start);
        if index > 0 && self.free[index - 1].end == range.start {
            range.start = self.free[index - 1].start;
            self.free.remove(index - 1);
            index -= 1;
        }
        if index < self.free.len() && self.free[index].start == range.end {
            range.end = self.free[index].end;
            self.free.remove(index);
        }
        self.free.insert(index, range);
    }

    // ── Queries ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn get(&self, key: AllocationKey) -> Option<&ArenaAllocation> {
        self.allocations.get(key).map(|t| &t.allocation)
    }

    /// All live allocations, in no particular order.
    pub fn allocations(&self) -> impl Iterator<Item = &ArenaAllocation> {
        self.allocations.values().map(|t| &t.allocation)
    }

    /// Live allocations of one frame.
    #[must_use]
    pub fn frame_allocations(&self, frame: FrameId) -> usize {
        self.by_frame.get(&frame).map_or(0, SmallVec::len)
    }

    /// Size of the largest contiguous free range.
    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.free.iter().map(|r| r.end - r.start).max().unwrap_or(0)
    }

    /// Number of disjoint free ranges (1 for an empty arena).
    #[must_use]
    pub fn free_fragments(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        self.stats
    }
}
