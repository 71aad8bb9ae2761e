//! Pass Graph
//!
//! An ordered list of named passes, each declaring the resources it reads
//! and writes. The graph never reorders passes: declaration order *is* the
//! dependency contract. It only checks that the contract is well formed.
//!
//! # Phases
//!
//! | Phase | Method | Touches |
//! |-------|--------|---------|
//! | Build | [`PassGraph::add`], [`PassGraph::add_pass`], [`PassGraph::import`] | nothing but the graph |
//! | Check | [`PassGraph::validate`] | nothing but the graph |
//! | Resolve | [`PassGraph::resolve`] | arena, pool |
//! | Encode | [`PassGraph::encode`] | device streams, fences |
//!
//! Shape errors surface in the first two phases, before anything is
//! allocated. Resolution rolls back its own partial allocations on failure.
//!
//! # Lifetimes
//!
//! A written resource is live from its producing pass to its last reader
//! (inclusive), which is the interval handed to the arena. A resource that
//! an `Async` pass produces or reads runs concurrently with the primary
//! stream, so pass indices say nothing about when it is dead: it is given
//! the whole frame and is never aliased.
//!
//! # Streams
//!
//! ```text
//!  primary: ─ P0 ─ P1 ─────────── wait(async, v) ─ P3 ─
//!  async:   ─────────── A2 ─ signal(async, v) ─────────
//! ```
//!
//! `Compute` and `Render` passes are encoded in order on the primary stream,
//! `Async` passes in order on a second stream. When a pass reads a resource
//! produced on the other stream, the producer's stream signals its slot fence
//! right after the producer and the consumer's stream waits for that value
//! right before the consumer.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::device::{ArenaBackingHandle, BufferHandle, Device, StreamHandle};
use crate::errors::{DeviceError, GraphConsistencyError, Result, SchedulingError};
use crate::frame::FrameId;
use crate::frame::arena::{AliasGroup, AllocationKey, Lifetime, ResourceArena};
use crate::frame::fence::Fence;
use crate::frame::pool::{BufferId, BufferPool, PooledBuffer};
use crate::utils::interner::{self, ResourceName};

const EXTERNAL_PRODUCER: &str = "<external>";

// ============================================================================
// Declarations
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PassKind {
    Compute,
    Render,
    /// Runs on the async stream, ordered against the primary stream only
    /// through fences.
    Async,
}

impl PassKind {
    #[inline]
    #[must_use]
    pub fn is_async(self) -> bool {
        matches!(self, Self::Async)
    }
}

/// Where a pass's written resources come from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum LifetimeHint {
    /// One-frame transient from the resource arena.
    #[default]
    Transient,
    /// Buffer from the cross-frame pool, returned when the frame completes.
    Pooled,
}

/// A resource a pass writes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResourceDesc {
    pub name: ResourceName,
    pub size: u64,
    /// Arena alias group. `None` never shares bytes.
    pub alias_group: Option<AliasGroup>,
}

impl ResourceDesc {
    #[must_use]
    pub fn new(name: impl Into<ResourceName>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            alias_group: None,
        }
    }

    #[must_use]
    pub fn aliased(mut self, group: AliasGroup) -> Self {
        self.alias_group = Some(group);
        self
    }
}

impl From<(&str, u64)> for ResourceDesc {
    fn from((name, size): (&str, u64)) -> Self {
        Self::new(name, size)
    }
}

impl From<(ResourceName, u64)> for ResourceDesc {
    fn from((name, size): (ResourceName, u64)) -> Self {
        Self::new(name, size)
    }
}

/// A concrete, resolved resource.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResourceHandle {
    /// Byte range of the frame's arena backing store.
    Arena {
        backing: ArenaBackingHandle,
        offset: u64,
        size: u64,
    },
    /// Standalone buffer checked out of the pool.
    Pooled {
        buffer: BufferHandle,
        id: BufferId,
        size: u64,
    },
    /// Caller-owned input declared with [`PassGraph::import`].
    External { handle: u64, size: u64 },
}

impl ResourceHandle {
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        match *self {
            Self::Arena { size, .. } | Self::Pooled { size, .. } | Self::External { size, .. } => {
                size
            }
        }
    }
}

/// Name -> handle view of the resources one pass declared.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResourceBindings {
    entries: SmallVec<[(ResourceName, ResourceHandle); 8]>,
}

impl ResourceBindings {
    fn push(&mut self, name: ResourceName, handle: ResourceHandle) {
        self.entries.push((name, handle));
    }

    #[must_use]
    pub fn get(&self, name: ResourceName) -> Option<ResourceHandle> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, h)| *h)
    }

    /// Looks a binding up by string, without interning it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ResourceHandle> {
        interner::get(name).and_then(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceName, ResourceHandle)> + '_ {
        self.entries.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ResourceBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(n, h)| (n, h))).finish()
    }
}

/// What an encode callback sees.
pub struct EncodeContext<'a> {
    pub frame: FrameId,
    pub pass: &'a str,
    pub pass_index: usize,
    pub kind: PassKind,
    /// Stream the pass records into (primary or async).
    pub stream: StreamHandle,
    pub bindings: &'a ResourceBindings,
}

/// The opaque "record work" callback of a pass.
///
/// Implemented for every `FnOnce(&mut EncodeContext) + Send` closure.
pub trait PassEncode: Send {
    fn encode(self: Box<Self>, ctx: &mut EncodeContext<'_>);
}

impl<F> PassEncode for F
where
    F: FnOnce(&mut EncodeContext<'_>) + Send,
{
    fn encode(self: Box<Self>, ctx: &mut EncodeContext<'_>) {
        (*self)(ctx);
    }
}

/// One named unit of GPU work.
///
/// ```rust,ignore
/// let pass = Pass::compute("simulate")
///     .read("height-texture")
///     .write("velocity", 4096)
///     .encode(|ctx| record_dispatch(ctx.stream, ctx.bindings));
/// ```
pub struct Pass {
    name: String,
    kind: PassKind,
    reads: SmallVec<[ResourceName; 4]>,
    writes: SmallVec<[ResourceDesc; 4]>,
    lifetime_hint: LifetimeHint,
    encode: Option<Box<dyn PassEncode>>,
}

impl Pass {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: PassKind) -> Self {
        Self {
            name: name.into(),
            kind,
            reads: SmallVec::new(),
            writes: SmallVec::new(),
            lifetime_hint: LifetimeHint::Transient,
            encode: None,
        }
    }

    #[must_use]
    pub fn compute(name: impl Into<String>) -> Self {
        Self::new(name, PassKind::Compute)
    }

    #[must_use]
    pub fn render(name: impl Into<String>) -> Self {
        Self::new(name, PassKind::Render)
    }

    #[must_use]
    pub fn asynchronous(name: impl Into<String>) -> Self {
        Self::new(name, PassKind::Async)
    }

    #[must_use]
    pub fn read(mut self, name: impl Into<ResourceName>) -> Self {
        self.reads.push(name.into());
        self
    }

    #[must_use]
    pub fn write(mut self, name: impl Into<ResourceName>, size: u64) -> Self {
        self.writes.push(ResourceDesc::new(name, size));
        self
    }

    #[must_use]
    pub fn write_aliased(mut self, name: impl Into<ResourceName>, size: u64, group: AliasGroup) -> Self {
        self.writes.push(ResourceDesc::new(name, size).aliased(group));
        self
    }

    #[must_use]
    pub fn write_desc(mut self, desc: ResourceDesc) -> Self {
        self.writes.push(desc);
        self
    }

    #[must_use]
    pub fn lifetime(mut self, hint: LifetimeHint) -> Self {
        self.lifetime_hint = hint;
        self
    }

    #[must_use]
    pub fn encode<F>(self, encode: F) -> Self
    where
        F: FnOnce(&mut EncodeContext<'_>) + Send + 'static,
    {
        self.encoder(encode)
    }

    /// Like [`encode`](Self::encode), for callback types other than closures.
    #[must_use]
    pub fn encoder(mut self, encoder: impl PassEncode + 'static) -> Self {
        self.encode = Some(Box::new(encoder));
        self
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> PassKind {
        self.kind
    }

    #[must_use]
    pub fn reads(&self) -> &[ResourceName] {
        &self.reads
    }

    #[must_use]
    pub fn writes(&self) -> &[ResourceDesc] {
        &self.writes
    }

    #[must_use]
    pub fn lifetime_hint(&self) -> LifetimeHint {
        self.lifetime_hint
    }
}

impl fmt::Debug for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("lifetime_hint", &self.lifetime_hint)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Consistency checks
// ============================================================================

#[derive(Clone, Copy)]
enum Producer {
    External,
    Pass(usize),
}

/// Names seen so far, in declaration order.
#[derive(Default)]
struct Declarations {
    pass_names: FxHashSet<String>,
    producers: FxHashMap<ResourceName, Producer>,
}

impl Declarations {
    fn producer_name<'a>(&self, producer: Producer, passes: &'a [Pass]) -> &'a str {
        match producer {
            Producer::External => EXTERNAL_PRODUCER,
            Producer::Pass(index) => passes.get(index).map_or(EXTERNAL_PRODUCER, |p| p.name()),
        }
    }

    fn check_import(
        &self,
        name: ResourceName,
        passes: &[Pass],
    ) -> std::result::Result<(), GraphConsistencyError> {
        match self.producers.get(&name) {
            None => Ok(()),
            Some(Producer::External) => Err(GraphConsistencyError::DuplicateExternal(name)),
            Some(&producer) => Err(GraphConsistencyError::DuplicateWriter {
                pass: EXTERNAL_PRODUCER.to_owned(),
                resource: name,
                producer: self.producer_name(producer, passes).to_owned(),
            }),
        }
    }

    fn check_pass(
        &self,
        pass: &Pass,
        passes: &[Pass],
    ) -> std::result::Result<(), GraphConsistencyError> {
        if self.pass_names.contains(pass.name()) {
            return Err(GraphConsistencyError::DuplicatePass(pass.name.clone()));
        }
        for &resource in &pass.reads {
            if !self.producers.contains_key(&resource) {
                return Err(GraphConsistencyError::ReadBeforeWrite {
                    pass: pass.name.clone(),
                    resource,
                });
            }
        }
        let mut local: SmallVec<[ResourceName; 4]> = SmallVec::new();
        for desc in &pass.writes {
            if desc.size == 0 {
                return Err(GraphConsistencyError::ZeroSizedResource {
                    pass: pass.name.clone(),
                    resource: desc.name,
                });
            }
            if let Some(&producer) = self.producers.get(&desc.name) {
                return Err(GraphConsistencyError::DuplicateWriter {
                    pass: pass.name.clone(),
                    resource: desc.name,
                    producer: self.producer_name(producer, passes).to_owned(),
                });
            }
            if local.contains(&desc.name) {
                return Err(GraphConsistencyError::DuplicateWriter {
                    pass: pass.name.clone(),
                    resource: desc.name,
                    producer: pass.name.clone(),
                });
            }
            local.push(desc.name);
        }
        Ok(())
    }

    fn record_pass(&mut self, index: usize, pass: &Pass) {
        self.pass_names.insert(pass.name.clone());
        for desc in &pass.writes {
            self.producers.insert(desc.name, Producer::Pass(index));
        }
    }
}

// ============================================================================
// Resolution output
// ============================================================================

/// Resources checked out for one frame.
///
/// Must be handed back with [`release`](Self::release) exactly once, after
/// the frame's GPU work can no longer touch them.
#[derive(Debug, Default)]
pub struct ResolvedResources {
    frame: FrameId,
    per_pass: Vec<ResourceBindings>,
    arena_keys: SmallVec<[AllocationKey; 8]>,
    pooled: SmallVec<[PooledBuffer; 4]>,
}

impl ResolvedResources {
    #[must_use]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Bindings of the pass at `index` (declared reads and writes).
    #[must_use]
    pub fn bindings(&self, index: usize) -> Option<&ResourceBindings> {
        self.per_pass.get(index)
    }

    #[must_use]
    pub fn arena_allocations(&self) -> &[AllocationKey] {
        &self.arena_keys
    }

    #[must_use]
    pub fn pooled_buffers(&self) -> &[PooledBuffer] {
        &self.pooled
    }

    /// Returns every allocation and pooled buffer.
    pub fn release(self, arena: &mut ResourceArena, pool: &mut BufferPool, device: &dyn Device) {
        for key in self.arena_keys {
            if arena.release(key).is_none() {
                log::warn!("frame {}: arena allocation {key:?} already released", self.frame);
            }
        }
        for buffer in self.pooled {
            if let Err(e) = pool.release(device, buffer) {
                log::warn!("frame {}: {e}", self.frame);
            }
        }
    }
}

/// Streams produced by [`PassGraph::encode`], ready for submission.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EncodedFrame {
    pub primary: StreamHandle,
    pub async_stream: Option<StreamHandle>,
    pub signals: usize,
    pub waits: usize,
}

/// The two fences of one admission slot.
pub struct SlotFences<'a> {
    /// Signaled by the primary stream, awaited by the async stream.
    pub primary: &'a mut Fence,
    /// Signaled by the async stream, awaited by the primary stream.
    pub async_compute: &'a mut Fence,
}

// ============================================================================
// PassGraph
// ============================================================================

/// Ordered passes of one frame.
#[derive(Default)]
pub struct PassGraph {
    passes: Vec<Pass>,
    externals: SmallVec<[(ResourceName, ResourceHandle); 4]>,
    declared: Declarations,
}

impl PassGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Build ──────────────────────────────────────────────────────────────

    /// Appends a pass. Rejected passes leave the graph unchanged.
    pub fn add(&mut self, pass: Pass) -> std::result::Result<(), GraphConsistencyError> {
        self.declared.check_pass(&pass, &self.passes)?;
        self.declared.record_pass(self.passes.len(), &pass);
        log::trace!("graph: pass #{} `{}` ({:?})", self.passes.len(), pass.name, pass.kind);
        self.passes.push(pass);
        Ok(())
    }

    /// Appends a pass from its parts.
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
        let mut pass = Pass::new(name, kind).encode(encode);
        pass.reads.extend(reads.into_iter().map(Into::into));
        pass.writes.extend(writes.into_iter().map(Into::into));
        self.add(pass)
    }

    /// Declares a frame-external input; passes may read it without a producer.
    pub fn import(
        &mut self,
        name: impl Into<ResourceName>,
        handle: ResourceHandle,
    ) -> std::result::Result<(), GraphConsistencyError> {
        let name = name.into();
        self.declared.check_import(name, &self.passes)?;
        self.declared.producers.insert(name, Producer::External);
        self.externals.push((name, handle));
        Ok(())
    }

    // ── Check ──────────────────────────────────────────────────────────────

    /// Re-checks the whole graph from scratch.
    pub fn validate(&self) -> std::result::Result<(), GraphConsistencyError> {
        let mut declared = Declarations::default();
        for &(name, _) in &self.externals {
            declared.check_import(name, &self.passes)?;
            declared.producers.insert(name, Producer::External);
        }
        for (index, pass) in self.passes.iter().enumerate() {
            declared.check_pass(pass, &self.passes)?;
            declared.record_pass(index, pass);
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn passes(&self) -> impl Iterator<Item = &Pass> {
        self.passes.iter()
    }

    #[must_use]
    pub fn has_async(&self) -> bool {
        self.passes.iter().any(|p| p.kind.is_async())
    }

    /// Lifetime and alias group the arena will see for every written resource.
    #[must_use]
    pub fn plan_lifetimes(&self) -> FxHashMap<ResourceName, (Lifetime, Option<AliasGroup>)> {
        let whole_frame = Lifetime::new(0, self.passes.len().saturating_sub(1));
        let mut plan: FxHashMap<ResourceName, (Lifetime, Option<AliasGroup>)> =
            FxHashMap::default();
        let mut touched_async: FxHashSet<ResourceName> = FxHashSet::default();

        for (index, pass) in self.passes.iter().enumerate() {
            for desc in &pass.writes {
                plan.insert(desc.name, (Lifetime::new(index, index), desc.alias_group));
                if pass.kind.is_async() {
                    touched_async.insert(desc.name);
                }
            }
            for name in &pass.reads {
                if let Some((lifetime, _)) = plan.get_mut(name) {
                    lifetime.last = lifetime.last.max(index);
                    if pass.kind.is_async() {
                        touched_async.insert(*name);
                    }
                }
            }
        }
        for name in touched_async {
            if let Some(entry) = plan.get_mut(&name) {
                *entry = (whole_frame, None);
            }
        }
        plan
    }

    // ── Resolve ────────────────────────────────────────────────────────────

    /// Binds every declared resource to a concrete handle.
    ///
    /// On failure every allocation made by this call is returned before the
    /// error is.
    pub fn resolve(
        &self,
        frame: FrameId,
        arena: &mut ResourceArena,
        pool: &mut BufferPool,
        device: &dyn Device,
    ) -> Result<ResolvedResources> {
        self.validate()?;
        let plan = self.plan_lifetimes();
        let mut handles: FxHashMap<ResourceName, ResourceHandle> =
            self.externals.iter().copied().collect();
        let mut resolved = ResolvedResources {
            frame,
            per_pass: Vec::with_capacity(self.passes.len()),
            ..ResolvedResources::default()
        };

        for pass in &self.passes {
            let mut bindings = ResourceBindings::default();
            for name in &pass.reads {
                if let Some(handle) = handles.get(name) {
                    bindings.push(*name, *handle);
                }
            }
            for desc in &pass.writes {
                let placed = match pass.lifetime_hint {
                    LifetimeHint::Pooled => pool
                        .acquire(device, desc.size)
                        .map(|buffer| {
                            resolved.pooled.push(buffer);
                            ResourceHandle::Pooled {
                                buffer: buffer.handle,
                                id: buffer.id,
                                size: desc.size,
                            }
                        })
                        .map_err(SchedulingError::from),
                    LifetimeHint::Transient => {
                        let (lifetime, group) = plan
                            .get(&desc.name)
                            .copied()
                            .unwrap_or((Lifetime::new(0, 0), None));
                        arena
                            .allocate(frame, desc.size, lifetime, group)
                            .map(|allocation| {
                                resolved.arena_keys.push(allocation.key);
                                ResourceHandle::Arena {
                                    backing: arena.backing(),
                                    offset: allocation.offset,
                                    size: desc.size,
                                }
                            })
                            .map_err(SchedulingError::from)
                    }
                };
                match placed {
                    Ok(handle) => {
                        handles.insert(desc.name, handle);
                        bindings.push(desc.name, handle);
                    }
                    Err(e) => {
                        log::debug!(
                            "frame {frame}: resolving `{}` for pass `{}` failed, rolling back",
                            desc.name,
                            pass.name
                        );
                        resolved.release(arena, pool, device);
                        return Err(e);
                    }
                }
            }
            resolved.per_pass.push(bindings);
        }
        Ok(resolved)
    }

    // ── Encode ─────────────────────────────────────────────────────────────

    /// Records every pass, in declared order, into the primary stream and
    /// (if any pass is `Async`) an async stream, with fence signal/wait pairs
    /// at every cross-stream dependency.
    ///
    /// `progress` is called with each pass index once it has been recorded.
    /// On failure, streams created by this call are discarded.
    pub fn encode(
        self,
        frame: FrameId,
        resolved: &ResolvedResources,
        device: &dyn Device,
        fences: SlotFences<'_>,
        progress: &mut dyn FnMut(usize),
    ) -> std::result::Result<EncodedFrame, DeviceError> {
        let primary = device.create_command_stream(&format!("frame {frame} primary"))?;
        let async_stream = if self.has_async() {
            match device.create_command_stream(&format!("frame {frame} async")) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    device.discard_stream(primary);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let on_async = |index: usize| self.passes[index].kind.is_async();
        let mut producer_of: FxHashMap<ResourceName, usize> = FxHashMap::default();
        let mut needs_signal = vec![false; self.passes.len()];
        for (index, pass) in self.passes.iter().enumerate() {
            for name in &pass.reads {
                if let Some(&producer) = producer_of.get(name)
                    && on_async(producer) != pass.kind.is_async()
                {
                    needs_signal[producer] = true;
                }
            }
            for desc in &pass.writes {
                producer_of.insert(desc.name, index);
            }
        }
        let producer_on_async: Vec<bool> = (0..self.passes.len()).map(on_async).collect();

        let mut signal_value = vec![0u64; self.passes.len()];
        // Highest value each stream already waits for on the other stream's fence.
        let mut waited = [0u64; 2];
        let mut encoded = EncodedFrame {
            primary,
            async_stream,
            signals: 0,
            waits: 0,
        };

        for (index, pass) in self.passes.into_iter().enumerate() {
            let is_async = pass.kind.is_async();
            let stream = match (is_async, async_stream) {
                (true, Some(stream)) => stream,
                _ => primary,
            };

            for name in &pass.reads {
                let Some(&producer) = producer_of.get(name) else {
                    continue;
                };
                if producer >= index || producer_on_async[producer] == is_async {
                    continue;
                }
                let value = signal_value[producer];
                let lane = usize::from(is_async);
                if waited[lane] < value {
                    let fence: &Fence = if is_async {
                        &*fences.primary
                    } else {
                        &*fences.async_compute
                    };
                    fence.wait(device, stream, value);
                    waited[lane] = value;
                    encoded.waits += 1;
                }
            }

            let bindings = resolved.bindings(index).cloned().unwrap_or_default();
            log::trace!("frame {frame}: encode pass #{index} `{}`", pass.name);
            if let Some(encode) = pass.encode {
                let mut ctx = EncodeContext {
                    frame,
                    pass: &pass.name,
                    pass_index: index,
                    kind: pass.kind,
                    stream,
                    bindings: &bindings,
                };
                encode.encode(&mut ctx);
            }

            if needs_signal[index] {
                let fence = if is_async {
                    &mut *fences.async_compute
                } else {
                    &mut *fences.primary
                };
                signal_value[index] = fence.signal_next(device, stream);
                encoded.signals += 1;
            }
            progress(index);
        }
        Ok(encoded)
    }

    /// [`resolve`](Self::resolve) followed by [`encode`](Self::encode).
    ///
    /// If encoding fails the resolved resources are released again before
    /// the error is returned.
    pub fn resolve_and_encode(
        self,
        frame: FrameId,
        arena: &mut ResourceArena,
        pool: &mut BufferPool,
        device: &dyn Device,
        fences: SlotFences<'_>,
    ) -> Result<(ResolvedResources, EncodedFrame)> {
        let resolved = self.resolve(frame, arena, pool, device)?;
        match self.encode(frame, &resolved, device, fences, &mut |_| {}) {
            Ok(encoded) => Ok((resolved, encoded)),
            Err(error) => {
                resolved.release(arena, pool, device);
                Err(error.into())
            }
        }
    }
}

impl fmt::Debug for PassGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassGraph")
            .field("passes", &self.passes)
            .field("externals", &self.externals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::settings::{ArenaSettings, PoolSettings};

    fn noop(_: &mut EncodeContext<'_>) {}

    fn setup(capacity: u64) -> (HeadlessDevice, ResourceArena, BufferPool) {
        let device = HeadlessDevice::new();
        let arena =
            ResourceArena::new(&device, ArenaSettings::default().with_capacity(capacity)).unwrap();
        (device, arena, BufferPool::new(PoolSettings::default()))
    }

    #[test]
    fn duplicate_pass_name_is_rejected() {
        let mut graph = PassGraph::new();
        graph.add(Pass::compute("sim").write("a", 16)).unwrap();
        let err = graph.add(Pass::render("sim")).unwrap_err();
        assert_eq!(err, GraphConsistencyError::DuplicatePass("sim".into()));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn read_before_write_is_rejected() {
        let mut graph = PassGraph::new();
        let err = graph
            .add_pass("draw", PassKind::Render, ["color"], Vec::<ResourceDesc>::new(), noop)
            .unwrap_err();
        assert!(matches!(
            err,
            GraphConsistencyError::ReadBeforeWrite { ref pass, resource }
                if pass == "draw" && resource.as_str() == "color"
        ));
        assert!(graph.is_empty());
    }

    #[test]
    fn reading_own_write_is_not_an_earlier_write() {
        let mut graph = PassGraph::new();
        let err = graph
            .add(Pass::compute("loop").read("x").write("x", 16))
            .unwrap_err();
        assert!(matches!(err, GraphConsistencyError::ReadBeforeWrite { .. }));
    }

    #[test]
    fn second_writer_and_zero_size_are_rejected() {
        let mut graph = PassGraph::new();
        graph.add(Pass::compute("a").write("buf", 16)).unwrap();

        let err = graph.add(Pass::compute("b").write("buf", 16)).unwrap_err();
        assert!(matches!(
            err,
            GraphConsistencyError::DuplicateWriter { ref producer, .. } if producer == "a"
        ));

        let err = graph.add(Pass::compute("c").write("empty", 0)).unwrap_err();
        assert!(matches!(err, GraphConsistencyError::ZeroSizedResource { .. }));
    }

    #[test]
    fn imports_satisfy_reads_and_cannot_be_written() {
        let mut graph = PassGraph::new();
        let input = ResourceHandle::External { handle: 42, size: 64 };
        graph.import("camera", input).unwrap();
        assert_eq!(
            graph.import("camera", input),
            Err(GraphConsistencyError::DuplicateExternal(ResourceName::new("camera")))
        );

        graph.add(Pass::render("draw").read("camera")).unwrap();
        assert!(graph.add(Pass::compute("overwrite").write("camera", 64)).is_err());
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn lifetimes_span_producer_to_last_reader() {
        let mut graph = PassGraph::new();
        graph.add(Pass::compute("p0").write("a", 16)).unwrap();
        graph.add(Pass::compute("p1").read("a").write("b", 16)).unwrap();
        graph.add(Pass::render("p2").read("a")).unwrap();
        graph.add(Pass::render("p3").read("b")).unwrap();

        let plan = graph.plan_lifetimes();
        assert_eq!(plan[&ResourceName::new("a")].0, Lifetime::new(0, 2));
        assert_eq!(plan[&ResourceName::new("b")].0, Lifetime::new(1, 3));
    }

    #[test]
    fn async_resources_cover_the_whole_frame_and_are_not_aliased() {
        let g = AliasGroup(3);
        let mut graph = PassGraph::new();
        graph.add(Pass::compute("p0").write_aliased("a", 16, g)).unwrap();
        graph.add(Pass::asynchronous("p1").read("a").write_aliased("b", 16, g)).unwrap();
        graph.add(Pass::render("p2").write_aliased("c", 16, g)).unwrap();

        let plan = graph.plan_lifetimes();
        assert_eq!(plan[&ResourceName::new("a")], (Lifetime::new(0, 2), None));
        assert_eq!(plan[&ResourceName::new("b")], (Lifetime::new(0, 2), None));
        assert_eq!(plan[&ResourceName::new("c")], (Lifetime::new(2, 2), Some(g)));
    }

    #[test]
    fn resolve_binds_reads_to_their_producer() {
        let (device, mut arena, mut pool) = setup(4096);
        let mut graph = PassGraph::new();
        graph.add(Pass::compute("sim").write("a", 100)).unwrap();
        graph.add(Pass::render("draw").read("a")).unwrap();

        let resolved = graph.resolve(FrameId(1), &mut arena, &mut pool, &device).unwrap();
        let written = resolved.bindings(0).unwrap().lookup("a").unwrap();
        let read = resolved.bindings(1).unwrap().lookup("a").unwrap();
        assert_eq!(written, read);
        assert_eq!(read.size(), 100);
        assert_eq!(resolved.arena_allocations().len(), 1);
    }

    #[test]
    fn pooled_writes_come_from_the_pool() {
        let (device, mut arena, mut pool) = setup(4096);
        let mut graph = PassGraph::new();
        graph
            .add(Pass::compute("upload").write("transforms", 256).lifetime(LifetimeHint::Pooled))
            .unwrap();

        let resolved = graph.resolve(FrameId(1), &mut arena, &mut pool, &device).unwrap();
        assert!(matches!(
            resolved.bindings(0).unwrap().lookup("transforms"),
            Some(ResourceHandle::Pooled { size: 256, .. })
        ));
        assert_eq!(arena.stats().live_allocations, 0);
        assert_eq!(pool.stats().in_use, 1);

        resolved.release(&mut arena, &mut pool, &device);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().retained, 1);
    }

    #[test]
    fn failed_resolution_rolls_back() {
        let (device, mut arena, mut pool) = setup(1024);
        let mut graph = PassGraph::new();
        graph.add(Pass::compute("a").write("x", 512)).unwrap();
        graph
            .add(Pass::compute("b").write("pooled", 64).lifetime(LifetimeHint::Pooled))
            .unwrap();
        graph.add(Pass::compute("c").read("x").write("y", 1024)).unwrap();

        let err = graph
            .resolve(FrameId(1), &mut arena, &mut pool, &device)
            .unwrap_err();
        assert!(matches!(err, SchedulingError::Arena(_)));
        assert_eq!(arena.stats().live_allocations, 0);
        assert_eq!(arena.largest_free(), 1024);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn cross_stream_reads_get_one_signal_and_one_wait() {
        let (device, mut arena, mut pool) = setup(4096);
        let mut primary = Fence::new(&device).unwrap();
        let mut async_compute = Fence::new(&device).unwrap();

        let mut graph = PassGraph::new();
        graph.add(Pass::asynchronous("sim").write("field", 64)).unwrap();
        graph.add(Pass::render("draw").read("field")).unwrap();
        graph.add(Pass::render("post").read("field")).unwrap();

        let resolved = graph.resolve(FrameId(1), &mut arena, &mut pool, &device).unwrap();
        let mut seen = Vec::new();
        let encoded = graph
            .encode(
                FrameId(1),
                &resolved,
                &device,
                SlotFences {
                    primary: &mut primary,
                    async_compute: &mut async_compute,
                },
                &mut |i| seen.push(i),
            )
            .unwrap();

        assert!(encoded.async_stream.is_some());
        assert_eq!(encoded.signals, 1);
        assert_eq!(encoded.waits, 1);
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(async_compute.last_signaled(), 1);
        assert_eq!(primary.last_signaled(), 0);
    }

    #[test]
    fn sequential_graph_uses_only_the_primary_stream() {
        let (device, mut arena, mut pool) = setup(4096);
        let mut primary = Fence::new(&device).unwrap();
        let mut async_compute = Fence::new(&device).unwrap();

        let mut graph = PassGraph::new();
        graph.add(Pass::compute("a").write("x", 16)).unwrap();
        graph.add(Pass::render("b").read("x")).unwrap();

        let resolved = graph.resolve(FrameId(1), &mut arena, &mut pool, &device).unwrap();
        let encoded = graph
            .encode(
                FrameId(1),
                &resolved,
                &device,
                SlotFences {
                    primary: &mut primary,
                    async_compute: &mut async_compute,
                },
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(encoded.async_stream, None);
        assert_eq!(encoded.signals + encoded.waits, 0);
        assert_eq!(device.stats().streams_created, 1);
    }
}
