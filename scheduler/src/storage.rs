// storage.rs — Storage placement and buffers for scope instances
//
// Placement is decided in two phases that share one fact. First every
// dimension's declared extent is resolved to `Fixed(n)` (it folds to a
// literal) or `Symbolic`. Then a per-iteration scope whose dimensions are all
// fixed and whose size fits the stack limit is placed in a block inside the
// realizer's frame; everything else goes through the allocator hooks.
// Vectorization legality is read off the same resolution.
//
// A stack block always occupies `STACK_CAPACITY` bytes of the frame, which
// is the ceiling for stack placement; a buffer only exposes the decided
// `extent * ELEMENT_SIZE` bytes of it.
//
// Preconditions: the storage region has been verified.
// Postconditions: every `Dynamic` buffer hands its storage back to the free
//                 hook exactly once, on release or on drop.
// Failure modes: the allocate hook may return no storage or too little, and
//                a region may be too large to size (`AllocationFailure`).
//                Short storage is handed back to the free hook.
// Side effects: calls the registered allocator hooks; updates
//               `AllocationStats`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Result, RuntimeError};
use crate::hooks::{AllocatorHooks, UserContext};
use crate::region::{Layout, Region};
use crate::schedule::{LoopNest, LoopRole, ScopeKind, StageSchedule};
use crate::stage::{Stage, Value, ELEMENT_SIZE};

/// Bytes available to one stack-placed buffer.
pub const STACK_CAPACITY: usize = 4096;

// ── Extent resolution ───────────────────────────────────────────────────────

/// Whether a dimension's storage extent is known without parameter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentResolution {
    Fixed(i64),
    Symbolic,
}

impl ExtentResolution {
    pub fn fixed(self) -> Option<i64> {
        match self {
            ExtentResolution::Fixed(n) => Some(n),
            ExtentResolution::Symbolic => None,
        }
    }
}

/// Resolve every dimension of `stage`, innermost first. Dimensions without
/// an explicit bound take their extent from consumers and are `Symbolic`.
pub fn resolve_extents(stage: &Stage, schedule: &StageSchedule) -> Vec<ExtentResolution> {
    stage
        .dims
        .iter()
        .map(|dim| {
            match schedule.bound_for(dim).and_then(|b| b.extent.const_value()) {
                Some(n) if n >= 0 => ExtentResolution::Fixed(n),
                _ => ExtentResolution::Symbolic,
            }
        })
        .collect()
}

// ── Placement ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Placement {
    /// Inline block in the enclosing iteration's frame.
    Stack,
    /// Storage from the allocator hooks.
    Dynamic,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Stack => write!(f, "stack"),
            Placement::Dynamic => write!(f, "dynamic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationDecision {
    pub placement: Placement,
    pub bytes: usize,
    pub layout: Layout,
}

/// Decide placement for one scope instance with the given storage region.
///
/// `bytes` saturates at `usize::MAX` when the region is too large to size;
/// such a decision is always `Dynamic` and the allocator refuses it.
pub fn decide(
    resolution: &[ExtentResolution],
    kind: ScopeKind,
    storage: Region,
    stack_limit: usize,
) -> AllocationDecision {
    let bytes = storage
        .checked_size()
        .and_then(|n| n.checked_mul(ELEMENT_SIZE))
        .unwrap_or(usize::MAX);
    let all_fixed = resolution.iter().all(|r| r.fixed().is_some());
    let placement = if all_fixed
        && kind == ScopeKind::PerIteration
        && bytes <= stack_limit.min(STACK_CAPACITY)
    {
        Placement::Stack
    } else {
        Placement::Dynamic
    };
    AllocationDecision {
        placement,
        bytes,
        layout: Layout::dense(storage),
    }
}

/// Vector width a vectorized loop can use, derived from the extent
/// resolution: an inner split loop with a literal factor, or a whole
/// dimension with a fixed extent. `None` means the request is not honored.
pub fn vector_lanes(
    resolution: &[ExtentResolution],
    nest: &LoopNest,
    var: &str,
) -> Option<i64> {
    let lp = nest.loops.iter().find(|l| l.var == var)?;
    match &lp.role {
        LoopRole::Inner { factor } => factor.const_value().filter(|&n| n > 0),
        LoopRole::Whole => resolution.get(lp.dim)?.fixed().filter(|&n| n > 0),
        LoopRole::Outer { .. } => None,
    }
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// Counters shared by every execution of a pipeline.
#[derive(Debug, Default)]
pub struct AllocationStats {
    stack_allocations: AtomicUsize,
    dynamic_allocations: AtomicUsize,
    dynamic_frees: AtomicUsize,
    failed_allocations: AtomicUsize,
    dynamic_bytes: AtomicUsize,
}

/// Point-in-time copy of `AllocationStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationCounts {
    pub stack_allocations: usize,
    pub dynamic_allocations: usize,
    pub dynamic_frees: usize,
    pub failed_allocations: usize,
    pub dynamic_bytes: usize,
}

impl AllocationStats {
    pub fn snapshot(&self) -> AllocationCounts {
        AllocationCounts {
            stack_allocations: self.stack_allocations.load(Ordering::Relaxed),
            dynamic_allocations: self.dynamic_allocations.load(Ordering::Relaxed),
            dynamic_frees: self.dynamic_frees.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            dynamic_bytes: self.dynamic_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.stack_allocations.store(0, Ordering::Relaxed);
        self.dynamic_allocations.store(0, Ordering::Relaxed);
        self.dynamic_frees.store(0, Ordering::Relaxed);
        self.failed_allocations.store(0, Ordering::Relaxed);
        self.dynamic_bytes.store(0, Ordering::Relaxed);
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Fixed frame slot; `len` is the decided size.
struct StackBlock {
    bytes: [u8; STACK_CAPACITY],
    len: usize,
}

struct DynamicBlock<'a> {
    storage: Option<Vec<u8>>,
    len: usize,
    hooks: &'a dyn AllocatorHooks,
    ctx: &'a UserContext,
    stats: &'a AllocationStats,
}

impl Drop for DynamicBlock<'_> {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.hooks.free(self.ctx, storage);
            self.stats.dynamic_frees.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// The stack variant is held by value so the block lives in the frame that
// owns the buffer.
#[allow(clippy::large_enum_variant)]
enum Block<'a> {
    Stack(StackBlock),
    Dynamic(DynamicBlock<'a>),
}

/// Storage for one scope instance of a stage.
pub struct Buffer<'a> {
    stage: String,
    layout: Layout,
    block: Block<'a>,
}

impl<'a> Buffer<'a> {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn region(&self) -> &Region {
        &self.layout.region
    }

    pub fn placement(&self) -> Placement {
        match self.block {
            Block::Stack(_) => Placement::Stack,
            Block::Dynamic(_) => Placement::Dynamic,
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.block {
            Block::Stack(b) => &b.bytes[..b.len],
            Block::Dynamic(b) => match b.storage.as_deref() {
                Some(s) => &s[..b.len],
                None => &[],
            },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.block {
            Block::Stack(b) => &mut b.bytes[..b.len],
            Block::Dynamic(b) => match b.storage.as_deref_mut() {
                Some(s) => &mut s[..b.len],
                None => &mut [],
            },
        }
    }

    /// Value at `coords`, or `None` outside the buffer's region.
    pub fn load(&self, coords: &[i64]) -> Option<Value> {
        let at = self.layout.index_of(coords)? * ELEMENT_SIZE;
        let chunk = self.bytes().get(at..at + ELEMENT_SIZE)?;
        let mut raw = [0u8; ELEMENT_SIZE];
        raw.copy_from_slice(chunk);
        Some(Value::from_ne_bytes(raw))
    }

    /// Store `value` at `coords`. Returns false outside the buffer's region.
    pub fn store(&mut self, coords: &[i64], value: Value) -> bool {
        let Some(index) = self.layout.index_of(coords) else {
            return false;
        };
        self.store_index(index, value)
    }

    /// Store `value` at element `index` of the dense layout.
    pub fn store_index(&mut self, index: usize, value: Value) -> bool {
        let at = index * ELEMENT_SIZE;
        match self.bytes_mut().get_mut(at..at + ELEMENT_SIZE) {
            Some(chunk) => {
                chunk.copy_from_slice(&value.to_ne_bytes());
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("stage", &self.stage)
            .field("region", &self.layout.region)
            .field("placement", &self.placement())
            .finish()
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Allocates buffers for scope instances through one pipeline's hooks.
#[derive(Clone, Copy)]
pub struct StorageAllocator<'a> {
    hooks: &'a dyn AllocatorHooks,
    ctx: &'a UserContext,
    stats: &'a AllocationStats,
}

impl<'a> StorageAllocator<'a> {
    pub fn new(
        hooks: &'a dyn AllocatorHooks,
        ctx: &'a UserContext,
        stats: &'a AllocationStats,
    ) -> Self {
        StorageAllocator { hooks, ctx, stats }
    }

    /// Obtain storage for `stage` as decided.
    pub fn allocate(&self, stage: &Stage, decision: AllocationDecision) -> Result<Buffer<'a>> {
        let AllocationDecision {
            placement,
            bytes,
            layout,
        } = decision;
        debug!(
            stage = %stage.name,
            %placement,
            bytes,
            region = %layout.region,
            "allocating scope storage"
        );
        let block = match placement {
            Placement::Stack => {
                self.stats.stack_allocations.fetch_add(1, Ordering::Relaxed);
                Block::Stack(StackBlock {
                    bytes: [0; STACK_CAPACITY],
                    len: bytes.min(STACK_CAPACITY),
                })
            }
            Placement::Dynamic => {
                // No allocation can exceed `isize::MAX` bytes.
                let storage = if bytes > isize::MAX as usize {
                    None
                } else {
                    match self.hooks.allocate(self.ctx, bytes) {
                        Some(storage) if storage.len() >= bytes => Some(storage),
                        Some(short) => {
                            self.hooks.free(self.ctx, short);
                            None
                        }
                        None => None,
                    }
                };
                let Some(storage) = storage else {
                    self.stats.failed_allocations.fetch_add(1, Ordering::Relaxed);
                    return Err(RuntimeError::AllocationFailure {
                        stage: stage.name.clone(),
                        bytes,
                    });
                };
                self.stats.dynamic_allocations.fetch_add(1, Ordering::Relaxed);
                self.stats.dynamic_bytes.fetch_add(bytes, Ordering::Relaxed);
                Block::Dynamic(DynamicBlock {
                    storage: Some(storage),
                    len: bytes,
                    hooks: self.hooks,
                    ctx: self.ctx,
                    stats: self.stats,
                })
            }
        };
        Ok(Buffer {
            stage: stage.name.clone(),
            layout,
            block,
        })
    }

    /// Return a buffer's storage. Dynamic storage goes back to the free hook.
    pub fn release(&self, buffer: Buffer<'a>) {
        trace!(stage = %buffer.stage, placement = %buffer.placement(), "releasing scope storage");
        drop(buffer);
    }
}
