// id.rs — Stable identifiers for pipeline stages
//
// Stage IDs are allocated in definition order and double as indices into the
// pipeline's stage table. Producers are always defined before the stages that
// call them, so ID order is also a valid tie-break for topological ordering.

/// Stable identifier for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

impl StageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocator for stage IDs. Produces monotonically increasing IDs in
/// definition order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_stage: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_stage(&mut self) -> StageId {
        let id = StageId(self.next_stage);
        self.next_stage += 1;
        id
    }
}
