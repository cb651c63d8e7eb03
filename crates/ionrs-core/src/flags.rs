//! Bit sets shared by buffers and heaps.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Per-buffer allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BufferFlags: u32 {
        /// CPU mappings are cacheable.
        const CACHED            = 1 << 0;
        /// The caller performs cache maintenance itself.
        const CACHED_NEEDS_SYNC = 1 << 1;
        /// Teardown runs on the heap's worker. Set by the allocator when the
        /// heap defers frees; ignored on heaps that do not.
        const DEFERRED_FREE     = 1 << 2;
    }
}

impl BufferFlags {
    /// Cached buffers without caller-managed sync get lazily faulted user
    /// mappings and a dirty page table.
    #[must_use]
    pub const fn faults_user_mappings(self) -> bool {
        self.contains(Self::CACHED) && !self.contains(Self::CACHED_NEEDS_SYNC)
    }
}

bitflags! {
    /// Registration flags for a heap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HeapFlags: u32 {
        /// Buffers are destroyed by a dedicated worker thread.
        const DEFER_FREE = 1 << 0;
    }
}

bitflags! {
    /// Optional capabilities a heap backend implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HeapCaps: u32 {
        const MAP_KERNEL = 1 << 0;
        const MAP_USER   = 1 << 1;
        const PHYS       = 1 << 2;
    }
}
