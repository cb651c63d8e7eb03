//! Heap backends and the registered heap entry.
//!
//! A backend implements the mandatory allocate/free/map-for-dma/unmap-for-dma
//! operations; every other capability has a default body that reports
//! [`IonError::Unsupported`] and is advertised through [`HeapCaps`] so the
//! device can refuse the operation before reaching the backend.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::buffer::BufferId;
use crate::deferred::DeferredFreeList;
use crate::error::{IonError, Result};
use crate::flags::{BufferFlags, HeapCaps, HeapFlags};
use crate::metrics::DeviceMetrics;

/// Heap ids select bits in a 32-bit heap mask.
pub type HeapId = u32;

pub const MAX_HEAPS: u32 = 32;

/// Mask selecting every heap.
pub const ALL_HEAPS: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapKind {
    System,
    SystemContig,
    Carveout,
    Chunk,
    Dma,
    Custom(u32),
}

/// Static identity of a heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDescriptor {
    pub id: HeapId,
    pub name: String,
    pub kind: HeapKind,
    /// Higher priorities are tried first.
    pub priority: i32,
    #[serde(default)]
    pub flags: HeapFlags,
}

impl HeapDescriptor {
    pub fn new(id: HeapId, name: impl Into<String>, kind: HeapKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            priority: 0,
            flags: HeapFlags::empty(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// This heap's bit in a heap mask. Zero for an out-of-range id.
    #[must_use]
    pub fn mask_bit(&self) -> u32 {
        1u32.checked_shl(self.id).unwrap_or(0)
    }
}

/// What the engine asks a backend for. `len` is already page aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub len: usize,
    pub align: usize,
    pub flags: BufferFlags,
}

/// Backend-private storage for one allocation.
pub struct RawAllocation(Box<dyn Any + Send + Sync>);

impl RawAllocation {
    pub fn new<T: Any + Send + Sync>(storage: T) -> Self {
        Self(Box::new(storage))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Recover the backend's storage, or give it back on a type mismatch.
    pub fn into_inner<T: Any>(self) -> std::result::Result<Box<T>, Self> {
        self.0.downcast().map_err(Self)
    }
}

impl fmt::Debug for RawAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawAllocation(..)")
    }
}

/// One physically contiguous run of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub phys_addr: u64,
    pub len: usize,
    /// Bus address a device uses. Equal to `phys_addr` without an IOMMU.
    pub dma_addr: u64,
}

/// Scatter list describing a buffer's physical layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatterTable {
    segments: Vec<Segment>,
}

impl ScatterTable {
    /// Build a table from `(phys_addr, len)` runs.
    pub fn from_runs(runs: impl IntoIterator<Item = (u64, usize)>) -> Self {
        Self {
            segments: runs
                .into_iter()
                .map(|(phys_addr, len)| Segment {
                    phys_addr,
                    len,
                    dma_addr: phys_addr,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.segments.len() == 1
    }
}

/// Address of a kernel-side CPU mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelAddr(pub usize);

/// Identity of one user-space mapping of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub u64);

/// A user-space virtual range mapped onto a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegion {
    pub id: RegionId,
    pub start: usize,
    pub len: usize,
}

/// Heap pressure report used to trigger proactive reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShrinkHint {
    /// Only clients at or above this reclaim priority are candidates.
    pub min_priority: i32,
    /// Bytes the heap would like to have free.
    pub min_free: usize,
}

/// Memory backend plugged into the device.
pub trait HeapBackend: Send + Sync {
    fn allocate(&self, request: &AllocationRequest) -> Result<RawAllocation>;

    fn free(&self, allocation: RawAllocation);

    fn map_dma(&self, allocation: &RawAllocation, len: usize) -> Result<ScatterTable>;

    fn unmap_dma(&self, allocation: &RawAllocation);

    /// Optional capabilities this backend implements.
    fn capabilities(&self) -> HeapCaps {
        HeapCaps::empty()
    }

    fn map_kernel(&self, _allocation: &RawAllocation) -> Result<KernelAddr> {
        Err(IonError::unsupported("map_kernel", "backend"))
    }

    fn unmap_kernel(&self, _allocation: &RawAllocation) {}

    /// Map the whole of `region` eagerly.
    fn map_user(&self, _allocation: &RawAllocation, _region: &UserRegion) -> Result<()> {
        Err(IonError::unsupported("map_user", "backend"))
    }

    /// Install one page of a fault-driven mapping.
    fn insert_user_page(
        &self,
        _allocation: &RawAllocation,
        _region: &UserRegion,
        _page: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Drop every installed page of `region` so the next access faults.
    fn zap_user_region(&self, _region: &UserRegion) {}

    fn phys(&self, _allocation: &RawAllocation) -> Result<(u64, usize)> {
        Err(IonError::unsupported("phys", "backend"))
    }

    /// Flush the listed pages from the CPU cache ahead of device access.
    fn sync_pages_for_device(&self, _allocation: &RawAllocation, _pages: &[usize]) {}

    /// Whole-buffer cache maintenance ahead of device access.
    fn sync_for_device(&self, _allocation: &RawAllocation, _table: &ScatterTable) {}

    fn shrink_hint(&self) -> Option<ShrinkHint> {
        None
    }
}

/// What is left of a buffer once its last reference is gone.
pub(crate) struct BufferRemains {
    pub(crate) id: BufferId,
    pub(crate) size: usize,
    pub(crate) raw: RawAllocation,
    pub(crate) kernel_mapped: bool,
}

/// State shared between a heap and its deferred-free worker.
pub(crate) struct HeapCore {
    pub(crate) descriptor: HeapDescriptor,
    pub(crate) backend: Arc<dyn HeapBackend>,
    pub(crate) used: AtomicUsize,
    pub(crate) metrics: Arc<DeviceMetrics>,
}

impl HeapCore {
    /// Release backend resources for a dead buffer.
    pub(crate) fn destroy(&self, remains: BufferRemains) {
        let BufferRemains {
            id,
            size,
            raw,
            kernel_mapped,
        } = remains;
        self.teardown(raw, kernel_mapped);
        self.used.fetch_sub(size, Ordering::Relaxed);
        DeviceMetrics::inc(&self.metrics.buffers_destroyed);
        tracing::debug!(heap = %self.descriptor.name, buffer = %id, len = size, "buffer destroyed");
    }

    /// `destroy` for buffers coming off the deferred list. A panicking
    /// backend is contained and counted; the buffer leaves the heap's
    /// accounting either way. Returns whether the teardown completed.
    pub(crate) fn destroy_deferred(&self, remains: BufferRemains) -> bool {
        let BufferRemains {
            id,
            size,
            raw,
            kernel_mapped,
        } = remains;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.teardown(raw, kernel_mapped)));
        self.used.fetch_sub(size, Ordering::Relaxed);
        if outcome.is_ok() {
            DeviceMetrics::inc(&self.metrics.buffers_destroyed);
            tracing::debug!(heap = %self.descriptor.name, buffer = %id, len = size, "buffer destroyed");
            true
        } else {
            DeviceMetrics::inc(&self.metrics.deferred_failures);
            tracing::error!(
                heap = %self.descriptor.name,
                buffer = %id,
                len = size,
                "backend panicked during deferred free; continuing"
            );
            false
        }
    }

    fn teardown(&self, raw: RawAllocation, kernel_mapped: bool) {
        if kernel_mapped {
            self.backend.unmap_kernel(&raw);
        }
        self.backend.unmap_dma(&raw);
        self.backend.free(raw);
    }
}

/// A heap registered with a device.
pub struct Heap {
    core: Arc<HeapCore>,
    deferred: Option<DeferredFreeList>,
}

impl Heap {
    pub(crate) fn register(
        descriptor: HeapDescriptor,
        backend: Arc<dyn HeapBackend>,
        metrics: Arc<DeviceMetrics>,
    ) -> Result<Self> {
        let defer = descriptor.flags.contains(HeapFlags::DEFER_FREE);
        let core = Arc::new(HeapCore {
            descriptor,
            backend,
            used: AtomicUsize::new(0),
            metrics,
        });
        let deferred = if defer {
            Some(DeferredFreeList::spawn(Arc::clone(&core))?)
        } else {
            None
        };
        Ok(Self { core, deferred })
    }

    #[must_use]
    pub fn descriptor(&self) -> &HeapDescriptor {
        &self.core.descriptor
    }

    #[must_use]
    pub fn id(&self) -> HeapId {
        self.core.descriptor.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.descriptor.name
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.core.descriptor.kind
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.core.descriptor.priority
    }

    #[must_use]
    pub fn mask_bit(&self) -> u32 {
        self.core.descriptor.mask_bit()
    }

    /// Bytes currently held by live or not-yet-destroyed buffers.
    #[must_use]
    pub fn used(&self) -> usize {
        self.core.used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn capabilities(&self) -> HeapCaps {
        self.core.backend.capabilities()
    }

    #[must_use]
    pub fn defers_free(&self) -> bool {
        self.deferred.is_some()
    }

    /// Bytes queued for deferred destruction.
    #[must_use]
    pub fn pending_free_bytes(&self) -> usize {
        self.deferred.as_ref().map_or(0, DeferredFreeList::pending_bytes)
    }

    /// Buffers queued for deferred destruction.
    #[must_use]
    pub fn pending_free_buffers(&self) -> usize {
        self.deferred
            .as_ref()
            .map_or(0, DeferredFreeList::pending_buffers)
    }

    /// Synchronously destroy everything queued on the deferred list.
    /// Returns the number of buffers destroyed.
    pub fn drain_deferred(&self) -> usize {
        self.deferred
            .as_ref()
            .map_or(0, |list| list.drain(&self.core))
    }

    pub(crate) fn backend(&self) -> &dyn HeapBackend {
        self.core.backend.as_ref()
    }

    pub(crate) fn require(&self, cap: HeapCaps, op: &'static str) -> Result<()> {
        if self.capabilities().contains(cap) {
            Ok(())
        } else {
            Err(IonError::unsupported(op, self.name()))
        }
    }

    pub(crate) fn charge(&self, len: usize) {
        self.core.used.fetch_add(len, Ordering::Relaxed);
    }

    /// Tear down a dead buffer, on the worker if this heap defers frees.
    pub(crate) fn release(&self, remains: BufferRemains) {
        match &self.deferred {
            Some(list) => list.enqueue(&self.core, remains),
            None => self.core.destroy(remains),
        }
    }

    /// Stop the worker after it finishes the queue. Later releases are
    /// destroyed synchronously.
    pub(crate) fn shutdown(&self) {
        if let Some(list) = &self.deferred {
            list.shutdown(&self.core);
        }
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("descriptor", &self.core.descriptor)
            .field("used", &self.used())
            .field("deferred", &self.defers_free())
            .finish()
    }
}
