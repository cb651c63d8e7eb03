//! Capacity-bounded simulation backend.
//!
//! Allocations are bookkeeping only: each one receives a synthetic physical
//! address from a bump pointer and counts against a byte budget. Every
//! optional hook records what it was asked to do so tests can assert on the
//! calls the device makes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use ionrs_core::{
    AllocationRequest, HeapBackend, HeapCaps, IonError, KernelAddr, RawAllocation, Result,
    ScatterTable, ShrinkHint, UserRegion,
};

/// Default base of the synthetic physical address range.
pub const DEFAULT_PHYS_BASE: u64 = 0x8000_0000;

/// Calls observed by a [`SimHeap`].
#[derive(Debug, Default)]
pub struct SimStats {
    pub allocations: AtomicUsize,
    pub frees: AtomicUsize,
    pub kernel_maps: AtomicUsize,
    pub kernel_unmaps: AtomicUsize,
    pub user_maps: AtomicUsize,
    pub zaps: AtomicUsize,
    pub whole_syncs: AtomicUsize,
    pub inserted_pages: Mutex<Vec<usize>>,
    pub synced_pages: Mutex<Vec<usize>>,
}

impl SimStats {
    #[must_use]
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }

    fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct SimBlock {
    phys: u64,
    len: usize,
}

struct Arena {
    used: usize,
    next_phys: u64,
}

pub struct SimHeapBuilder {
    name: String,
    capacity: usize,
    caps: HeapCaps,
    phys_base: u64,
    free_delay: Option<Duration>,
    shrink_hint: Option<ShrinkHint>,
}

impl SimHeapBuilder {
    fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            caps: HeapCaps::all(),
            phys_base: DEFAULT_PHYS_BASE,
            free_delay: None,
            shrink_hint: None,
        }
    }

    #[must_use]
    pub fn caps(mut self, caps: HeapCaps) -> Self {
        self.caps = caps;
        self
    }

    #[must_use]
    pub fn phys_base(mut self, base: u64) -> Self {
        self.phys_base = base;
        self
    }

    /// Sleep this long inside every `free`, to model slow teardown.
    #[must_use]
    pub fn free_delay(mut self, delay: Duration) -> Self {
        self.free_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn shrink_hint(mut self, hint: ShrinkHint) -> Self {
        self.shrink_hint = Some(hint);
        self
    }

    #[must_use]
    pub fn build(self) -> SimHeap {
        SimHeap {
            name: self.name,
            capacity: self.capacity,
            caps: self.caps,
            arena: Mutex::new(Arena {
                used: 0,
                next_phys: self.phys_base,
            }),
            free_delay: self.free_delay,
            failures_pending: AtomicUsize::new(0),
            fail_map_dma: AtomicBool::new(false),
            shrink_hint: Mutex::new(self.shrink_hint),
            stats: SimStats::default(),
        }
    }
}

pub struct SimHeap {
    name: String,
    capacity: usize,
    caps: HeapCaps,
    arena: Mutex<Arena>,
    free_delay: Option<Duration>,
    failures_pending: AtomicUsize,
    fail_map_dma: AtomicBool,
    shrink_hint: Mutex<Option<ShrinkHint>>,
    stats: SimStats,
}

impl SimHeap {
    /// A heap with every optional capability.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::builder(name, capacity).build()
    }

    #[must_use]
    pub fn builder(name: impl Into<String>, capacity: usize) -> SimHeapBuilder {
        SimHeapBuilder::new(name, capacity)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by backend allocations not yet freed.
    #[must_use]
    pub fn used(&self) -> usize {
        self.arena.lock().used
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.used()
    }

    #[must_use]
    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Fail the next `count` allocations with a non-OOM backend error.
    pub fn fail_next_allocations(&self, count: usize) {
        self.failures_pending.store(count, Ordering::Relaxed);
    }

    /// Make map-for-dma fail until cleared.
    pub fn set_fail_map_dma(&self, fail: bool) {
        self.fail_map_dma.store(fail, Ordering::Relaxed);
    }

    pub fn set_shrink_hint(&self, hint: Option<ShrinkHint>) {
        *self.shrink_hint.lock() = hint;
    }

    fn block<'a>(&self, raw: &'a RawAllocation) -> Result<&'a SimBlock> {
        raw.downcast_ref::<SimBlock>()
            .ok_or_else(|| IonError::backend(self.name.clone(), "allocation not made by this heap"))
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl HeapBackend for SimHeap {
    fn allocate(&self, request: &AllocationRequest) -> Result<RawAllocation> {
        if self.take_injected_failure() {
            return Err(IonError::backend(self.name.clone(), "injected allocation failure"));
        }
        let mut arena = self.arena.lock();
        let fits = arena
            .used
            .checked_add(request.len)
            .is_some_and(|total| total <= self.capacity);
        if !fits {
            return Err(IonError::OutOfMemory {
                len: request.len,
                heap_mask: 0,
            });
        }
        let align = request.align.max(1) as u64;
        let phys = arena.next_phys.next_multiple_of(align);
        arena.next_phys = phys + request.len as u64;
        arena.used += request.len;
        drop(arena);

        SimStats::inc(&self.stats.allocations);
        tracing::trace!(heap = %self.name, phys, len = request.len, "sim allocation");
        Ok(RawAllocation::new(SimBlock {
            phys,
            len: request.len,
        }))
    }

    fn free(&self, allocation: RawAllocation) {
        let Ok(block) = allocation.into_inner::<SimBlock>() else {
            tracing::error!(heap = %self.name, "free of a foreign allocation");
            return;
        };
        if let Some(delay) = self.free_delay {
            thread::sleep(delay);
        }
        self.arena.lock().used -= block.len;
        SimStats::inc(&self.stats.frees);
    }

    fn map_dma(&self, allocation: &RawAllocation, len: usize) -> Result<ScatterTable> {
        if self.fail_map_dma.load(Ordering::Relaxed) {
            return Err(IonError::backend(self.name.clone(), "injected map_dma failure"));
        }
        let block = self.block(allocation)?;
        Ok(ScatterTable::from_runs([(block.phys, len.min(block.len))]))
    }

    fn unmap_dma(&self, _allocation: &RawAllocation) {}

    fn capabilities(&self) -> HeapCaps {
        self.caps
    }

    fn map_kernel(&self, allocation: &RawAllocation) -> Result<KernelAddr> {
        let block = self.block(allocation)?;
        SimStats::inc(&self.stats.kernel_maps);
        Ok(KernelAddr(block.phys as usize))
    }

    fn unmap_kernel(&self, _allocation: &RawAllocation) {
        SimStats::inc(&self.stats.kernel_unmaps);
    }

    fn map_user(&self, allocation: &RawAllocation, region: &UserRegion) -> Result<()> {
        let block = self.block(allocation)?;
        if region.len > block.len {
            return Err(IonError::invalid(format!(
                "region of {} bytes exceeds allocation of {}",
                region.len, block.len
            )));
        }
        SimStats::inc(&self.stats.user_maps);
        Ok(())
    }

    fn insert_user_page(
        &self,
        _allocation: &RawAllocation,
        _region: &UserRegion,
        page: usize,
    ) -> Result<()> {
        self.stats.inserted_pages.lock().push(page);
        Ok(())
    }

    fn zap_user_region(&self, _region: &UserRegion) {
        SimStats::inc(&self.stats.zaps);
    }

    fn phys(&self, allocation: &RawAllocation) -> Result<(u64, usize)> {
        let block = self.block(allocation)?;
        Ok((block.phys, block.len))
    }

    fn sync_pages_for_device(&self, _allocation: &RawAllocation, pages: &[usize]) {
        self.stats.synced_pages.lock().extend_from_slice(pages);
    }

    fn sync_for_device(&self, _allocation: &RawAllocation, _table: &ScatterTable) {
        SimStats::inc(&self.stats.whole_syncs);
    }

    fn shrink_hint(&self) -> Option<ShrinkHint> {
        *self.shrink_hint.lock()
    }
}
