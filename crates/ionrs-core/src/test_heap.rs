//! Capacity-bounded backend for unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{IonError, Result};
use crate::flags::HeapCaps;
use crate::heap::{
    AllocationRequest, HeapBackend, KernelAddr, RawAllocation, ScatterTable, UserRegion,
};

struct Block {
    phys: u64,
    len: usize,
}

pub(crate) struct TestHeap {
    capacity: usize,
    used: Mutex<usize>,
    caps: HeapCaps,
    next_phys: AtomicU64,
    pub(crate) frees: AtomicUsize,
    /// The next this many `free` calls panic.
    pub(crate) panicking_frees: AtomicUsize,
    pub(crate) kernel_maps: AtomicUsize,
    pub(crate) kernel_unmaps: AtomicUsize,
    pub(crate) zaps: AtomicUsize,
    pub(crate) inserted_pages: Mutex<Vec<usize>>,
    pub(crate) synced_pages: Mutex<Vec<usize>>,
}

impl TestHeap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::with_caps(capacity, HeapCaps::all())
    }

    pub(crate) fn with_caps(capacity: usize, caps: HeapCaps) -> Self {
        Self {
            capacity,
            used: Mutex::new(0),
            caps,
            next_phys: AtomicU64::new(0x1000_0000),
            frees: AtomicUsize::new(0),
            panicking_frees: AtomicUsize::new(0),
            kernel_maps: AtomicUsize::new(0),
            kernel_unmaps: AtomicUsize::new(0),
            zaps: AtomicUsize::new(0),
            inserted_pages: Mutex::new(Vec::new()),
            synced_pages: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn used(&self) -> usize {
        *self.used.lock()
    }

    fn block(raw: &RawAllocation) -> Result<&Block> {
        raw.downcast_ref::<Block>()
            .ok_or_else(|| IonError::backend("test", "foreign allocation"))
    }
}

impl HeapBackend for TestHeap {
    fn allocate(&self, request: &AllocationRequest) -> Result<RawAllocation> {
        let mut used = self.used.lock();
        if *used + request.len > self.capacity {
            return Err(IonError::OutOfMemory {
                len: request.len,
                heap_mask: 0,
            });
        }
        *used += request.len;
        let phys = self
            .next_phys
            .fetch_add(request.len as u64, Ordering::Relaxed);
        Ok(RawAllocation::new(Block {
            phys,
            len: request.len,
        }))
    }

    fn free(&self, allocation: RawAllocation) {
        if self
            .panicking_frees
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("test backend failed to free");
        }
        if let Ok(block) = allocation.into_inner::<Block>() {
            *self.used.lock() -= block.len;
            self.frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn map_dma(&self, allocation: &RawAllocation, _len: usize) -> Result<ScatterTable> {
        let block = Self::block(allocation)?;
        Ok(ScatterTable::from_runs([(block.phys, block.len)]))
    }

    fn unmap_dma(&self, _allocation: &RawAllocation) {}

    fn capabilities(&self) -> HeapCaps {
        self.caps
    }

    fn map_kernel(&self, allocation: &RawAllocation) -> Result<KernelAddr> {
        let block = Self::block(allocation)?;
        self.kernel_maps.fetch_add(1, Ordering::Relaxed);
        Ok(KernelAddr(block.phys as usize))
    }

    fn unmap_kernel(&self, _allocation: &RawAllocation) {
        self.kernel_unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn map_user(&self, _allocation: &RawAllocation, _region: &UserRegion) -> Result<()> {
        Ok(())
    }

    fn insert_user_page(
        &self,
        _allocation: &RawAllocation,
        _region: &UserRegion,
        page: usize,
    ) -> Result<()> {
        self.inserted_pages.lock().push(page);
        Ok(())
    }

    fn zap_user_region(&self, _region: &UserRegion) {
        self.zaps.fetch_add(1, Ordering::Relaxed);
    }

    fn phys(&self, allocation: &RawAllocation) -> Result<(u64, usize)> {
        let block = Self::block(allocation)?;
        Ok((block.phys, block.len))
    }

    fn sync_pages_for_device(&self, _allocation: &RawAllocation, pages: &[usize]) {
        self.synced_pages.lock().extend_from_slice(pages);
    }
}
