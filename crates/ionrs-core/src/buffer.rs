//! The shared memory allocation unit.
//!
//! A buffer is always held as `Arc<Buffer>`: handles, sharing objects, CPU
//! access guards and user mappings each own one strong reference, and the
//! device registry only a weak one. Dropping the last strong reference
//! unregisters the buffer and hands its backend storage to the heap for
//! synchronous or deferred teardown.
//!
//! Mapping state, the dirty page table and the user region list live behind
//! the buffer's own lock so slow backend map calls never run under a client
//! or device lock.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::{IonError, Result};
use crate::flags::{BufferFlags, HeapCaps};
use crate::heap::{
    AllocationRequest, BufferRemains, Heap, HeapId, KernelAddr, RawAllocation, RegionId,
    ScatterTable, UserRegion,
};
use crate::metrics::DeviceMetrics;
use crate::registry::BufferRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Who last held a handle to a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerInfo {
    pub pid: Option<u32>,
    pub name: String,
}

/// One bit per page, set when a user fault installs the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyPages {
    words: Vec<u64>,
    pages: usize,
}

impl DirtyPages {
    #[must_use]
    pub fn new(pages: usize) -> Self {
        Self {
            words: vec![0; pages.div_ceil(64)],
            pages,
        }
    }

    pub fn mark(&mut self, page: usize) {
        if page < self.pages {
            self.words[page / 64] |= 1 << (page % 64);
        }
    }

    #[must_use]
    pub fn is_dirty(&self, page: usize) -> bool {
        page < self.pages && self.words[page / 64] & (1 << (page % 64)) != 0
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Clear the table, returning the indices that were set.
    pub fn take(&mut self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.count());
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            let mut bits = std::mem::take(word);
            while bits != 0 {
                out.push(word_idx * 64 + bits.trailing_zeros() as usize);
                bits &= bits - 1;
            }
        }
        out
    }
}

/// Everything guarded by the buffer lock.
#[derive(Debug, Default)]
pub(crate) struct BufferState {
    pub(crate) kmap_cnt: usize,
    pub(crate) vaddr: Option<KernelAddr>,
    pub(crate) dirty: Option<DirtyPages>,
    pub(crate) regions: Vec<UserRegion>,
    pub(crate) handle_count: usize,
    pub(crate) last_owner: Option<OwnerInfo>,
}

pub struct Buffer {
    id: BufferId,
    heap: Arc<Heap>,
    size: usize,
    align: usize,
    flags: BufferFlags,
    page_count: usize,
    sg_table: ScatterTable,
    /// Taken by `Drop`.
    raw: Option<RawAllocation>,
    registry: Weak<BufferRegistry>,
    metrics: Arc<DeviceMetrics>,
    state: Mutex<BufferState>,
}

impl Buffer {
    /// Allocate from `heap` and register the result. `request.len` must
    /// already be page aligned.
    pub(crate) fn create(
        heap: &Arc<Heap>,
        registry: &Arc<BufferRegistry>,
        metrics: &Arc<DeviceMetrics>,
        request: AllocationRequest,
        page_size: usize,
    ) -> Result<Arc<Self>> {
        let mut flags = request.flags;
        flags.set(BufferFlags::DEFERRED_FREE, heap.defers_free());
        let request = AllocationRequest { flags, ..request };

        let backend = heap.backend();
        let raw = match backend.allocate(&request) {
            Ok(raw) => raw,
            Err(err) if heap.defers_free() => {
                tracing::debug!(heap = %heap.name(), len = request.len, error = %err, "allocation failed; draining deferred frees and retrying");
                heap.drain_deferred();
                backend.allocate(&request)?
            }
            Err(err) => return Err(err),
        };

        let sg_table = match backend.map_dma(&raw, request.len) {
            Ok(table) => table,
            Err(err) => {
                backend.free(raw);
                return Err(err);
            }
        };

        let page_count = request.len.div_ceil(page_size);
        let state = BufferState {
            dirty: flags
                .faults_user_mappings()
                .then(|| DirtyPages::new(page_count)),
            ..BufferState::default()
        };

        let buffer = Arc::new(Self {
            id: registry.next_id(),
            heap: Arc::clone(heap),
            size: request.len,
            align: request.align,
            flags,
            page_count,
            sg_table,
            raw: Some(raw),
            registry: Arc::downgrade(registry),
            metrics: Arc::clone(metrics),
            state: Mutex::new(state),
        });
        heap.charge(buffer.size);
        registry.insert(&buffer)?;
        tracing::debug!(heap = %heap.name(), buffer = %buffer.id, len = buffer.size, ?flags, "buffer created");
        Ok(buffer)
    }

    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    #[must_use]
    pub fn heap_id(&self) -> HeapId {
        self.heap.id()
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub fn sg_table(&self) -> &ScatterTable {
        &self.sg_table
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.state.lock().handle_count
    }

    #[must_use]
    pub fn kmap_count(&self) -> usize {
        self.state.lock().kmap_cnt
    }

    #[must_use]
    pub fn last_owner(&self) -> Option<OwnerInfo> {
        self.state.lock().last_owner.clone()
    }

    /// Strong references, excluding the caller's own.
    #[must_use]
    pub fn ref_count(this: &Arc<Self>) -> usize {
        Arc::strong_count(this).saturating_sub(1)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    fn raw(&self) -> Result<&RawAllocation> {
        self.raw
            .as_ref()
            .ok_or_else(|| IonError::invariant(format!("buffer {} has no storage", self.id)))
    }

    pub(crate) fn add_handle(&self) {
        self.state.lock().handle_count += 1;
    }

    pub(crate) fn remove_handle(&self, owner: &OwnerInfo) {
        let mut state = self.state.lock();
        if state.handle_count == 0 {
            drop(state);
            tracing::warn!(buffer = %self.id, "handle count underflow");
            return;
        }
        state.handle_count -= 1;
        if state.handle_count == 0 {
            state.last_owner = Some(owner.clone());
        }
    }

    /// Take a buffer-level kernel mapping, creating it on first use.
    pub(crate) fn kmap_get(&self, state: &mut BufferState) -> Result<KernelAddr> {
        if state.kmap_cnt > 0 {
            if let Some(addr) = state.vaddr {
                state.kmap_cnt += 1;
                return Ok(addr);
            }
            return Err(IonError::invariant(format!(
                "buffer {} has mappings but no address",
                self.id
            )));
        }
        self.heap.require(HeapCaps::MAP_KERNEL, "map_kernel")?;
        let addr = self.heap.backend().map_kernel(self.raw()?)?;
        state.vaddr = Some(addr);
        state.kmap_cnt = 1;
        DeviceMetrics::inc(&self.metrics.kernel_maps);
        Ok(addr)
    }

    /// Drop one buffer-level kernel mapping, unmapping on the last.
    pub(crate) fn kmap_put(&self, state: &mut BufferState) {
        match state.kmap_cnt {
            0 => tracing::warn!(buffer = %self.id, "unbalanced kernel unmap"),
            1 => {
                state.kmap_cnt = 0;
                state.vaddr = None;
                if let Some(raw) = &self.raw {
                    self.heap.backend().unmap_kernel(raw);
                }
            }
            _ => state.kmap_cnt -= 1,
        }
    }

    pub(crate) fn phys(&self) -> Result<(u64, usize)> {
        self.heap.require(HeapCaps::PHYS, "phys")?;
        self.heap.backend().phys(self.raw()?)
    }

    /// Whole-buffer cache maintenance ahead of device access.
    pub(crate) fn sync_whole_for_device(&self) -> Result<()> {
        self.heap
            .backend()
            .sync_for_device(self.raw()?, &self.sg_table);
        Ok(())
    }

    /// Flush dirty pages and zap every user region so the next CPU access
    /// faults again. No-op for buffers without fault-driven mappings.
    pub(crate) fn sync_dirty_for_device(&self) -> Result<()> {
        if !self.flags.faults_user_mappings() {
            return Ok(());
        }
        let raw = self.raw()?;
        let backend = self.heap.backend();
        let mut state = self.state.lock();
        let pages = state.dirty.as_mut().map(DirtyPages::take).unwrap_or_default();
        if !pages.is_empty() {
            backend.sync_pages_for_device(raw, &pages);
        }
        for region in &state.regions {
            backend.zap_user_region(region);
        }
        tracing::debug!(buffer = %self.id, flushed = pages.len(), regions = state.regions.len(), "synced for device");
        Ok(())
    }

    /// Attach a user mapping: tracked for lazy faults, or mapped eagerly.
    pub(crate) fn attach_region(&self, region: UserRegion) -> Result<()> {
        self.heap.require(HeapCaps::MAP_USER, "map_user")?;
        let raw = self.raw()?;
        let mut state = self.state.lock();
        if self.flags.faults_user_mappings() {
            state.regions.push(region);
            Ok(())
        } else {
            self.heap.backend().map_user(raw, &region)
        }
    }

    pub(crate) fn detach_region(&self, region: RegionId) {
        let mut state = self.state.lock();
        state.regions.retain(|r| r.id != region);
    }

    /// Install one page of a fault-driven mapping and mark it dirty.
    pub(crate) fn fault(&self, region: RegionId, page: usize) -> Result<()> {
        if !self.flags.faults_user_mappings() {
            return Err(IonError::invalid(format!(
                "buffer {} is not mapped lazily",
                self.id
            )));
        }
        if page >= self.page_count {
            return Err(IonError::invalid(format!(
                "page {page} beyond buffer {} ({} pages)",
                self.id, self.page_count
            )));
        }
        let raw = self.raw()?;
        let mut state = self.state.lock();
        let Some(region) = state.regions.iter().find(|r| r.id == region).copied() else {
            return Err(IonError::invalid(format!(
                "region {} is not attached to buffer {}",
                region.0, self.id
            )));
        };
        if let Some(dirty) = state.dirty.as_mut() {
            dirty.mark(page);
        }
        self.heap.backend().insert_user_page(raw, &region, page)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let this: *const Self = self;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id, this);
        }
        let state = self.state.get_mut();
        let kernel_mapped = state.kmap_cnt > 0;
        if kernel_mapped {
            tracing::error!(buffer = %self.id, kmap_cnt = state.kmap_cnt, "buffer destroyed with an active kernel mapping");
            debug_assert!(!kernel_mapped, "buffer destroyed with an active kernel mapping");
        }
        let Some(raw) = self.raw.take() else {
            return;
        };
        self.heap.release(BufferRemains {
            id: self.id,
            size: self.size,
            raw,
            kernel_mapped,
        });
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("heap", &self.heap.name())
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A validated buffer with its lock held.
pub struct LockedBuffer<'a> {
    buffer: &'a Buffer,
    state: MutexGuard<'a, BufferState>,
}

impl<'a> LockedBuffer<'a> {
    pub(crate) fn new(buffer: &'a Buffer) -> Self {
        Self {
            buffer,
            state: buffer.lock_state(),
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        self.buffer
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.state.handle_count
    }

    #[must_use]
    pub fn kmap_count(&self) -> usize {
        self.state.kmap_cnt
    }

    #[must_use]
    pub fn kernel_addr(&self) -> Option<KernelAddr> {
        self.state.vaddr
    }

    #[must_use]
    pub fn dirty_pages(&self) -> Option<&DirtyPages> {
        self.state.dirty.as_ref()
    }

    #[must_use]
    pub fn regions(&self) -> &[UserRegion] {
        &self.state.regions
    }
}
