//! The device: heap and client registries plus the allocation engine.
//!
//! Lock order, coarse to fine: the registry `RwLock` (heaps and clients),
//! a client's handle lock, a buffer's state lock, a heap's deferred-free
//! list. The buffer registry has its own lock and is only taken at buffer
//! creation and destruction. Buffer references released while a client
//! lock is held are collected and dropped after the lock is gone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::RwLock;

use crate::buffer::{Buffer, LockedBuffer};
use crate::client::{Client, ClientId};
use crate::config::DeviceConfig;
use crate::control::CustomHandler;
use crate::error::{IonError, Result};
use crate::flags::BufferFlags;
use crate::handle::{HandleId, HandleTable};
use crate::heap::{
    AllocationRequest, Heap, HeapBackend, HeapDescriptor, KernelAddr, MAX_HEAPS, ScatterTable,
};
use crate::metrics::{DeviceMetrics, MetricsSnapshot};
use crate::reclaim::{ReclaimController, Terminator};
use crate::registry::BufferRegistry;
use crate::share::{ExporterId, FdTable};
use crate::slots::SlotKey;

pub(crate) struct Registry {
    /// Sorted by descending priority; equal priorities keep registration order.
    pub(crate) heaps: Vec<Arc<Heap>>,
    /// Ordered by creation.
    pub(crate) clients: BTreeMap<ClientId, Arc<Client>>,
    shut_down: bool,
}

/// Builder for a [`Device`].
#[derive(Default)]
pub struct DeviceBuilder {
    config: DeviceConfig,
    terminator: Option<Arc<dyn Terminator>>,
    custom: Option<Arc<dyn CustomHandler>>,
    fds: Option<Arc<FdTable>>,
}

impl DeviceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable reclaim; `terminator` delivers the termination signal.
    #[must_use]
    pub fn reclaim(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    #[must_use]
    pub fn custom_handler(mut self, handler: Arc<dyn CustomHandler>) -> Self {
        self.custom = Some(handler);
        self
    }

    /// Install exported descriptors into a table shared with other devices.
    #[must_use]
    pub fn descriptor_table(mut self, fds: Arc<FdTable>) -> Self {
        self.fds = Some(fds);
        self
    }

    pub fn build(self) -> Result<Device> {
        self.config.validate()?;
        let exporter = ExporterId::next();
        let fds = self
            .fds
            .unwrap_or_else(|| Arc::new(FdTable::new(self.config.max_descriptors)));
        let reclaim = self
            .terminator
            .map(|t| ReclaimController::new(t, self.config.reclaim));
        tracing::info!(
            device = exporter.0,
            page_size = self.config.page_size,
            reclaim = reclaim.is_some(),
            "device created"
        );
        Ok(Device {
            exporter,
            config: self.config,
            registry: RwLock::new(Registry {
                heaps: Vec::new(),
                clients: BTreeMap::new(),
                shut_down: false,
            }),
            buffers: Arc::new(BufferRegistry::new()),
            metrics: Arc::new(DeviceMetrics::new()),
            reclaim,
            custom: self.custom,
            fds,
            next_client: AtomicU64::new(0),
            region_ids: AtomicU64::new(0),
        })
    }
}

pub struct Device {
    pub(crate) exporter: ExporterId,
    pub(crate) config: DeviceConfig,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) buffers: Arc<BufferRegistry>,
    pub(crate) metrics: Arc<DeviceMetrics>,
    pub(crate) reclaim: Option<ReclaimController>,
    pub(crate) custom: Option<Arc<dyn CustomHandler>>,
    pub(crate) fds: Arc<FdTable>,
    next_client: AtomicU64,
    region_ids: AtomicU64,
}

impl Device {
    /// A device without reclaim or custom commands.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        DeviceBuilder::new().config(config).build()
    }

    #[must_use]
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn exporter_id(&self) -> ExporterId {
        self.exporter
    }

    #[must_use]
    pub fn descriptors(&self) -> &Arc<FdTable> {
        &self.fds
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register a heap. Ids must be unique and below 32.
    pub fn add_heap(
        &self,
        descriptor: HeapDescriptor,
        backend: Arc<dyn HeapBackend>,
    ) -> Result<Arc<Heap>> {
        if descriptor.id >= MAX_HEAPS {
            return Err(IonError::invalid(format!(
                "heap id {} out of range (max {})",
                descriptor.id,
                MAX_HEAPS - 1
            )));
        }
        let mut registry = self.registry.write();
        if registry.shut_down {
            return Err(IonError::invalid("device is shut down"));
        }
        if registry.heaps.iter().any(|h| h.id() == descriptor.id) {
            return Err(IonError::invalid(format!(
                "heap id {} already registered",
                descriptor.id
            )));
        }
        let heap = Arc::new(Heap::register(
            descriptor,
            backend,
            Arc::clone(&self.metrics),
        )?);
        let pos = registry
            .heaps
            .iter()
            .position(|h| h.priority() < heap.priority())
            .unwrap_or(registry.heaps.len());
        registry.heaps.insert(pos, Arc::clone(&heap));
        tracing::info!(
            heap = %heap.name(),
            id = heap.id(),
            priority = heap.priority(),
            kind = ?heap.kind(),
            deferred = heap.defers_free(),
            "heap registered"
        );
        Ok(heap)
    }

    /// Registered heaps in allocation order.
    #[must_use]
    pub fn heaps(&self) -> Vec<Arc<Heap>> {
        self.registry.read().heaps.clone()
    }

    #[must_use]
    pub fn heap(&self, id: u32) -> Option<Arc<Heap>> {
        self.registry
            .read()
            .heaps
            .iter()
            .find(|h| h.id() == id)
            .cloned()
    }

    /// Open a session. `pid` is `None` for in-kernel consumers.
    pub fn create_client(&self, name: impl Into<String>, pid: Option<u32>) -> Result<Arc<Client>> {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed) + 1);
        let client = Arc::new(Client::new(id, self.exporter.0, name.into(), pid));
        let mut registry = self.registry.write();
        if registry.shut_down {
            return Err(IonError::invalid("device is shut down"));
        }
        registry.clients.insert(id, Arc::clone(&client));
        drop(registry);
        tracing::debug!(client = %id, pid = ?pid, name = %client.name(), "client created");
        Ok(client)
    }

    /// End a session, releasing every handle regardless of its count.
    pub fn destroy_client(&self, client: &Client) -> Result<()> {
        self.check_client(client)?;
        let removed = self.registry.write().clients.remove(&client.id());
        if removed.is_none() {
            return Err(IonError::invalid(format!(
                "client {} already destroyed",
                client.id()
            )));
        }
        let owner = client.owner_info();
        let released: Vec<Arc<Buffer>> = {
            let mut handles = client.lock_handles();
            client.mark_closed();
            handles
                .drain()
                .into_iter()
                .map(|entry| entry.retire(&owner))
                .collect()
        };
        tracing::debug!(client = %client.id(), pid = ?client.pid(), handles = released.len(), "client destroyed");
        drop(released);
        Ok(())
    }

    /// Live clients in creation order.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.registry.read().clients.values().cloned().collect()
    }

    /// The first (oldest) client registered for `pid`.
    #[must_use]
    pub fn client_for_pid(&self, pid: u32) -> Option<Arc<Client>> {
        self.registry
            .read()
            .clients
            .values()
            .find(|c| c.pid() == Some(pid))
            .cloned()
    }

    /// Allocate `len` bytes (rounded up to the page size) from the highest
    /// priority heap in `heap_mask` that can satisfy the request.
    pub fn allocate(
        &self,
        client: &Client,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: BufferFlags,
    ) -> Result<HandleId> {
        self.check_client(client)?;
        if len == 0 {
            tracing::warn!(client = %client.id(), "zero-length allocation");
            return Err(IonError::invalid("zero-length allocation"));
        }
        let len = self
            .config
            .page_align(len)
            .ok_or_else(|| IonError::invalid(format!("length {len} overflows page rounding")))?;
        tracing::debug!(client = %client.id(), pid = ?client.pid(), len, align, heap_mask, ?flags, "allocation request");

        let request = AllocationRequest { len, align, flags };
        let mut retries = 0u32;
        let buffer = loop {
            let err = match self.try_heaps(request, heap_mask) {
                Ok(buffer) => break buffer,
                Err(err) => err,
            };
            let reclaiming = matches!(err, IonError::OutOfMemory { .. })
                && self.shrink(heap_mask, 0, len).should_retry();
            if reclaiming
                && !client.fatal_signal_pending()
                && retries < self.config.reclaim.max_retries
            {
                retries += 1;
                DeviceMetrics::inc(&self.metrics.reclaim_waits);
                thread::sleep(self.config.reclaim.retry_sleep());
                continue;
            }
            DeviceMetrics::inc(&self.metrics.allocation_failures);
            if matches!(err, IonError::OutOfMemory { .. }) {
                tracing::error!(client = %client.id(), pid = ?client.pid(), len, heap_mask, retries, "allocation failed");
                self.log_heap_status();
            } else {
                tracing::debug!(client = %client.id(), len, heap_mask, error = %err, "allocation failed");
            }
            return Err(err);
        };

        self.shrink_on_hint(buffer.heap());
        let key = {
            let mut handles = client.lock_handles();
            (!client.is_closed()).then(|| handles.insert(Arc::clone(&buffer)))
        };
        let heap = buffer.heap().name().to_owned();
        drop(buffer);
        let Some(slot) = key else {
            return Err(IonError::invalid(format!(
                "client {} is closed",
                client.id()
            )));
        };
        DeviceMetrics::inc(&self.metrics.allocations);
        let handle = HandleId {
            client: client.id(),
            slot,
        };
        tracing::debug!(client = %client.id(), %handle, %heap, len, "allocated");
        Ok(handle)
    }

    fn try_heaps(&self, request: AllocationRequest, heap_mask: u32) -> Result<Arc<Buffer>> {
        let registry = self.registry.read();
        let mut last_err = None;
        for heap in registry.heaps.iter().filter(|h| heap_mask & h.mask_bit() != 0) {
            match Buffer::create(
                heap,
                &self.buffers,
                &self.metrics,
                request,
                self.config.page_size,
            ) {
                Ok(buffer) => return Ok(buffer),
                Err(err) => {
                    tracing::debug!(heap = %heap.name(), len = request.len, used = heap.used(), error = %err, "heap could not satisfy request");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            None => Err(IonError::NoMatchingHeap { heap_mask }),
            Some(IonError::OutOfMemory { .. }) => Err(IonError::OutOfMemory {
                len: request.len,
                heap_mask,
            }),
            Some(err) => Err(err),
        }
    }

    /// Drop one reference to `handle`, destroying the handle on the last.
    pub fn free(&self, client: &Client, handle: HandleId) -> Result<()> {
        let released = {
            let mut handles = client.lock_handles();
            let Some(slot) = self.slot_for(client, &handles, handle) else {
                drop(handles);
                return Err(self.invalid_handle(client, handle, "free"));
            };
            let Some(entry) = handles.get_mut(slot) else {
                return Err(IonError::invariant("validated handle vanished"));
            };
            entry.refs -= 1;
            if entry.refs > 0 {
                None
            } else {
                handles.remove(slot).map(|e| e.retire(&client.owner_info()))
            }
        };
        DeviceMetrics::inc(&self.metrics.frees);
        tracing::debug!(client = %client.id(), %handle, destroyed = released.is_some(), "handle freed");
        drop(released);
        Ok(())
    }

    /// Kernel CPU mapping through a handle, shared with every other handle
    /// on the same buffer.
    pub fn map_kernel(&self, client: &Client, handle: HandleId) -> Result<KernelAddr> {
        let mut handles = client.lock_handles();
        let Some(slot) = self.slot_for(client, &handles, handle) else {
            drop(handles);
            return Err(self.invalid_handle(client, handle, "map_kernel"));
        };
        let Some(entry) = handles.get_mut(slot) else {
            return Err(IonError::invariant("validated handle vanished"));
        };
        let buffer = Arc::clone(&entry.buffer);
        let mut state = buffer.lock_state();
        entry.kmap(&mut state)
    }

    pub fn unmap_kernel(&self, client: &Client, handle: HandleId) -> Result<()> {
        let mut handles = client.lock_handles();
        let Some(slot) = self.slot_for(client, &handles, handle) else {
            drop(handles);
            return Err(self.invalid_handle(client, handle, "unmap_kernel"));
        };
        let Some(entry) = handles.get_mut(slot) else {
            return Err(IonError::invariant("validated handle vanished"));
        };
        let buffer = Arc::clone(&entry.buffer);
        let mut state = buffer.lock_state();
        if entry.kunmap(&mut state) {
            Ok(())
        } else {
            Err(IonError::invalid(format!("{handle} is not mapped")))
        }
    }

    /// Physical address and length of a contiguous buffer.
    pub fn phys(&self, client: &Client, handle: HandleId) -> Result<(u64, usize)> {
        let buffer = self.buffer(client, handle)?;
        buffer.phys()
    }

    pub fn sg_table(&self, client: &Client, handle: HandleId) -> Result<ScatterTable> {
        Ok(self.buffer(client, handle)?.sg_table().clone())
    }

    /// The buffer behind a validated handle.
    pub fn buffer(&self, client: &Client, handle: HandleId) -> Result<Arc<Buffer>> {
        let handles = client.lock_handles();
        match self.slot_for(client, &handles, handle).and_then(|slot| handles.get(slot)) {
            Some(entry) => Ok(Arc::clone(&entry.buffer)),
            None => {
                drop(handles);
                Err(self.invalid_handle(client, handle, "lookup"))
            }
        }
    }

    /// Handle references held by `client` on `handle`.
    pub fn handle_refs(&self, client: &Client, handle: HandleId) -> Result<u32> {
        let handles = client.lock_handles();
        match self.slot_for(client, &handles, handle).and_then(|slot| handles.get(slot)) {
            Some(entry) => Ok(entry.refs),
            None => {
                drop(handles);
                Err(self.invalid_handle(client, handle, "lookup"))
            }
        }
    }

    /// Run `f` with the client lock and the buffer lock held.
    pub fn with_locked_buffer<R>(
        &self,
        client: &Client,
        handle: HandleId,
        f: impl FnOnce(&LockedBuffer<'_>) -> R,
    ) -> Result<R> {
        let handles = client.lock_handles();
        let Some(entry) = self.slot_for(client, &handles, handle).and_then(|slot| handles.get(slot))
        else {
            drop(handles);
            return Err(self.invalid_handle(client, handle, "lock_buffer"));
        };
        let locked = LockedBuffer::new(&entry.buffer);
        Ok(f(&locked))
    }

    /// Visit every buffer `client` holds a handle to, under the client lock.
    /// `f` must not call back into the device for the same client.
    /// Clients of other devices have nothing to visit.
    pub fn for_each_client_buffer(&self, client: &Client, mut f: impl FnMut(HandleId, &Buffer)) {
        if client.device() != self.exporter.0 {
            return;
        }
        let handles = client.lock_handles();
        for (slot, entry) in handles.iter() {
            f(
                HandleId {
                    client: client.id(),
                    slot,
                },
                &entry.buffer,
            );
        }
    }

    /// Drain every deferred list and stop the workers. Buffers released
    /// afterwards are destroyed synchronously.
    pub fn shutdown(&self) {
        let heaps = {
            let mut registry = self.registry.write();
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            registry.heaps.clone()
        };
        for heap in &heaps {
            heap.shutdown();
        }
        tracing::info!(device = self.exporter.0, "device shut down");
    }

    pub(crate) fn check_client(&self, client: &Client) -> Result<()> {
        if client.device() != self.exporter.0 {
            return Err(IonError::invalid(format!(
                "client {} belongs to another device",
                client.id()
            )));
        }
        if client.is_closed() {
            return Err(IonError::invalid(format!(
                "client {} is closed",
                client.id()
            )));
        }
        Ok(())
    }

    /// `handle`'s slot if it names a live handle of `client` and the client
    /// was created by this device.
    pub(crate) fn slot_for(
        &self,
        client: &Client,
        handles: &HandleTable,
        handle: HandleId,
    ) -> Option<SlotKey> {
        (client.device() == self.exporter.0
            && handle.client == client.id()
            && handles.get(handle.slot).is_some())
        .then_some(handle.slot)
    }

    pub(crate) fn invalid_handle(&self, client: &Client, handle: HandleId, op: &str) -> IonError {
        DeviceMetrics::inc(&self.metrics.invalid_handles);
        tracing::warn!(client = %client.id(), pid = ?client.pid(), %handle, op, "invalid handle");
        IonError::InvalidHandle {
            client: client.id(),
            handle,
        }
    }

    pub(crate) fn next_region(&self) -> u64 {
        self.region_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("exporter", &self.exporter)
            .field("config", &self.config)
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::HeapCaps;
    use crate::heap::{ALL_HEAPS, HeapKind};
    use crate::test_heap::TestHeap;
    use std::sync::atomic::Ordering;

    const MIB: usize = 1024 * 1024;

    fn device_with_heap(capacity: usize) -> (Device, Arc<TestHeap>) {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let backend = Arc::new(TestHeap::new(capacity));
        device
            .add_heap(HeapDescriptor::new(0, "system", HeapKind::System), backend.clone())
            .unwrap();
        (device, backend)
    }

    #[test]
    fn allocation_is_page_rounded_and_validates() {
        let (device, _) = device_with_heap(MIB);
        let client = device.create_client("app", Some(100)).unwrap();
        let handle = device
            .allocate(&client, 100, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        let buffer = device.buffer(&client, handle).unwrap();
        assert_eq!(buffer.size(), 4096);
        assert_eq!(buffer.handle_count(), 1);
        assert_eq!(device.handle_refs(&client, handle).unwrap(), 1);
        assert_eq!(device.heap(0).unwrap().used(), 4096);
    }

    #[test]
    fn zero_length_is_invalid() {
        let (device, _) = device_with_heap(MIB);
        let client = device.create_client("app", Some(1)).unwrap();
        let err = device
            .allocate(&client, 0, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap_err();
        assert!(matches!(err, IonError::InvalidArgument(_)));
        assert_eq!(client.handle_count(), 0);
    }

    #[test]
    fn oversized_request_is_out_of_memory_without_reclaim() {
        let (device, _) = device_with_heap(MIB);
        let client = device.create_client("app", Some(1)).unwrap();
        device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        let err = device
            .allocate(&client, 2 * MIB, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap_err();
        assert_eq!(
            err,
            IonError::OutOfMemory {
                len: 2 * MIB,
                heap_mask: ALL_HEAPS
            }
        );
        assert_eq!(client.handle_count(), 1);
        assert_eq!(device.metrics().allocation_failures, 1);
    }

    #[test]
    fn empty_mask_match_is_no_matching_heap() {
        let (device, _) = device_with_heap(MIB);
        let client = device.create_client("app", Some(1)).unwrap();
        let err = device
            .allocate(&client, 4096, 1, 1 << 5, BufferFlags::empty())
            .unwrap_err();
        assert_eq!(err, IonError::NoMatchingHeap { heap_mask: 1 << 5 });
        assert_eq!(err.errno(), libc::ENODEV);
    }

    #[test]
    fn heaps_are_tried_in_priority_order() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        let low = Arc::new(TestHeap::new(MIB));
        let high = Arc::new(TestHeap::new(8192));
        let tie = Arc::new(TestHeap::new(MIB));
        device
            .add_heap(HeapDescriptor::new(0, "low", HeapKind::System), low.clone())
            .unwrap();
        device
            .add_heap(
                HeapDescriptor::new(1, "high", HeapKind::Carveout).with_priority(10),
                high.clone(),
            )
            .unwrap();
        device
            .add_heap(
                HeapDescriptor::new(2, "tie", HeapKind::Carveout).with_priority(10),
                tie,
            )
            .unwrap();
        let names: Vec<_> = device.heaps().iter().map(|h| h.name().to_owned()).collect();
        assert_eq!(names, ["high", "tie", "low"]);

        let client = device.create_client("app", Some(1)).unwrap();
        let a = device
            .allocate(&client, 8192, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        assert_eq!(device.buffer(&client, a).unwrap().heap_id(), 1);
        // "high" is full, "tie" is next.
        let b = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        assert_eq!(device.buffer(&client, b).unwrap().heap_id(), 2);
        // Mask restricted to the lowest heap.
        let c = device
            .allocate(&client, 4096, 1, 1, BufferFlags::empty())
            .unwrap();
        assert_eq!(device.buffer(&client, c).unwrap().heap_id(), 0);
        assert_eq!(low.used(), 4096);
        assert_eq!(high.used(), 8192);
    }

    #[test]
    fn bad_heap_registrations() {
        let (device, _) = device_with_heap(MIB);
        let dup = device.add_heap(
            HeapDescriptor::new(0, "again", HeapKind::Dma),
            Arc::new(TestHeap::new(MIB)),
        );
        assert!(matches!(dup, Err(IonError::InvalidArgument(_))));
        let out_of_range = device.add_heap(
            HeapDescriptor::new(32, "wide", HeapKind::Dma),
            Arc::new(TestHeap::new(MIB)),
        );
        assert!(matches!(out_of_range, Err(IonError::InvalidArgument(_))));
    }

    #[test]
    fn double_free_is_invalid_handle() {
        let (device, backend) = device_with_heap(MIB);
        let client = device.create_client("app", Some(1)).unwrap();
        let handle = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        device.free(&client, handle).unwrap();
        assert_eq!(backend.frees.load(Ordering::Relaxed), 1);
        let err = device.free(&client, handle).unwrap_err();
        assert_eq!(
            err,
            IonError::InvalidHandle {
                client: client.id(),
                handle
            }
        );
        assert_eq!(backend.frees.load(Ordering::Relaxed), 1);
        assert_eq!(device.metrics().invalid_handles, 1);
    }

    #[test]
    fn handles_do_not_cross_clients() {
        let (device, _) = device_with_heap(MIB);
        let a = device.create_client("a", Some(1)).unwrap();
        let b = device.create_client("b", Some(2)).unwrap();
        let handle = device
            .allocate(&a, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        assert!(matches!(
            device.free(&b, handle),
            Err(IonError::InvalidHandle { .. })
        ));
        assert!(device.buffer(&a, handle).is_ok());
    }

    #[test]
    fn kernel_mapping_is_shared_between_handles() {
        let (device, backend) = device_with_heap(MIB);
        let a = device.create_client("a", Some(1)).unwrap();
        let b = device.create_client("b", Some(2)).unwrap();
        let ha = device
            .allocate(&a, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        let object = device.share(&a, ha).unwrap();
        let hb = device.import_dma_buf(&b, &object).unwrap();

        let addr_a = device.map_kernel(&a, ha).unwrap();
        let again = device.map_kernel(&a, ha).unwrap();
        let addr_b = device.map_kernel(&b, hb).unwrap();
        assert_eq!(addr_a, again);
        assert_eq!(addr_a, addr_b);
        assert_eq!(backend.kernel_maps.load(Ordering::Relaxed), 1);
        assert_eq!(device.buffer(&a, ha).unwrap().kmap_count(), 2);

        device.unmap_kernel(&a, ha).unwrap();
        device.unmap_kernel(&a, ha).unwrap();
        assert!(matches!(
            device.unmap_kernel(&a, ha),
            Err(IonError::InvalidArgument(_))
        ));
        assert_eq!(backend.kernel_unmaps.load(Ordering::Relaxed), 0);
        device.unmap_kernel(&b, hb).unwrap();
        assert_eq!(backend.kernel_unmaps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn freeing_a_mapped_handle_drops_its_mappings() {
        let (device, backend) = device_with_heap(MIB);
        let client = device.create_client("app", Some(1)).unwrap();
        let handle = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        device.map_kernel(&client, handle).unwrap();
        device.map_kernel(&client, handle).unwrap();
        device.free(&client, handle).unwrap();
        assert_eq!(backend.kernel_unmaps.load(Ordering::Relaxed), 1);
        assert_eq!(backend.frees.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_capabilities_are_unsupported() {
        let device = Device::new(DeviceConfig::default()).unwrap();
        device
            .add_heap(
                HeapDescriptor::new(0, "plain", HeapKind::System),
                Arc::new(TestHeap::with_caps(MIB, HeapCaps::empty())),
            )
            .unwrap();
        let client = device.create_client("app", Some(1)).unwrap();
        let handle = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        let err = device.phys(&client, handle).unwrap_err();
        assert_eq!(err, IonError::unsupported("phys", "plain"));
        assert!(matches!(
            device.map_kernel(&client, handle),
            Err(IonError::Unsupported { .. })
        ));
        assert_eq!(device.sg_table(&client, handle).unwrap().total_len(), 4096);
    }

    #[test]
    fn destroying_a_client_releases_every_handle() {
        let (device, backend) = device_with_heap(MIB);
        let client = device.create_client("app", Some(7)).unwrap();
        let handle = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        device
            .allocate(&client, 8192, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        // A second reference on the first handle does not keep it alive.
        let object = device.share(&client, handle).unwrap();
        device.import_dma_buf(&client, &object).unwrap();
        drop(object);

        device.destroy_client(&client).unwrap();
        assert_eq!(backend.frees.load(Ordering::Relaxed), 2);
        assert_eq!(backend.used(), 0);
        assert!(device.clients().is_empty());
        assert!(
            device
                .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
                .is_err()
        );
        assert!(device.destroy_client(&client).is_err());
    }

    #[test]
    fn last_owner_is_recorded() {
        let (device, _) = device_with_heap(MIB);
        let client = device.create_client("camera", Some(42)).unwrap();
        let handle = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
        let object = device.share(&client, handle).unwrap();
        device.free(&client, handle).unwrap();
        let infos = device.buffers();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].handle_count, 0);
        assert_eq!(infos[0].ref_count, 1);
        assert_eq!(
            infos[0].last_owner,
            Some(crate::buffer::OwnerInfo {
                pid: Some(42),
                name: "camera".into()
            })
        );
        drop(object);
        assert!(device.buffers().is_empty());
    }

    #[test]
    fn locked_buffer_view() {
        let (device, _) = device_with_heap(MIB);
        let client = device.create_client("app", Some(1)).unwrap();
        let handle = device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::CACHED)
            .unwrap();
        let (count, pages) = device
            .with_locked_buffer(&client, handle, |locked| {
                (
                    locked.handle_count(),
                    locked.dirty_pages().map(|d| d.pages()),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(pages, Some(1));
    }

    #[test]
    fn shutdown_closes_registration() {
        let (device, _) = device_with_heap(MIB);
        device.shutdown();
        device.shutdown();
        assert!(device.create_client("late", None).is_err());
    }

    #[test]
    fn clients_are_found_by_pid() {
        let (device, _) = device_with_heap(MIB);
        let first = device.create_client("first", Some(9)).unwrap();
        device.create_client("second", Some(9)).unwrap();
        device.create_client("kernel", None).unwrap();
        assert_eq!(device.client_for_pid(9).unwrap().id(), first.id());
        assert!(device.client_for_pid(10).is_none());
    }
}
