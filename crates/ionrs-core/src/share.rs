//! Cross-client sharing.
//!
//! `share` wraps a handle's buffer in a [`DmaBuf`] stamped with the
//! device's exporter id; `export` additionally installs it in a descriptor
//! table. `import` resolves a descriptor back to the same buffer and either
//! bumps the importing client's existing handle or creates one. Objects
//! stamped by any other exporter are refused.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::client::Client;
use crate::device::Device;
use crate::error::{IonError, Result};
use crate::handle::HandleId;
use crate::heap::{KernelAddr, RegionId, ScatterTable, UserRegion};
use crate::metrics::DeviceMetrics;

static NEXT_EXPORTER: AtomicU64 = AtomicU64::new(1);

/// Identity stamped on every sharing object a device creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExporterId(pub u64);

impl ExporterId {
    /// A process-wide unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_EXPORTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Descriptor number in an [`FdTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fd(pub i32);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// A sharable object. Holds one reference to whatever it exports.
pub struct DmaBuf {
    exporter: ExporterId,
    size: usize,
    private: Arc<dyn Any + Send + Sync>,
}

impl DmaBuf {
    pub fn new(exporter: ExporterId, size: usize, private: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            exporter,
            size,
            private,
        }
    }

    #[must_use]
    pub fn exporter(&self) -> ExporterId {
        self.exporter
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The exported buffer, if `exporter` created this object.
    pub(crate) fn buffer_for(&self, exporter: ExporterId) -> Result<Arc<Buffer>> {
        if self.exporter != exporter {
            return Err(IonError::ImportRejected(format!(
                "object exported by {} is not ours ({})",
                self.exporter.0, exporter.0
            )));
        }
        Arc::clone(&self.private)
            .downcast::<Buffer>()
            .map_err(|_| IonError::ImportRejected("object does not wrap a buffer".into()))
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("exporter", &self.exporter)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A bounded table of installed descriptors. Numbers are allocated
/// lowest-free-first, like a process file table.
pub struct FdTable {
    entries: Mutex<BTreeMap<i32, Arc<DmaBuf>>>,
    limit: usize,
}

impl FdTable {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            limit,
        }
    }

    pub fn install(&self, object: Arc<DmaBuf>) -> Result<Fd> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            return Err(IonError::ResourceExhausted { limit: self.limit });
        }
        let mut fd = 0;
        for &used in entries.keys() {
            if used != fd {
                break;
            }
            fd += 1;
        }
        entries.insert(fd, object);
        Ok(Fd(fd))
    }

    pub fn get(&self, fd: Fd) -> Result<Arc<DmaBuf>> {
        self.entries
            .lock()
            .get(&fd.0)
            .cloned()
            .ok_or(IonError::BadDescriptor(fd.0))
    }

    /// Remove `fd`. The object's reference is dropped outside the table lock.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let removed = self.entries.lock().remove(&fd.0);
        match removed {
            Some(object) => {
                drop(object);
                Ok(())
            }
            None => Err(IonError::BadDescriptor(fd.0)),
        }
    }

    /// Install a second descriptor for the object behind `fd`.
    pub fn dup(&self, fd: Fd) -> Result<Fd> {
        let object = self.get(fd)?;
        self.install(object)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl fmt::Debug for FdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdTable")
            .field("len", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}

/// A kernel CPU mapping taken without a handle. Released on drop.
pub struct CpuAccess {
    buffer: Arc<Buffer>,
    addr: KernelAddr,
}

impl CpuAccess {
    #[must_use]
    pub fn addr(&self) -> KernelAddr {
        self.addr
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

impl Drop for CpuAccess {
    fn drop(&mut self) {
        let mut state = self.buffer.lock_state();
        self.buffer.kmap_put(&mut state);
    }
}

/// A user-space mapping of a shared buffer. Unmapped on drop.
pub struct UserMapping {
    buffer: Arc<Buffer>,
    region: UserRegion,
}

impl UserMapping {
    #[must_use]
    pub fn region(&self) -> UserRegion {
        self.region
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Service a fault on `page` (relative to the buffer start).
    pub fn fault(&self, page: usize) -> Result<()> {
        self.buffer.fault(self.region.id, page)
    }
}

impl Drop for UserMapping {
    fn drop(&mut self) {
        self.buffer.detach_region(self.region.id);
    }
}

impl Device {
    /// Wrap the handle's buffer in a sharing object.
    pub fn share(&self, client: &Client, handle: HandleId) -> Result<Arc<DmaBuf>> {
        let buffer = self.buffer(client, handle)?;
        let size = buffer.size();
        let id = buffer.id();
        let private: Arc<dyn Any + Send + Sync> = buffer;
        DeviceMetrics::inc(&self.metrics.exports);
        tracing::debug!(client = %client.id(), %handle, buffer = %id, "buffer shared");
        Ok(Arc::new(DmaBuf::new(self.exporter, size, private)))
    }

    /// Share and install into the descriptor table.
    pub fn export(&self, client: &Client, handle: HandleId) -> Result<Fd> {
        let object = self.share(client, handle)?;
        let fd = self.fds.install(object)?;
        tracing::debug!(client = %client.id(), %handle, %fd, "buffer exported");
        Ok(fd)
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        self.fds.close(fd)
    }

    pub fn dup(&self, fd: Fd) -> Result<Fd> {
        self.fds.dup(fd)
    }

    /// Resolve an installed descriptor to a handle on `client`.
    pub fn import(&self, client: &Client, fd: Fd) -> Result<HandleId> {
        let object = self.fds.get(fd)?;
        self.import_dma_buf(client, &object)
    }

    /// Resolve a sharing object to a handle on `client`, reusing the
    /// client's existing handle to the same buffer if there is one.
    pub fn import_dma_buf(&self, client: &Client, object: &DmaBuf) -> Result<HandleId> {
        self.check_client(client)?;
        let buffer = self.resolve(object)?;
        let slot = {
            let mut handles = client.lock_handles();
            if client.is_closed() {
                None
            } else if let Some(slot) = handles.find_by_buffer(buffer.id()) {
                if let Some(entry) = handles.get_mut(slot) {
                    entry.refs += 1;
                }
                Some(slot)
            } else {
                Some(handles.insert(Arc::clone(&buffer)))
            }
        };
        let Some(slot) = slot else {
            return Err(IonError::invalid(format!(
                "client {} is closed",
                client.id()
            )));
        };
        let handle = HandleId {
            client: client.id(),
            slot,
        };
        DeviceMetrics::inc(&self.metrics.imports);
        tracing::debug!(client = %client.id(), %handle, buffer = %buffer.id(), "buffer imported");
        Ok(handle)
    }

    /// Whole-buffer cache maintenance before device access.
    pub fn sync_for_device(&self, fd: Fd) -> Result<()> {
        let buffer = self.resolve_fd(fd)?;
        buffer.sync_whole_for_device()
    }

    /// Hand the buffer to a device for DMA: flush dirty pages, zap user
    /// mappings, and return its scatter table.
    pub fn map_attachment(&self, fd: Fd) -> Result<ScatterTable> {
        let buffer = self.resolve_fd(fd)?;
        buffer.sync_dirty_for_device()?;
        Ok(buffer.sg_table().clone())
    }

    pub fn begin_cpu_access(&self, fd: Fd) -> Result<CpuAccess> {
        let buffer = self.resolve_fd(fd)?;
        let addr = {
            let mut state = buffer.lock_state();
            buffer.kmap_get(&mut state)?
        };
        Ok(CpuAccess { buffer, addr })
    }

    pub fn end_cpu_access(&self, access: CpuAccess) {
        drop(access);
    }

    /// Map `len` bytes of the buffer at user address `start`.
    pub fn mmap(&self, fd: Fd, start: usize, len: usize) -> Result<UserMapping> {
        let buffer = self.resolve_fd(fd)?;
        if len == 0 || len > buffer.size() {
            return Err(IonError::invalid(format!(
                "mapping length {len} outside buffer of {} bytes",
                buffer.size()
            )));
        }
        let region = UserRegion {
            id: RegionId(self.next_region()),
            start,
            len,
        };
        buffer.attach_region(region)?;
        tracing::debug!(buffer = %buffer.id(), region = region.id.0, start, len, "user mapping created");
        Ok(UserMapping { buffer, region })
    }

    pub fn munmap(&self, mapping: UserMapping) {
        drop(mapping);
    }

    fn resolve_fd(&self, fd: Fd) -> Result<Arc<Buffer>> {
        let object = self.fds.get(fd)?;
        self.resolve(&object)
    }

    fn resolve(&self, object: &DmaBuf) -> Result<Arc<Buffer>> {
        object.buffer_for(self.exporter).inspect_err(|err| {
            DeviceMetrics::inc(&self.metrics.import_rejections);
            tracing::warn!(error = %err, "foreign sharing object rejected");
        })
    }
}
