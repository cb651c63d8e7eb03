//! Enumeration hooks for external reporting surfaces.
//!
//! Nothing here formats output; every type serializes with serde and the
//! caller renders it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::buffer::{Buffer, BufferId, OwnerInfo};
use crate::client::{Client, ClientId};
use crate::device::Device;
use crate::error::{IonError, Result};
use crate::flags::BufferFlags;
use crate::heap::{HeapId, HeapKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferInfo {
    pub id: BufferId,
    pub heap_id: HeapId,
    pub size: usize,
    pub flags: BufferFlags,
    pub handle_count: usize,
    /// Strong references outside the report itself.
    pub ref_count: usize,
    pub kmap_count: usize,
    pub last_owner: Option<OwnerInfo>,
}

impl BufferInfo {
    fn from_buffer(buffer: &Arc<Buffer>) -> Self {
        let state = buffer.lock_state();
        Self {
            id: buffer.id(),
            heap_id: buffer.heap_id(),
            size: buffer.size(),
            flags: buffer.flags(),
            handle_count: state.handle_count,
            ref_count: Buffer::ref_count(buffer),
            kmap_count: state.kmap_cnt,
            last_owner: state.last_owner.clone(),
        }
    }
}

/// Aggregate size of one client's buffers on one heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapUsage {
    pub heap_id: HeapId,
    pub heap_name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapTotals {
    pub size: usize,
    /// Bytes in buffers with more than one handle.
    pub shared: usize,
    /// Each buffer's size divided by its handle count.
    pub pss: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientUsage {
    pub client: ClientId,
    pub name: String,
    pub pid: Option<u32>,
    pub totals: HeapTotals,
}

/// A buffer no handle refers to any more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanInfo {
    pub buffer: BufferId,
    pub size: usize,
    pub ref_count: usize,
    pub last_owner: Option<OwnerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapReport {
    pub heap_id: HeapId,
    pub heap_name: String,
    pub used: usize,
    pub clients: Vec<ClientUsage>,
    pub orphaned: Vec<OrphanInfo>,
    pub total_size: usize,
    pub total_shared: usize,
    pub total_orphaned: usize,
    pub deferred_bytes: usize,
}

impl Device {
    /// Every live buffer, in creation order.
    #[must_use]
    pub fn buffers(&self) -> Vec<BufferInfo> {
        let live = self.buffers.live();
        live.iter().map(BufferInfo::from_buffer).collect()
    }

    /// Per-heap aggregate of `client`'s buffers, in heap id order.
    #[must_use]
    pub fn client_heap_usage(&self, client: &Client) -> Vec<HeapUsage> {
        let mut sizes: BTreeMap<HeapId, (String, usize)> = BTreeMap::new();
        self.for_each_client_buffer(client, |_, buffer| {
            let slot = sizes
                .entry(buffer.heap_id())
                .or_insert_with(|| (buffer.heap().name().to_owned(), 0));
            slot.1 += buffer.size();
        });
        sizes
            .into_iter()
            .map(|(heap_id, (heap_name, size))| HeapUsage {
                heap_id,
                heap_name,
                size,
            })
            .collect()
    }

    #[must_use]
    pub fn client_heap_total(&self, client: &Client, heap: HeapId) -> HeapTotals {
        client.heap_totals(heap)
    }

    /// Usage of one heap broken down by client, plus orphaned buffers.
    pub fn heap_report(&self, heap_id: HeapId) -> Result<HeapReport> {
        let heap = self
            .heap(heap_id)
            .ok_or_else(|| IonError::invalid(format!("no heap with id {heap_id}")))?;

        let mut clients = Vec::new();
        let mut total_shared = 0;
        for client in self.clients() {
            let totals = client.heap_totals(heap_id);
            if totals.size == 0 {
                continue;
            }
            total_shared += totals.shared;
            clients.push(ClientUsage {
                client: client.id(),
                name: client.name().to_owned(),
                pid: client.pid(),
                totals,
            });
        }

        let mut total_size = 0;
        let mut total_orphaned = 0;
        let mut orphaned = Vec::new();
        let live = self.buffers.live();
        for buffer in live.iter().filter(|b| b.heap_id() == heap_id) {
            total_size += buffer.size();
            let state = buffer.lock_state();
            if state.handle_count == 0 {
                total_orphaned += buffer.size();
                orphaned.push(OrphanInfo {
                    buffer: buffer.id(),
                    size: buffer.size(),
                    ref_count: Buffer::ref_count(buffer),
                    last_owner: state.last_owner.clone(),
                });
            }
        }
        drop(live);

        Ok(HeapReport {
            heap_id,
            heap_name: heap.name().to_owned(),
            used: heap.used(),
            clients,
            orphaned,
            total_size,
            total_shared,
            total_orphaned,
            deferred_bytes: heap.pending_free_bytes(),
        })
    }

    /// Sum of `used` over every heap of `kind`.
    #[must_use]
    pub fn used_total(&self, kind: HeapKind) -> usize {
        self.registry
            .read()
            .heaps
            .iter()
            .filter(|h| h.kind() == kind)
            .map(|h| h.used())
            .sum()
    }

    /// Bytes waiting on deferred-free lists across all heaps.
    #[must_use]
    pub fn freelist_total(&self) -> usize {
        self.registry
            .read()
            .heaps
            .iter()
            .map(|h| h.pending_free_bytes())
            .sum()
    }

    /// Emit every heap report at debug level.
    pub(crate) fn log_heap_status(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        for heap in self.heaps() {
            match self.heap_report(heap.id()) {
                Ok(report) => tracing::debug!(
                    heap = %report.heap_name,
                    used = report.used,
                    total = report.total_size,
                    orphaned = report.total_orphaned,
                    deferred = report.deferred_bytes,
                    report = %serde_json::to_string(&report).unwrap_or_default(),
                    "heap status"
                ),
                Err(err) => tracing::debug!(heap = %heap.name(), error = %err, "heap status unavailable"),
            }
        }
    }
}
