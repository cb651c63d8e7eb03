//! Consumer sessions.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::buffer::OwnerInfo;
use crate::handle::HandleTable;
use crate::heap::HeapId;
use crate::report::HeapTotals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// A consumer of the allocator: a process (with a pid) or an in-kernel
/// subsystem (without one). Owns the registry of its handles.
pub struct Client {
    id: ClientId,
    device: u64,
    name: String,
    pid: Option<u32>,
    reclaim_priority: AtomicI32,
    fatal_signal: AtomicBool,
    closed: AtomicBool,
    /// Set while the client has been signalled by reclaim.
    termination_deadline: Mutex<Option<Instant>>,
    handles: Mutex<HandleTable>,
}

impl Client {
    pub(crate) fn new(id: ClientId, device: u64, name: String, pid: Option<u32>) -> Self {
        Self {
            id,
            device,
            name,
            pid,
            reclaim_priority: AtomicI32::new(0),
            fatal_signal: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            termination_deadline: Mutex::new(None),
            handles: Mutex::new(HandleTable::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kernel clients have no process and are never reclaim victims.
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.pid.is_none()
    }

    /// Host-assigned kill score; higher is reclaimed first.
    #[must_use]
    pub fn reclaim_priority(&self) -> i32 {
        self.reclaim_priority.load(Ordering::Relaxed)
    }

    pub fn set_reclaim_priority(&self, priority: i32) {
        self.reclaim_priority.store(priority, Ordering::Relaxed);
    }

    /// Record that the consumer has a fatal signal pending. Allocation
    /// retry loops running on its behalf give up.
    pub fn signal_fatal(&self) {
        self.fatal_signal.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn fatal_signal_pending(&self) -> bool {
        self.fatal_signal.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Deadline of an in-flight reclaim termination, if any.
    #[must_use]
    pub fn termination_deadline(&self) -> Option<Instant> {
        *self.termination_deadline.lock()
    }

    #[must_use]
    pub fn owner_info(&self) -> OwnerInfo {
        OwnerInfo {
            pid: self.pid,
            name: self.name.clone(),
        }
    }

    /// Size, shared size and proportional share of this client's buffers
    /// on one heap. Each buffer's handle count is read under its own lock.
    #[must_use]
    pub fn heap_totals(&self, heap: HeapId) -> HeapTotals {
        let handles = self.handles.lock();
        let mut totals = HeapTotals::default();
        for (_, entry) in handles.iter() {
            let buffer = &entry.buffer;
            if buffer.heap_id() != heap {
                continue;
            }
            let handle_count = buffer.handle_count().max(1);
            totals.size += buffer.size();
            if handle_count > 1 {
                totals.shared += buffer.size();
            }
            totals.pss += buffer.size() / handle_count;
        }
        totals
    }

    pub(crate) fn device(&self) -> u64 {
        self.device
    }

    pub(crate) fn lock_handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Claim the client for termination. Fails if another reclaimer already
    /// signalled it and the grace period is still running.
    pub(crate) fn begin_termination(&self, now: Instant, deadline: Instant) -> bool {
        let mut current = self.termination_deadline.lock();
        if current.is_some_and(|d| now <= d) {
            return false;
        }
        *current = Some(deadline);
        true
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("reclaim_priority", &self.reclaim_priority())
            .finish_non_exhaustive()
    }
}
