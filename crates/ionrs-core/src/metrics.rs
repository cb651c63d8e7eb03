//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering. They are advisory, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-device operation counters.
pub struct DeviceMetrics {
    /// Successful allocations (handles created by allocate).
    pub allocations: AtomicU64,
    /// Allocations that returned an error to the caller.
    pub allocation_failures: AtomicU64,
    /// Handle references dropped through `free`.
    pub frees: AtomicU64,
    /// Operations rejected because the handle did not validate.
    pub invalid_handles: AtomicU64,
    /// Buffers wrapped in a sharing object.
    pub exports: AtomicU64,
    /// Successful imports.
    pub imports: AtomicU64,
    /// Imports refused by the exporter check.
    pub import_rejections: AtomicU64,
    /// Backend kernel mappings created.
    pub kernel_maps: AtomicU64,
    /// Buffers handed to a deferred-free worker.
    pub deferred_enqueued: AtomicU64,
    /// Buffers torn down (synchronously or by a worker).
    pub buffers_destroyed: AtomicU64,
    /// Synchronous drains of a deferred-free list.
    pub drains: AtomicU64,
    /// Deferred teardowns whose backend panicked.
    pub deferred_failures: AtomicU64,
    /// Victims signalled by reclaim on behalf of a failing allocation.
    pub oom_kill_count: AtomicU64,
    /// Sleeps taken by the allocation engine waiting for reclaim.
    pub reclaim_waits: AtomicU64,
}

impl DeviceMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            invalid_handles: AtomicU64::new(0),
            exports: AtomicU64::new(0),
            imports: AtomicU64::new(0),
            import_rejections: AtomicU64::new(0),
            kernel_maps: AtomicU64::new(0),
            deferred_enqueued: AtomicU64::new(0),
            buffers_destroyed: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            deferred_failures: AtomicU64::new(0),
            oom_kill_count: AtomicU64::new(0),
            reclaim_waits: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            allocation_failures: Self::get(&self.allocation_failures),
            frees: Self::get(&self.frees),
            invalid_handles: Self::get(&self.invalid_handles),
            exports: Self::get(&self.exports),
            imports: Self::get(&self.imports),
            import_rejections: Self::get(&self.import_rejections),
            kernel_maps: Self::get(&self.kernel_maps),
            deferred_enqueued: Self::get(&self.deferred_enqueued),
            buffers_destroyed: Self::get(&self.buffers_destroyed),
            drains: Self::get(&self.drains),
            deferred_failures: Self::get(&self.deferred_failures),
            oom_kill_count: Self::get(&self.oom_kill_count),
            reclaim_waits: Self::get(&self.reclaim_waits),
        }
    }
}

impl Default for DeviceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub allocation_failures: u64,
    pub frees: u64,
    pub invalid_handles: u64,
    pub exports: u64,
    pub imports: u64,
    pub import_rejections: u64,
    pub kernel_maps: u64,
    pub deferred_enqueued: u64,
    pub buffers_destroyed: u64,
    pub drains: u64,
    pub deferred_failures: u64,
    pub oom_kill_count: u64,
    pub reclaim_waits: u64,
}
