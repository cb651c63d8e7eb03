//! Multi-heap shared buffer allocator.
//!
//! Clients allocate buffers from pluggable heap backends, hold them through
//! per-client handles, and share them with other clients through exportable
//! descriptors. When every eligible heap is exhausted, an optional reclaim
//! controller picks a memory-holding consumer and terminates it.
//!
//! # Architecture
//!
//! - **Heaps** (`heap`): backend trait, descriptors, per-heap accounting
//! - **Deferred free** (`deferred`): per-heap teardown worker fed by a channel
//! - **Buffers** (`buffer`): reference-counted allocations with mapping state
//! - **Handles** (`handle`, `slots`): generation-checked per-client tokens
//! - **Clients** (`client`): consumer sessions owning a handle table
//! - **Device** (`device`): registries and the allocation engine
//! - **Sharing** (`share`): sharing objects, descriptor tables, CPU/user maps
//! - **Reclaim** (`reclaim`): victim selection and termination
//! - **Reports** (`report`): serializable enumeration hooks
//! - **Control** (`control`): typed command dispatch
//! - **Configuration** (`config`) and **metrics** (`metrics`)

#![deny(unsafe_code)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod control;
mod deferred;
pub mod device;
pub mod error;
pub mod flags;
pub mod handle;
pub mod heap;
pub mod metrics;
pub mod reclaim;
mod registry;
pub mod report;
pub mod share;
pub mod slots;

#[cfg(test)]
mod test_heap;

pub use buffer::{Buffer, BufferId, LockedBuffer, OwnerInfo};
pub use client::{Client, ClientId};
pub use config::{DeviceConfig, ReclaimConfig};
pub use control::{ControlCommand, ControlReply, CustomHandler};
pub use device::{Device, DeviceBuilder};
pub use error::{IonError, Result};
pub use flags::{BufferFlags, HeapCaps, HeapFlags};
pub use handle::HandleId;
pub use heap::{
    ALL_HEAPS, AllocationRequest, Heap, HeapBackend, HeapDescriptor, HeapId, HeapKind, KernelAddr,
    RawAllocation, ScatterTable, Segment, ShrinkHint, UserRegion,
};
pub use metrics::MetricsSnapshot;
pub use reclaim::{ReclaimOutcome, Terminator};
pub use report::{BufferInfo, HeapReport, HeapTotals, HeapUsage};
pub use share::{CpuAccess, DmaBuf, ExporterId, Fd, FdTable, UserMapping};
