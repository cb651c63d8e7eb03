//! Integration test: allocation engine and handle validation.
//!
//! Run: cargo test -p ionrs-harness --test allocation_test

use std::sync::Arc;

use ionrs_core::{
    ALL_HEAPS, BufferFlags, Device, DeviceConfig, HeapCaps, HeapDescriptor, HeapFlags, HeapKind,
    IonError,
};
use ionrs_harness::{SimHeap, SimStats};

const MIB: usize = 1024 * 1024;

fn device_with(heaps: &[(u32, i32, Arc<SimHeap>)]) -> Device {
    let device = Device::new(DeviceConfig::default()).unwrap();
    for (id, priority, sim) in heaps {
        device
            .add_heap(
                HeapDescriptor::new(*id, sim.name(), HeapKind::System).with_priority(*priority),
                sim.clone(),
            )
            .unwrap();
    }
    device
}

#[test]
fn small_allocation_succeeds_then_oversized_fails() {
    let sim = Arc::new(SimHeap::new("system", MIB));
    let device = device_with(&[(0, 0, sim.clone())]);
    let client = device.create_client("app", Some(100)).unwrap();

    let handle = device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    let buffer = device.buffer(&client, handle).unwrap();
    assert_eq!(buffer.size(), 4096);
    assert_eq!(buffer.handle_count(), 1);
    drop(buffer);

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
    assert_eq!(err.errno(), libc::ENOMEM);
    // A failed allocation leaves the client untouched.
    assert_eq!(client.handle_count(), 1);
    assert_eq!(sim.used(), 4096);
}

#[test]
fn lengths_round_up_to_the_page_size() {
    let sim = Arc::new(SimHeap::new("system", MIB));
    let device = device_with(&[(0, 0, sim.clone())]);
    let client = device.create_client("app", Some(100)).unwrap();
    let handle = device
        .allocate(&client, 1, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    assert_eq!(device.buffer(&client, handle).unwrap().size(), 4096);
    assert_eq!(sim.used(), 4096);
    assert!(matches!(
        device.allocate(&client, 0, 1, ALL_HEAPS, BufferFlags::empty()),
        Err(IonError::InvalidArgument(_))
    ));
}

#[test]
fn heaps_are_tried_in_priority_order_within_the_mask() {
    let low = Arc::new(SimHeap::new("low", MIB));
    let high = Arc::new(SimHeap::new("high", 8192));
    let device = device_with(&[(0, 1, low.clone()), (1, 10, high.clone())]);
    let client = device.create_client("app", Some(1)).unwrap();

    let first = device
        .allocate(&client, 8192, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    assert_eq!(device.buffer(&client, first).unwrap().heap_id(), 1);
    // High heap is full now; the request falls through to the low one.
    let second = device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    assert_eq!(device.buffer(&client, second).unwrap().heap_id(), 0);
    // A mask naming only the full heap cannot fall through.
    assert!(matches!(
        device.allocate(&client, 4096, 1, 1 << 1, BufferFlags::empty()),
        Err(IonError::OutOfMemory { .. })
    ));
    assert_eq!(high.used(), 8192);
    assert_eq!(low.used(), 4096);
}

#[test]
fn masks_selecting_nothing_report_no_matching_heap() {
    let device = device_with(&[(3, 0, Arc::new(SimHeap::new("only", MIB)))]);
    let client = device.create_client("app", Some(1)).unwrap();
    let err = device
        .allocate(&client, 4096, 1, 1 << 0, BufferFlags::empty())
        .unwrap_err();
    assert_eq!(err, IonError::NoMatchingHeap { heap_mask: 1 });
    assert_eq!(err.errno(), libc::ENODEV);
}

#[test]
fn registration_rejects_bad_and_duplicate_ids() {
    let device = Device::new(DeviceConfig::default()).unwrap();
    let sim = Arc::new(SimHeap::new("sim", MIB));
    assert!(matches!(
        device.add_heap(HeapDescriptor::new(32, "bad", HeapKind::Dma), sim.clone()),
        Err(IonError::InvalidArgument(_))
    ));
    device
        .add_heap(HeapDescriptor::new(4, "a", HeapKind::Carveout), sim.clone())
        .unwrap();
    assert!(matches!(
        device.add_heap(HeapDescriptor::new(4, "b", HeapKind::Chunk), sim),
        Err(IonError::InvalidArgument(_))
    ));
}

#[test]
fn backend_failures_are_not_out_of_memory() {
    let sim = Arc::new(SimHeap::new("system", MIB));
    let device = device_with(&[(0, 0, sim.clone())]);
    let client = device.create_client("app", Some(1)).unwrap();

    sim.fail_next_allocations(1);
    assert!(matches!(
        device.allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty()),
        Err(IonError::Backend { .. })
    ));

    sim.set_fail_map_dma(true);
    assert!(matches!(
        device.allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty()),
        Err(IonError::Backend { .. })
    ));
    // The allocation behind the failed map was handed back.
    assert_eq!(sim.used(), 0);
    assert_eq!(SimStats::get(&sim.stats().frees), 1);
    assert_eq!(client.handle_count(), 0);
    assert_eq!(device.metrics().allocation_failures, 2);
}

#[test]
fn free_is_idempotent_and_reports_invalid_handles() {
    let sim = Arc::new(SimHeap::new("system", MIB));
    let device = device_with(&[(0, 0, sim.clone())]);
    let client = device.create_client("app", Some(1)).unwrap();
    let other = device.create_client("other", Some(2)).unwrap();
    let handle = device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();

    // Another client's handle never validates.
    assert!(matches!(
        device.free(&other, handle),
        Err(IonError::InvalidHandle { .. })
    ));
    assert_eq!(sim.used(), 4096);

    device.free(&client, handle).unwrap();
    assert_eq!(sim.used(), 0);
    for _ in 0..3 {
        let err = device.free(&client, handle).unwrap_err();
        assert!(matches!(err, IonError::InvalidHandle { .. }));
        assert_eq!(err.errno(), libc::EINVAL);
    }
    assert_eq!(sim.used(), 0);
    assert_eq!(device.metrics().invalid_handles, 4);

    // A new allocation may reuse the slot but never the stale handle.
    let fresh = device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    assert_ne!(fresh, handle);
    assert!(device.buffer(&client, handle).is_err());
}

#[test]
fn capabilities_gate_optional_operations() {
    let bare = Arc::new(
        SimHeap::builder("bare", MIB)
            .caps(HeapCaps::empty())
            .build(),
    );
    let full = Arc::new(SimHeap::builder("full", MIB).phys_base(0x4000_0000).build());
    let device = device_with(&[(0, 0, bare), (1, 0, full)]);
    let client = device.create_client("app", Some(1)).unwrap();

    let on_bare = device
        .allocate(&client, 4096, 1, 1 << 0, BufferFlags::empty())
        .unwrap();
    assert!(matches!(
        device.phys(&client, on_bare),
        Err(IonError::Unsupported { op: "phys", .. })
    ));
    let err = device.map_kernel(&client, on_bare).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTTY);

    let on_full = device
        .allocate(&client, 8192, 1, 1 << 1, BufferFlags::empty())
        .unwrap();
    let (addr, len) = device.phys(&client, on_full).unwrap();
    assert_eq!((addr, len), (0x4000_0000, 8192));
    let table = device.sg_table(&client, on_full).unwrap();
    assert_eq!(table.segments()[0].dma_addr, addr);
    assert_eq!(table.total_len(), 8192);
}

#[test]
fn kernel_mappings_are_shared_across_handles() {
    let sim = Arc::new(SimHeap::new("system", MIB));
    let device = device_with(&[(0, 0, sim.clone())]);
    let a = device.create_client("a", Some(1)).unwrap();
    let b = device.create_client("b", Some(2)).unwrap();
    let ha = device
        .allocate(&a, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    let fd = device.export(&a, ha).unwrap();
    let hb = device.import(&b, fd).unwrap();

    let addr_a = device.map_kernel(&a, ha).unwrap();
    let addr_b = device.map_kernel(&b, hb).unwrap();
    assert_eq!(addr_a, addr_b);
    assert_eq!(SimStats::get(&sim.stats().kernel_maps), 1);
    assert_eq!(device.buffer(&a, ha).unwrap().kmap_count(), 2);

    device.unmap_kernel(&a, ha).unwrap();
    assert_eq!(SimStats::get(&sim.stats().kernel_unmaps), 0);
    device.unmap_kernel(&b, hb).unwrap();
    assert_eq!(SimStats::get(&sim.stats().kernel_unmaps), 1);
    device.close(fd).unwrap();
}

#[test]
fn destroying_a_client_releases_every_handle() {
    let sim = Arc::new(SimHeap::new("system", MIB));
    let device = device_with(&[(0, 0, sim.clone())]);
    let client = device.create_client("app", Some(1)).unwrap();
    for _ in 0..4 {
        device
            .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
            .unwrap();
    }
    let handle = device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    device.map_kernel(&client, handle).unwrap();
    assert_eq!(sim.used(), 5 * 4096);

    device.destroy_client(&client).unwrap();
    assert_eq!(sim.used(), 0);
    assert_eq!(SimStats::get(&sim.stats().kernel_unmaps), 1);
    assert!(client.is_closed());
    assert!(matches!(
        device.allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty()),
        Err(IonError::InvalidArgument(_))
    ));
    assert!(device.clients().is_empty());
}

#[test]
fn deferred_heaps_flag_their_buffers() {
    let sim = Arc::new(SimHeap::new("deferred", MIB));
    let device = Device::new(DeviceConfig::default()).unwrap();
    device
        .add_heap(
            HeapDescriptor::new(0, "deferred", HeapKind::System).with_flags(HeapFlags::DEFER_FREE),
            sim,
        )
        .unwrap();
    let client = device.create_client("app", Some(1)).unwrap();
    let handle = device
        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
        .unwrap();
    let buffer = device.buffer(&client, handle).unwrap();
    assert!(buffer.flags().contains(BufferFlags::DEFERRED_FREE));
    assert!(buffer.heap().defers_free());
}
