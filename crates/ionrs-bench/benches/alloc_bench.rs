//! Allocation engine benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ionrs_core::{
    ALL_HEAPS, BufferFlags, Device, DeviceConfig, HeapDescriptor, HeapFlags, HeapKind,
};
use ionrs_harness::SimHeap;

const CAPACITY: usize = 256 * 1024 * 1024;

fn device(flags: HeapFlags) -> Device {
    let device = Device::new(DeviceConfig::default()).unwrap();
    device
        .add_heap(
            HeapDescriptor::new(0, "bench", HeapKind::System).with_flags(flags),
            Arc::new(SimHeap::new("bench", CAPACITY)),
        )
        .unwrap();
    device
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[4096, 65536, 1024 * 1024];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for (label, flags) in [("sync", HeapFlags::empty()), ("deferred", HeapFlags::DEFER_FREE)] {
        let device = device(flags);
        let client = device.create_client("bench", Some(1)).unwrap();
        for &size in sizes {
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &sz| {
                b.iter(|| {
                    let handle = device
                        .allocate(&client, sz, 1, ALL_HEAPS, BufferFlags::empty())
                        .unwrap();
                    device.free(&client, criterion::black_box(handle)).unwrap();
                });
            });
        }
        device.shutdown();
    }
    group.finish();
}

fn bench_handle_lookup(c: &mut Criterion) {
    let device = device(HeapFlags::empty());
    let client = device.create_client("bench", Some(1)).unwrap();
    let handles: Vec<_> = (0..1000)
        .map(|_| {
            device
                .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
                .unwrap()
        })
        .collect();

    c.bench_function("handle_lookup_1000", |b| {
        b.iter(|| {
            for &handle in &handles {
                criterion::black_box(device.buffer(&client, handle).unwrap());
            }
        });
    });
}

fn bench_alloc_burst(c: &mut Criterion) {
    let device = device(HeapFlags::empty());
    let client = device.create_client("bench", Some(1)).unwrap();
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("256x4K", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..256)
                .map(|_| {
                    device
                        .allocate(&client, 4096, 1, ALL_HEAPS, BufferFlags::empty())
                        .unwrap()
                })
                .collect();
            for handle in handles {
                device.free(&client, handle).unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_handle_lookup,
    bench_alloc_burst
);
criterion_main!(benches);
