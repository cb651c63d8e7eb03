//! Seeded multi-threaded allocate/share/free workloads.
//!
//! Every worker owns one client and drives it with its own xorshift stream.
//! Exported descriptors go onto a shared board where any worker may import
//! them, so buffers regularly outlive the client that allocated them.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ionrs_core::{
    ALL_HEAPS, BufferFlags, Device, DeviceConfig, Fd, HandleId, HeapDescriptor, HeapFlags,
    HeapKind, IonError, MetricsSnapshot, Result,
};

use crate::sim_heap::SimHeap;

/// xorshift64 generator. Deterministic for a given seed.
#[derive(Debug, Clone)]
pub struct XorShift(u64);

impl XorShift {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // The all-zero state is a fixed point.
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `0..bound`; `bound` must be non-zero.
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub threads: usize,
    pub iterations: usize,
    pub seed: u64,
    /// Largest single request in bytes.
    pub max_len: usize,
    /// Simulation heap budget in bytes.
    pub capacity: usize,
    pub defer_free: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 1000,
            seed: 0x2545_F491_4F6C_DD1D,
            max_len: 64 * 1024,
            capacity: 16 * 1024 * 1024,
            defer_free: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StressReport {
    pub operations: u64,
    pub allocations: u64,
    pub out_of_memory: u64,
    pub exports: u64,
    pub imports: u64,
    pub frees: u64,
    /// Backend bytes still held after every client was torn down.
    pub leaked_bytes: usize,
    pub metrics: MetricsSnapshot,
}

impl StressReport {
    fn absorb(&mut self, other: &WorkerCounts) {
        self.operations += other.operations;
        self.allocations += other.allocations;
        self.out_of_memory += other.out_of_memory;
        self.exports += other.exports;
        self.imports += other.imports;
        self.frees += other.frees;
    }
}

#[derive(Default)]
struct WorkerCounts {
    operations: u64,
    allocations: u64,
    out_of_memory: u64,
    exports: u64,
    imports: u64,
    frees: u64,
}

/// Run `config` against a fresh device with one simulation heap.
pub fn run(config: &StressConfig) -> Result<StressReport> {
    if config.threads == 0 || config.max_len == 0 {
        return Err(IonError::invalid("stress needs at least one thread and a non-zero max_len"));
    }
    let device = Arc::new(Device::new(DeviceConfig::default())?);
    let sim = Arc::new(SimHeap::new("stress", config.capacity));
    let mut descriptor = HeapDescriptor::new(0, "stress", HeapKind::System);
    if config.defer_free {
        descriptor = descriptor.with_flags(HeapFlags::DEFER_FREE);
    }
    device.add_heap(descriptor, sim.clone())?;
    let board: Mutex<Vec<Fd>> = Mutex::new(Vec::new());

    let results: Vec<Result<WorkerCounts>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.threads)
            .map(|index| {
                let device = &device;
                let board = &board;
                scope.spawn(move || worker(device, board, config, index))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| {
                w.join()
                    .unwrap_or_else(|_| Err(IonError::backend("stress", "worker panicked")))
            })
            .collect()
    });

    for fd in board.into_inner() {
        device.close(fd)?;
    }
    device.shutdown();

    let mut report = StressReport::default();
    for counts in results {
        report.absorb(&counts?);
    }
    report.leaked_bytes = sim.used();
    report.metrics = device.metrics();
    tracing::info!(
        operations = report.operations,
        allocations = report.allocations,
        out_of_memory = report.out_of_memory,
        leaked = report.leaked_bytes,
        "stress run finished"
    );
    Ok(report)
}

fn worker(
    device: &Device,
    board: &Mutex<Vec<Fd>>,
    config: &StressConfig,
    index: usize,
) -> Result<WorkerCounts> {
    let client = device.create_client(format!("stress-{index}"), None)?;
    let mut rng = XorShift::new(config.seed ^ (index as u64).wrapping_mul(0x9E37_79B9));
    let mut held: Vec<HandleId> = Vec::new();
    let mut counts = WorkerCounts::default();

    for _ in 0..config.iterations {
        counts.operations += 1;
        match rng.below(5) {
            0 | 1 => {
                let len = rng.below(config.max_len) + 1;
                match device.allocate(&client, len, 1, ALL_HEAPS, BufferFlags::empty()) {
                    Ok(handle) => {
                        held.push(handle);
                        counts.allocations += 1;
                    }
                    Err(IonError::OutOfMemory { .. }) => counts.out_of_memory += 1,
                    Err(err) => return Err(err),
                }
            }
            2 if !held.is_empty() => {
                let handle = held[rng.below(held.len())];
                match device.export(&client, handle) {
                    Ok(fd) => {
                        board.lock().push(fd);
                        counts.exports += 1;
                    }
                    Err(IonError::ResourceExhausted { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            3 => {
                let fd = board.lock().pop();
                if let Some(fd) = fd {
                    held.push(device.import(&client, fd)?);
                    device.close(fd)?;
                    counts.imports += 1;
                }
            }
            _ if !held.is_empty() => {
                let handle = held.swap_remove(rng.below(held.len()));
                device.free(&client, handle)?;
                counts.frees += 1;
            }
            _ => {}
        }
    }

    for handle in held.drain(..) {
        device.free(&client, handle)?;
        counts.frees += 1;
    }
    device.destroy_client(&client)?;
    Ok(counts)
}
