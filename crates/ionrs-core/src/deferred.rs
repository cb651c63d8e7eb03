//! Deferred buffer destruction.
//!
//! A heap registered with `DEFER_FREE` owns one of these lists. Releasing a
//! buffer sends its remains down an unbounded channel and returns at once;
//! a dedicated worker thread receives and destroys them one at a time,
//! blocking on the channel while it is empty. `drain` lets an allocation
//! that failed on the heap force pending frees to complete on the calling
//! thread before retrying.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::error::{IonError, Result};
use crate::heap::{BufferRemains, HeapCore};
use crate::metrics::DeviceMetrics;

#[derive(Default)]
struct Pending {
    bytes: AtomicUsize,
    buffers: AtomicUsize,
}

impl Pending {
    fn add(&self, size: usize) {
        self.bytes.fetch_add(size, Ordering::AcqRel);
        self.buffers.fetch_add(1, Ordering::AcqRel);
    }

    fn complete(&self, size: usize) {
        self.bytes.fetch_sub(size, Ordering::AcqRel);
        self.buffers.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct DeferredFreeList {
    heap: String,
    /// `None` once the list has been shut down.
    sender: Mutex<Option<Sender<BufferRemains>>>,
    receiver: Receiver<BufferRemains>,
    pending: Arc<Pending>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredFreeList {
    pub(crate) fn spawn(core: Arc<HeapCore>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let pending = Arc::new(Pending::default());
        let name = format!("ion-free-{}", core.descriptor.name);

        let worker_rx = receiver.clone();
        let worker_pending = Arc::clone(&pending);
        let worker_core = Arc::clone(&core);
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(&worker_core, &worker_rx, &worker_pending))
            .map_err(|e| {
                IonError::backend(
                    core.descriptor.name.clone(),
                    format!("spawning deferred free worker: {e}"),
                )
            })?;

        tracing::debug!(heap = %core.descriptor.name, "deferred free worker started");
        Ok(Self {
            heap: core.descriptor.name.clone(),
            sender: Mutex::new(Some(sender)),
            receiver,
            pending,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `remains` for the worker. After shutdown the buffer is
    /// destroyed on the calling thread instead.
    pub(crate) fn enqueue(&self, core: &HeapCore, remains: BufferRemains) {
        let size = remains.size;
        let id = remains.id;
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            drop(sender);
            core.destroy_deferred(remains);
            return;
        };
        self.pending.add(size);
        if let Err(returned) = tx.send(remains) {
            // Receivers live as long as `self`; only reachable if the worker
            // and every receiver clone are gone.
            drop(sender);
            self.pending.complete(size);
            core.destroy_deferred(returned.into_inner());
            return;
        }
        drop(sender);
        DeviceMetrics::inc(&core.metrics.deferred_enqueued);
        tracing::debug!(heap = %core.descriptor.name, buffer = %id, len = size, "buffer queued for deferred free");
    }

    /// Destroy everything currently queued on this thread.
    pub(crate) fn drain(&self, core: &HeapCore) -> usize {
        let mut drained = 0;
        while let Ok(remains) = self.receiver.try_recv() {
            let size = remains.size;
            core.destroy_deferred(remains);
            self.pending.complete(size);
            drained += 1;
        }
        if drained > 0 {
            DeviceMetrics::inc(&core.metrics.drains);
            tracing::debug!(heap = %core.descriptor.name, drained, "drained deferred free list");
        }
        drained
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending.bytes.load(Ordering::Acquire)
    }

    pub(crate) fn pending_buffers(&self) -> usize {
        self.pending.buffers.load(Ordering::Acquire)
    }

    /// Close the channel, let the worker finish the queue, and join it.
    pub(crate) fn shutdown(&self, core: &HeapCore) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                tracing::error!(heap = %core.descriptor.name, "deferred free worker panicked");
            }
            tracing::debug!(heap = %core.descriptor.name, "deferred free worker stopped");
        }
        // Anything the worker left behind.
        self.drain(core);
    }
}

impl Drop for DeferredFreeList {
    fn drop(&mut self) {
        drop(self.sender.get_mut().take());
        if let Some(handle) = self.worker.get_mut().take() {
            if handle.join().is_err() {
                tracing::error!(heap = %self.heap, "deferred free worker panicked");
            }
        }
    }
}

fn run_worker(core: &HeapCore, rx: &Receiver<BufferRemains>, pending: &Pending) {
    for remains in rx.iter() {
        let size = remains.size;
        core.destroy_deferred(remains);
        pending.complete(size);
    }
}
