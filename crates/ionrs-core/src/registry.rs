//! Device-wide buffer registry.
//!
//! Holds a weak entry per live buffer, ordered by id, for orphan and leak
//! accounting. Entries are inserted at creation and removed by the buffer's
//! own destructor, so holding the registry never keeps a buffer alive.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferId};
use crate::error::{IonError, Result};

#[derive(Debug, Default)]
pub(crate) struct BufferRegistry {
    buffers: Mutex<BTreeMap<BufferId, Weak<Buffer>>>,
    next_id: AtomicU64,
}

impl BufferRegistry {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> BufferId {
        BufferId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn insert(&self, buffer: &Arc<Buffer>) -> Result<()> {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(&buffer.id()) {
            drop(buffers);
            return Err(IonError::invariant(format!(
                "buffer {} registered twice",
                buffer.id()
            )));
        }
        buffers.insert(buffer.id(), Arc::downgrade(buffer));
        Ok(())
    }

    /// Remove the entry for `id` if it still refers to `buffer`.
    pub(crate) fn remove(&self, id: BufferId, buffer: *const Buffer) {
        let mut buffers = self.buffers.lock();
        if buffers
            .get(&id)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), buffer))
        {
            buffers.remove(&id);
        }
    }

    /// Strong references to every live buffer, in id order. The registry
    /// lock is released before the caller sees them.
    pub(crate) fn live(&self) -> Vec<Arc<Buffer>> {
        let buffers = self.buffers.lock();
        buffers.values().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.lock().len()
    }
}
