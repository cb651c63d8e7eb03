//! Per-client handles.
//!
//! A handle is a slot in its client's [`HandleTable`]. The key carries the
//! owning client's id plus a generation-checked slot index, so a freed
//! handle never validates again even after its slot is reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, BufferId, BufferState, OwnerInfo};
use crate::client::ClientId;
use crate::error::Result;
use crate::heap::KernelAddr;
use crate::slots::{SlotKey, SlotTable};

/// Opaque token naming one handle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId {
    pub client: ClientId,
    pub slot: SlotKey,
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/h{}", self.client, self.slot)
    }
}

pub(crate) struct HandleEntry {
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) refs: u32,
    /// Kernel mappings taken through this handle.
    pub(crate) kmap_cnt: u32,
}

impl HandleEntry {
    /// Map through this handle. The first handle-level map takes one
    /// buffer-level mapping; later ones only bump the handle count.
    pub(crate) fn kmap(&mut self, state: &mut BufferState) -> Result<KernelAddr> {
        if self.kmap_cnt > 0 {
            if let Some(addr) = state.vaddr {
                self.kmap_cnt += 1;
                return Ok(addr);
            }
        }
        let addr = self.buffer.kmap_get(state)?;
        self.kmap_cnt = 1;
        Ok(addr)
    }

    /// Returns false if the handle holds no mapping.
    pub(crate) fn kunmap(&mut self, state: &mut BufferState) -> bool {
        match self.kmap_cnt {
            0 => false,
            1 => {
                self.kmap_cnt = 0;
                self.buffer.kmap_put(state);
                true
            }
            _ => {
                self.kmap_cnt -= 1;
                true
            }
        }
    }

    /// Release everything the handle holds on its buffer and give back the
    /// buffer reference. The caller drops it once the client lock is gone.
    pub(crate) fn retire(mut self, owner: &OwnerInfo) -> Arc<Buffer> {
        if self.kmap_cnt > 0 {
            let buffer = Arc::clone(&self.buffer);
            let mut state = buffer.lock_state();
            self.kmap_cnt = 1;
            self.kunmap(&mut state);
        }
        self.buffer.remove_handle(owner);
        self.buffer
    }
}

/// A client's registry of handles.
#[derive(Default)]
pub(crate) struct HandleTable {
    slots: SlotTable<HandleEntry>,
    by_buffer: HashMap<BufferId, SlotKey>,
}

impl HandleTable {
    /// Bind a new handle to `buffer` with one reference.
    pub(crate) fn insert(&mut self, buffer: Arc<Buffer>) -> SlotKey {
        buffer.add_handle();
        let id = buffer.id();
        let key = self.slots.insert(HandleEntry {
            buffer,
            refs: 1,
            kmap_cnt: 0,
        });
        self.by_buffer.insert(id, key);
        key
    }

    pub(crate) fn get(&self, key: SlotKey) -> Option<&HandleEntry> {
        self.slots.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: SlotKey) -> Option<&mut HandleEntry> {
        self.slots.get_mut(key)
    }

    pub(crate) fn find_by_buffer(&self, id: BufferId) -> Option<SlotKey> {
        self.by_buffer.get(&id).copied()
    }

    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<HandleEntry> {
        let entry = self.slots.remove(key)?;
        self.by_buffer.remove(&entry.buffer.id());
        Some(entry)
    }

    pub(crate) fn drain(&mut self) -> Vec<HandleEntry> {
        self.by_buffer.clear();
        self.slots.drain().into_iter().map(|(_, e)| e).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotKey, &HandleEntry)> {
        self.slots.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_id_display() {
        let id = HandleId {
            client: ClientId(3),
            slot: SlotKey {
                index: 4,
                generation: 1,
            },
        };
        assert_eq!(id.to_string(), "c3/h4.1");
    }
}
