//! Last-resort reclaim: pick a memory-holding consumer and terminate it.
//!
//! Candidates are scanned heap by heap (priority order) and client by client
//! (creation order). A candidate replaces the current selection only with a
//! strictly higher reclaim priority, or an equal priority and strictly larger
//! usage on the scanned heap, so the first one seen wins exact ties. A client
//! already signalled whose grace period is still running stops the scan:
//! the caller waits for it instead of picking a second victim.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::client::{Client, ClientId};
use crate::config::ReclaimConfig;
use crate::device::Device;
use crate::error::Result;
use crate::heap::Heap;
use crate::metrics::DeviceMetrics;

/// Delivers the termination signal to a consumer. The host integration
/// layer supplies the real mechanism.
pub trait Terminator: Send + Sync {
    fn terminate(&self, victim: &Arc<Client>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// A victim was signalled; `size` is its usage on the selecting heap.
    Victim {
        client: ClientId,
        pid: u32,
        size: usize,
    },
    /// An earlier victim is still within its grace period.
    InProgress { client: ClientId },
    NoCandidate,
}

impl ReclaimOutcome {
    /// Whether the allocation engine should sleep and retry.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::NoCandidate)
    }

    #[must_use]
    pub fn reclaimed(&self) -> usize {
        match self {
            Self::Victim { size, .. } => *size,
            _ => 0,
        }
    }
}

pub(crate) struct ReclaimController {
    terminator: Arc<dyn Terminator>,
    config: ReclaimConfig,
    scans: AtomicU64,
}

struct Candidate {
    client: Arc<Client>,
    heap: String,
    priority: i32,
    size: usize,
}

enum Selection {
    Victim(Candidate),
    InProgress(ClientId),
    None,
}

impl ReclaimController {
    pub(crate) fn new(terminator: Arc<dyn Terminator>, config: ReclaimConfig) -> Self {
        Self {
            terminator,
            config,
            scans: AtomicU64::new(0),
        }
    }

    fn select<'a>(
        &self,
        heaps: &[Arc<Heap>],
        clients: impl Iterator<Item = &'a Arc<Client>> + Clone,
        heap_mask: u32,
        min_priority: i32,
        now: Instant,
    ) -> Selection {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let mut selected: Option<Candidate> = None;
        for heap in heaps.iter().filter(|h| heap_mask & h.mask_bit() != 0) {
            for client in clients.clone() {
                if client.is_kernel() {
                    continue;
                }
                if let Some(deadline) = client.termination_deadline() {
                    if now <= deadline {
                        return Selection::InProgress(client.id());
                    }
                    continue;
                }
                let priority = client.reclaim_priority();
                if priority < min_priority {
                    continue;
                }
                let size = client.heap_totals(heap.id()).size;
                if size == 0 {
                    continue;
                }
                let replaces = selected.as_ref().is_none_or(|current| {
                    priority > current.priority
                        || (priority == current.priority && size > current.size)
                });
                if replaces {
                    selected = Some(Candidate {
                        client: Arc::clone(client),
                        heap: heap.name().to_owned(),
                        priority,
                        size,
                    });
                }
            }
        }
        selected.map_or(Selection::None, Selection::Victim)
    }
}

impl Device {
    /// Scan for a victim on the heaps in `heap_mask` among clients at or
    /// above `min_priority`, and signal it. `required` is the allocation
    /// that failed; zero for a proactive scan.
    pub fn shrink(&self, heap_mask: u32, min_priority: i32, required: usize) -> ReclaimOutcome {
        let Some(controller) = &self.reclaim else {
            return ReclaimOutcome::NoCandidate;
        };
        let now = Instant::now();
        let selection = {
            let registry = self.registry.read();
            controller.select(
                &registry.heaps,
                registry.clients.values(),
                heap_mask,
                min_priority,
                now,
            )
        };
        let candidate = match selection {
            Selection::Victim(candidate) => candidate,
            Selection::InProgress(client) => {
                tracing::debug!(%client, "reclaim already in progress");
                return ReclaimOutcome::InProgress { client };
            }
            Selection::None => {
                tracing::debug!(heap_mask, min_priority, required, "no reclaim candidate");
                return ReclaimOutcome::NoCandidate;
            }
        };

        let victim = candidate.client;
        let deadline = now + controller.config.grace_period();
        if !victim.begin_termination(now, deadline) {
            return ReclaimOutcome::InProgress {
                client: victim.id(),
            };
        }
        if required > 0 {
            DeviceMetrics::inc(&self.metrics.oom_kill_count);
        }
        let pid = victim.pid().unwrap_or_default();
        tracing::info!(
            client = %victim.id(),
            pid,
            name = %victim.name(),
            heap = %candidate.heap,
            priority = candidate.priority,
            size = candidate.size,
            required,
            "reclaim: terminating consumer"
        );
        if let Err(err) = controller.terminator.terminate(&victim) {
            tracing::warn!(client = %victim.id(), pid, error = %err, "termination signal failed");
        }
        ReclaimOutcome::Victim {
            client: victim.id(),
            pid,
            size: candidate.size,
        }
    }

    /// Proactive reclaim on a heap reporting pressure after an allocation.
    pub(crate) fn shrink_on_hint(&self, heap: &Heap) {
        let Some(hint) = heap.backend().shrink_hint() else {
            return;
        };
        tracing::debug!(heap = %heap.name(), min_priority = hint.min_priority, min_free = hint.min_free, "heap requested reclaim");
        self.shrink(heap.mask_bit(), hint.min_priority, 0);
    }

    /// Reclaim scans performed so far.
    #[must_use]
    pub fn reclaim_scans(&self) -> u64 {
        self.reclaim
            .as_ref()
            .map_or(0, |c| c.scans.load(Ordering::Relaxed))
    }
}
