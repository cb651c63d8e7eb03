//! Termination delivery for reclaim victims.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use ionrs_core::{Client, ClientId, Device, IonError, Result, Terminator};

/// Sends a signal to the victim's process with `kill(2)`.
#[derive(Debug, Clone, Copy)]
pub struct SignalTerminator {
    signal: i32,
}

impl SignalTerminator {
    /// Terminates with `SIGKILL`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_signal(libc::SIGKILL)
    }

    #[must_use]
    pub fn with_signal(signal: i32) -> Self {
        Self { signal }
    }

    #[must_use]
    pub fn signal(&self) -> i32 {
        self.signal
    }
}

impl Default for SignalTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminator for SignalTerminator {
    fn terminate(&self, victim: &Arc<Client>) -> Result<()> {
        let Some(pid) = victim.pid() else {
            return Err(IonError::invalid(format!(
                "client {} has no process to signal",
                victim.id()
            )));
        };
        // Zero and negative pids address process groups.
        let pid = libc::pid_t::try_from(pid)
            .ok()
            .filter(|&p| p > 0)
            .ok_or_else(|| IonError::invalid(format!("pid {pid} cannot be signalled")))?;

        #[allow(unsafe_code)]
        // SAFETY: kill(2) takes two integers and does not touch our memory.
        let rc = unsafe { libc::kill(pid, self.signal) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(IonError::backend(
                "terminator",
                format!("kill({pid}, {}): {err}", self.signal),
            ));
        }
        victim.signal_fatal();
        tracing::info!(client = %victim.id(), pid, signal = self.signal, "termination signal delivered");
        Ok(())
    }
}

/// One call observed by a [`RecordingTerminator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRecord {
    pub client: ClientId,
    pub pid: Option<u32>,
    pub name: String,
}

/// Records victims instead of signalling them. When attached to a device
/// and built with [`RecordingTerminator::releasing`], it also destroys the
/// victim's session, standing in for the process exiting.
#[derive(Default)]
pub struct RecordingTerminator {
    victims: Mutex<Vec<TerminationRecord>>,
    device: OnceLock<Weak<Device>>,
    release: bool,
    refuse: AtomicBool,
}

impl RecordingTerminator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn releasing() -> Self {
        Self {
            release: true,
            ..Self::default()
        }
    }

    /// Device whose clients are destroyed on termination. Only the first
    /// call has any effect.
    pub fn attach(&self, device: &Arc<Device>) {
        let _ = self.device.set(Arc::downgrade(device));
    }

    /// Make every later termination fail, as if the signal could not be sent.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    #[must_use]
    pub fn victims(&self) -> Vec<TerminationRecord> {
        self.victims.lock().clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.victims.lock().len()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, victim: &Arc<Client>) -> Result<()> {
        self.victims.lock().push(TerminationRecord {
            client: victim.id(),
            pid: victim.pid(),
            name: victim.name().to_owned(),
        });
        if self.refuse.load(Ordering::Relaxed) {
            return Err(IonError::backend("terminator", "termination refused"));
        }
        victim.signal_fatal();
        if !self.release {
            return Ok(());
        }
        match self.device.get().and_then(Weak::upgrade) {
            Some(device) => device.destroy_client(victim),
            None => Ok(()),
        }
    }
}
