//! Error types for the allocator core.

use thiserror::Error;

use crate::client::ClientId;
use crate::handle::HandleId;

/// Result type alias using [`IonError`].
pub type Result<T> = std::result::Result<T, IonError>;

/// Every failure an allocator operation can report to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IonError {
    /// Zero length, malformed request, bad registration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle is not present in the client's registry.
    #[error("client {client} holds no handle {handle}")]
    InvalidHandle { client: ClientId, handle: HandleId },

    /// The heap backing the buffer does not implement the capability.
    #[error("heap {heap} does not support {op}")]
    Unsupported { op: &'static str, heap: String },

    /// Every eligible heap failed and reclaim could not help.
    #[error("out of memory allocating {len} bytes from heap mask {heap_mask:#x}")]
    OutOfMemory { len: usize, heap_mask: u32 },

    /// No registered heap is selected by the mask.
    #[error("no registered heap matches mask {heap_mask:#x}")]
    NoMatchingHeap { heap_mask: u32 },

    /// The descriptor does not originate from this allocator.
    #[error("import rejected: {0}")]
    ImportRejected(String),

    /// The descriptor table is full.
    #[error("descriptor table exhausted ({limit} entries)")]
    ResourceExhausted { limit: usize },

    /// The descriptor number is not installed.
    #[error("bad descriptor {0}")]
    BadDescriptor(i32),

    /// A backend failure that is not an out-of-memory condition.
    #[error("heap {heap}: {message}")]
    Backend { heap: String, message: String },

    /// Internal bookkeeping was found inconsistent.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl IonError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unsupported(op: &'static str, heap: impl Into<String>) -> Self {
        Self::Unsupported {
            op,
            heap: heap.into(),
        }
    }

    pub fn backend(heap: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            heap: heap.into(),
            message: message.into(),
        }
    }

    /// Report an internal inconsistency. Debug builds abort here.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "allocator invariant violated");
        debug_assert!(false, "allocator invariant violated: {msg}");
        Self::InvariantViolation(msg)
    }

    /// The errno the control surface reports for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::InvalidHandle { .. } | Self::ImportRejected(_) => {
                libc::EINVAL
            }
            Self::Unsupported { .. } => libc::ENOTTY,
            Self::OutOfMemory { .. } => libc::ENOMEM,
            Self::NoMatchingHeap { .. } => libc::ENODEV,
            Self::ResourceExhausted { .. } => libc::EMFILE,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::Backend { .. } | Self::InvariantViolation(_) => libc::EIO,
        }
    }

    /// Short stable name of the variant, used in structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidHandle { .. } => "invalid_handle",
            Self::Unsupported { .. } => "unsupported",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::NoMatchingHeap { .. } => "no_matching_heap",
            Self::ImportRejected(_) => "import_rejected",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::BadDescriptor(_) => "bad_descriptor",
            Self::Backend { .. } => "backend",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}
