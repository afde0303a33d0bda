//! Error types for the collector
//!
//! Every fallible operation returns [`GcResult`]. Errors are grouped into
//! [`ErrorKind`]s so callers can decide whether to retry, abort, or report.

use thiserror::Error;

/// Broad classification of a [`GcError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out of memory or out of regions; trigger a cycle and retry
    ResourceExhaustion,
    /// The caller passed something invalid
    InvariantViolation,
    /// A lock was poisoned or a CAS loop gave up
    Concurrency,
    /// The collector itself is broken
    Internal,
    /// The collector has been shut down
    Shutdown,
}

/// Collector bugs. Never recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalError {
    /// An old address was forwarded twice in one cycle
    #[error("forwarding entry for {old:#x} inserted twice (existing {existing:#x}, new {new:#x})")]
    ForwardingDoubleInsert {
        /// Pre-relocation address
        old: usize,
        /// Entry already in the table
        existing: usize,
        /// Entry being inserted
        new: usize,
    },

    /// A region was handed back to the heap twice
    #[error("region {id} retired twice")]
    RegionDoubleRetire {
        /// Region id
        id: u32,
    },

    /// A live object was found where the collector cannot account for it
    #[error("heap corruption: {0}")]
    Corruption(String),
}

/// Errors that can occur during collector operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// Committing more memory would exceed `max_heap_size`
    #[error("out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes still committable
        available: usize,
    },

    /// No free extent of the reserved range is large enough
    #[error("out of regions: no free extent of {requested} bytes")]
    OutOfRegions {
        /// Region size requested
        requested: usize,
    },

    /// The virtual range could not be reserved
    #[error("heap initialization failed: {0}")]
    HeapInitialization(String),

    /// The configuration is inconsistent
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An address outside the heap, or not at an object start
    #[error("invalid pointer: {address:#x}")]
    InvalidPointer {
        /// Offending address
        address: usize,
    },

    /// An allocation request with an unsupported size or alignment
    #[error("alignment error: size {size} with alignment {align}")]
    Alignment {
        /// Requested size
        size: usize,
        /// Requested alignment
        align: usize,
    },

    /// A zero-sized request, or one larger than the heap can ever hold
    #[error("invalid allocation size {size}")]
    InvalidSize {
        /// Requested size
        size: usize,
    },

    /// A slot offset beyond the end of an object, or not word aligned
    #[error("bounds check failed: offset {offset} out of bounds for object of {size} bytes")]
    OutOfBounds {
        /// Offending offset
        offset: usize,
        /// Object payload size
        size: usize,
    },

    /// A root handle that is not (or no longer) registered
    #[error("unknown root handle {0}")]
    UnknownRoot(u64),

    /// A weak reference handle that is not (or no longer) registered
    #[error("unknown weak reference {0}")]
    UnknownWeakRef(u64),

    /// A callback or worker panicked while holding collector state; the
    /// cycle it ran in was abandoned
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// A compare-and-swap loop gave up
    #[error("{operation} gave up after {attempts} contended CAS attempts")]
    CasRetryExhausted {
        /// What was being updated
        operation: &'static str,
        /// Attempts made
        attempts: u32,
    },

    /// A collector bug
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),

    /// The collector has been shut down
    #[error("collector is shut down")]
    Shutdown,
}

impl GcError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GcError::OutOfMemory { .. } | GcError::OutOfRegions { .. } => {
                ErrorKind::ResourceExhaustion
            }
            GcError::HeapInitialization(_)
            | GcError::Configuration(_)
            | GcError::InvalidPointer { .. }
            | GcError::Alignment { .. }
            | GcError::InvalidSize { .. }
            | GcError::OutOfBounds { .. }
            | GcError::UnknownRoot(_)
            | GcError::UnknownWeakRef(_) => ErrorKind::InvariantViolation,
            GcError::LockPoisoned(_) | GcError::CasRetryExhausted { .. } => ErrorKind::Concurrency,
            GcError::Internal(_) => ErrorKind::Internal,
            GcError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Whether retrying (after a collection) can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhaustion | ErrorKind::Concurrency
        )
    }

    /// Whether this error means the collector can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        GcError::Internal(InternalError::Corruption(message.into()))
    }
}

/// Result type alias for collector operations
pub type GcResult<T> = Result<T, GcError>;
