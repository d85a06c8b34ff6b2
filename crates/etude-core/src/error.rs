//! Error kinds shared by every LibEtude crate
//!
//! One enum covers the whole runtime so errors compose across crate
//! boundaries with `?`. Each variant corresponds to a distinct failure
//! class; callers are expected to match on the kind, not parse messages.

use thiserror::Error;

/// Convenience alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Null-equivalent, out-of-range, or inconsistent parameter. Returned
    /// before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation failure or capacity overflow. Partially constructed
    /// objects are torn down before this is returned.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Registry or monitor API called before `init`.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    /// Second `start` on an already-running component. Duplicate registry
    /// `init` calls do NOT produce this; they are idempotent successes.
    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    /// No kernel, layer, or operator matched the query.
    #[error("not found: {0}")]
    NotFound(String),

    /// Structural violation: graph cycle, missing predecessor, duplicate
    /// registration, unbound input.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying file open/read/write failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic/version/size/index inconsistency in a model container.
    #[error("format error: {0}")]
    Format(String),

    /// Checksum or model-hash mismatch. Distinct from [`Error::Format`]:
    /// the bytes parsed, but do not match their recorded digest.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Requested kernel or backend is not available in this build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Graph execution aborted; `node` names the failing node.
    #[error("node '{node}' failed: {source}")]
    NodeExecution {
        node: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Error::OutOfMemory(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::Integrity(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Wraps an execution failure with the name of the node it occurred in.
    pub fn in_node(self, node: impl Into<String>) -> Self {
        Error::NodeExecution {
            node: node.into(),
            source: Box::new(self),
        }
    }
}
