//! The error taxonomy of the storage engine.
//!
//! Every kind that can cross the public API is a tagged variant here; no
//! panic or unwind crosses the API boundary. Corruption variants are fatal
//! in the sense that the database refuses to continue from them, but they
//! are still *returned* so embedders decide whether to abort.

use thiserror::Error;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum DbError {
    /// The requested key is absent at the requested version.
    #[error("key not found at the requested version")]
    NotFound,

    /// The requested version has slid out of the retained history window.
    #[error("version {0} is outside the retained history window")]
    VersionExpired(u64),

    /// A node record failed its integrity check on deserialization. The
    /// device or metadata is unsafe to proceed from.
    #[error("corrupt node record at offset {0:#018x}")]
    CorruptNode(u64),

    /// Neither metadata copy validated, or the write streams contradict the
    /// recorded root offsets beyond what a rewind can repair.
    #[error("detected corruption: {0}")]
    CorruptMetadata(&'static str),

    /// An underlying device error. Fatal for writes; reads are retried once
    /// before this is propagated.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The database was opened read-only and a write operation was invoked.
    #[error("database is read-only")]
    ReadOnly,

    /// The pool has no free chunk left for a write stream to grow into.
    #[error("storage pool out of free chunks")]
    OutOfSpace,

    /// A structural precondition of the call was violated (reported rather
    /// than asserted so misuse cannot take the process down).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl DbError {
    /// True for the corruption kinds the engine refuses to continue from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::CorruptNode(_) | DbError::CorruptMetadata(_))
    }
}
