//! Shared error taxonomy for every `queue-*` crate.
//!
//! Mirrors `obsidian-config`/`onyx-config`'s `thiserror`-derived
//! `ConfigError` pattern, generalized to the seven error kinds the queue
//! specification distinguishes. Messages are written to contain the
//! well-defined substrings (`"parameter"`, `"format"`, `"different
//! parameters"`, `"interrupted"`) that tests assert on.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Invalid argument, rejected before any I/O takes place.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// A file's marker, version, record size, or length failed validation
    /// on open.
    #[error("invalid format: {0}")]
    Format(String),

    /// `ConfigFile::create` found a compatible file whose stored
    /// parameters differ from those requested.
    #[error("queue exists with different parameters: {0}")]
    ExistsWithDifferentParameters(String),

    /// Underlying read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The calling thread's wait was interrupted.
    #[error("operation interrupted")]
    Interrupted,

    /// Internal invariant violation. Should be unreachable in correct
    /// code; kept as a distinct variant so tests can assert on it.
    #[error("internal invariant violated: {0}")]
    State(String),

    /// `delete` of a message that is already gone. Never actually
    /// constructed as an `Err` — `Queue::delete` treats this case as a
    /// silent success — but kept as a named variant so the taxonomy
    /// documented in the spec has a concrete type.
    #[error("message already deleted")]
    NotApplicable,
}

pub type Result<T> = std::result::Result<T, QueueError>;
