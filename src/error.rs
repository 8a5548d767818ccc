//! Global error handling for espore.
//!
//! Every fallible public operation in the crate returns [`Result`]. Low-level
//! I/O errors bubble up wrapped with a short context string describing the
//! operation that failed; the TUI prints the full chain into the output pane
//! and keeps running, while the batch entry points treat any error as fatal.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All the ways an espore operation can fail.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket, filesystem or subprocess I/O.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Malformed JSON, malformed descriptor or bad glob.
    #[error("{context}: {message}")]
    Parse { context: String, message: String },

    /// Missing library, module, file or device image.
    #[error("not found: {0}")]
    NotFound(String),

    /// Deadline reached while awaiting a device token or JSON object.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The device produced something other than the expected token.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Client and device hashes differ after an upload.
    #[error("checksum mismatch: expected {expected}, device reported {reported}")]
    ChecksumMismatch { expected: String, reported: String },

    /// The helper bootstrap did not produce `READY`.
    #[error("runtime install failed: {0}")]
    RuntimeInstallFailed(String),

    /// The device answered a rename request with `RENAME_FAIL`.
    #[error("device failed to rename {old} to {new}")]
    RenameFailed { old: String, new: String },

    /// The device RPC reply carried a non-empty `err` field.
    #[error("device rpc error: {0}")]
    Rpc(String),

    /// The library dependency graph exceeds depth 100.
    #[error("circular dependency involving {0}")]
    CircularDependency(String),

    /// Sentinel used to unwind the TUI loop. Not an error to the user.
    #[error("user quit")]
    UserQuit,
}

impl Error {
    /// Wrap an I/O error with a context string naming the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a `Parse` error from anything that displays.
    pub fn parse(context: impl Into<String>, message: impl ToString) -> Self {
        Error::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }
}
