//! Error types for FreightStore operations.
//!
//! All engine errors are represented by the FreightError enum, which carries
//! enough per-variant context to diagnose a failure without a debugger.
//! A failed compare-and-swap is not an error; it is a normal `false` result.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// FreightStore error types with detailed context.
#[derive(Debug, Clone)]
pub enum FreightError {
    /// I/O operation failed.
    Io {
        /// The file path where the error occurred, when known
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Value encoding or decoding failed: unsupported value shape on
    /// encode, unknown type tag, non-string map key, malformed length.
    Codec {
        /// Description of the offending byte or value
        reason: String,
    },

    /// CRC32 trailer of a V2 record did not match its content.
    Integrity {
        /// Data file holding the record
        path: PathBuf,
        /// Byte offset of the record
        offset: u64,
        /// Checksum stored in the trailer
        expected: u32,
        /// Checksum computed over the record bytes
        actual: u32,
    },

    /// Operation sent to a truck whose worker is gone or was never started.
    NotInitialized {
        /// Truck id the operation addressed
        truck: String,
    },

    /// Request/response command exceeded the configured timeout. The
    /// worker may still complete the request; the reply is dropped.
    Timeout {
        /// Command name, for diagnostics
        command: &'static str,
    },

    /// Envelope decryption failed or no cipher is installed.
    Cipher {
        /// Description of the failure
        reason: String,
    },
}

impl fmt::Display for FreightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreightError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            FreightError::Codec { reason } => {
                write!(f, "codec error: {}", reason)
            }

            FreightError::Integrity { path, offset, expected, actual } => {
                write!(
                    f,
                    "CRC mismatch in {} at offset {}: stored 0x{:08x}, computed 0x{:08x}",
                    path.display(),
                    offset,
                    expected,
                    actual
                )
            }

            FreightError::NotInitialized { truck } => {
                write!(f, "truck '{}' is not initialized", truck)
            }

            FreightError::Timeout { command } => {
                write!(f, "command '{}' timed out", command)
            }

            FreightError::Cipher { reason } => {
                write!(f, "cipher error: {}", reason)
            }
        }
    }
}

impl Error for FreightError {}

impl From<std::io::Error> for FreightError {
    fn from(err: std::io::Error) -> Self {
        FreightError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for FreightStore operations.
pub type FreightResult<T> = Result<T, FreightError>;

/// Attach a path and action description to a raw I/O error.
pub(crate) fn io_err(path: &std::path::Path, action: &str, err: std::io::Error) -> FreightError {
    FreightError::Io {
        path: Some(path.to_path_buf()),
        kind: err.kind(),
        message: format!("{}: {}", action, err),
    }
}
