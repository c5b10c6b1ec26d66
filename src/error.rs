//! Error types for the container lifecycle engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Malformed configuration, device entry or argument.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A user update attempted to change an engine-owned key.
    #[error("key '{0}' can only be set by the engine")]
    VolatileKey(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Another operation is already running against the instance.
    #[error("instance '{instance}' is busy running {action}")]
    Busy { instance: String, action: String },

    /// A protection flag forbids the requested action.
    #[error("instance '{instance}' is protected against {action}")]
    Protected { instance: String, action: String },

    /// The instance is in the wrong state for the operation.
    #[error("instance '{instance}' is {state}, expected {expected}")]
    InvalidState {
        instance: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Capability Errors
    // =========================================================================
    /// The kind or feature is not available on this host.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Sentinel: the device kind has no typed implementation and the
    /// caller should fall back to the legacy code path.
    #[error("device type '{0}' has no typed implementation")]
    UnsupportedDevType(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Instance, device, snapshot or pool not found.
    #[error("not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The storage pool refused or failed the request.
    #[error("storage unavailable for '{instance}': {reason}")]
    StorageUnavailable { instance: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// The low-level container runtime failed. `log_tail` carries any
    /// `ERROR` lines recovered from the runtime log.
    #[error("runtime error: {reason}{}", .log_tail.as_deref().map(|t| format!("\n{t}")).unwrap_or_default())]
    Runtime {
        reason: String,
        log_tail: Option<String>,
    },

    /// A lifecycle hook failed; the container was stopped.
    #[error("hook '{hook}' failed: {reason}")]
    Hook { hook: String, reason: String },

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// A bounded call exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A required path is missing on the host.
    #[error("missing source path: {0}")]
    MissingSource(PathBuf),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error is the typed-device fall-through sentinel.
    pub fn is_unsupported_dev_type(&self) -> bool {
        matches!(self, Error::UnsupportedDevType(_))
    }

    /// Wraps a low-level runtime failure without log context.
    pub fn runtime(reason: impl Into<String>) -> Self {
        Error::Runtime {
            reason: reason.into(),
            log_tail: None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}
