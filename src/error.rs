//! Error types for the engine.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Container name does not match the allowed pattern.
    #[error("invalid container name ({name}), only {pattern} are allowed")]
    InvalidName { name: String, pattern: &'static str },

    /// Container or image ID is malformed.
    #[error("invalid ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Run or host configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No graph driver registered under this name.
    #[error("graph driver '{0}' not supported")]
    DriverNotSupported(String),

    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found.
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// Container already registered with the daemon.
    #[error("container {0} is already loaded")]
    ContainerAlreadyExists(String),

    /// Name already held by a live container.
    #[error(
        "conflict: the name \"{name}\" is already in use by container {holder}. \
         You have to remove (or rename) that container to be able to reuse that name"
    )]
    NameConflict { name: String, holder: String },

    /// Container is in wrong state for operation.
    #[error("container '{id}' is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    // =========================================================================
    // Resource Allocation Errors
    // =========================================================================
    /// Network interface or port allocation failed.
    #[error("network allocation failed for '{id}': {reason}")]
    NetworkAllocation { id: String, reason: String },

    /// Mounting a layer failed or returned an unexpected path.
    #[error("failed to mount '{id}': {reason}")]
    MountFailed { id: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Image not found in the graph.
    #[error("could not find image: {0}")]
    ImageNotFound(String),

    /// Image already registered in the graph.
    #[error("image {0} already exists")]
    ImageAlreadyExists(String),

    /// Prefix matches more than one ID.
    #[error("multiple IDs found with provided prefix: {0}")]
    AmbiguousPrefix(String),

    /// Layer storage missing from the graph driver.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Persisted record is unreadable or inconsistent.
    #[error("corrupt record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// Link graph operation failed.
    #[error("link graph error: {0}")]
    LinkGraph(String),

    /// Name already present in the link graph.
    #[error("name is not unique: {0}")]
    NonUniqueName(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Execution driver reported a failure.
    #[error("execution driver error: {0}")]
    ExecDriver(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error means the thing looked up does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ContainerNotFound(_) | Self::ImageNotFound(_) | Self::LayerNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
