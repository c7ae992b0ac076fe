//! Error handling module for modhost
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Each subsystem owns a narrower error enum (`ManifestError`, `RegistryError`,
//! `ResolveError`, `PackageError`) that converts into `ModhostError` at the
//! orchestration boundary.

use thiserror::Error;

/// Main error type for modhost
#[derive(Error, Debug)]
pub enum ModhostError {
    /// IO errors (file operations, directory walks, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Module path could not be parsed
    #[error("Invalid module path: {0}")]
    ModulePath(String),

    /// Requested module is not part of the discovery set
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// Dependency resolution refused the operation (cycle)
    #[error("Dependency resolution failed: {0}")]
    Resolve(String),

    /// Batched package-manager call failed
    #[error("Package installation failed: {0}")]
    Package(String),

    /// Registry read or write failed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Purge attempted without the confirmation token
    #[error("Purge not confirmed: type {expected} to confirm irreversible removal")]
    PurgeNotConfirmed { expected: &'static str },
}

/// Result type alias for modhost operations
pub type Result<T> = std::result::Result<T, ModhostError>;

// Convenient error constructors
impl ModhostError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
