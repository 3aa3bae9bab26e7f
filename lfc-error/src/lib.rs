//! Unified error handling for LinuxFanControl
//!
//! This crate provides a single error type used across all LinuxFanControl
//! components. It uses thiserror for ergonomic error definitions with proper
//! Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using LfcError
pub type Result<T> = std::result::Result<T, LfcError>;

/// Unified error type for all LinuxFanControl operations
#[derive(thiserror::Error, Debug)]
pub enum LfcError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ============================================================================
    // Hardware Access Errors
    // ============================================================================
    #[error("Failed to read temperature from {path}: {reason}")]
    TempRead {
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to read fan RPM from {path}: {reason}")]
    FanRead {
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to write PWM to {path}: {reason}")]
    PwmWrite {
        path: PathBuf,
        reason: String,
    },

    #[error("Hardware not found: {0}")]
    HardwareNotFound(String),

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Curve validation failed: {0}")]
    InvalidCurve(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Configuration and Serialization Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Runtime / Lifecycle Errors
    // ============================================================================
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LfcError {
    /// Create an invalid-argument error from a string
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not-found error from a string
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a busy error from a string
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create an internal error from a string
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error stems from a refused sysfs write
    pub fn is_permission(&self) -> bool {
        match self {
            Self::PermissionDenied(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            Self::FileWrite { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

// Allow converting from String to LfcError
impl From<String> for LfcError {
    fn from(s: String) -> Self {
        Self::Internal(s)
    }
}

// Allow converting from &str to LfcError
impl From<&str> for LfcError {
    fn from(s: &str) -> Self {
        Self::Internal(s.to_string())
    }
}
