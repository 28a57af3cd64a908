//! Unified error handling for Medisense
//!
//! This crate provides the single error type shared by the bridge components.
//! Per-frame and per-request errors are reported through it and handled where
//! they are detected; only configuration errors are fatal, and only at start-up.

use std::io;
use std::path::PathBuf;

/// Result type alias using MedisenseError
pub type Result<T> = std::result::Result<T, MedisenseError>;

/// Unified error type for all Medisense operations
#[derive(thiserror::Error, Debug)]
pub enum MedisenseError {
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

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Acquisition Errors
    // ============================================================================
    /// Device absent or permission denied when opening the transport.
    #[error("Transport unavailable on {port}: {reason}")]
    TransportUnavailable {
        port: String,
        reason: String,
    },

    /// I/O error while a channel was streaming.
    #[error("Transport failure on {port}: {source}")]
    TransportFailure {
        port: String,
        source: io::Error,
    },

    #[error("Undecodable frame on {channel}: {reason}")]
    DecodeFailure {
        channel: String,
        reason: String,
    },

    #[error("Reading rejected for {kind}: {reason}")]
    ValidationRejection {
        kind: String,
        reason: String,
    },

    // ============================================================================
    // Protocol Errors
    // ============================================================================
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    #[error("Session closed")]
    SessionClosed,

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Alias {alias:?} maps to both {first} and {second}")]
    AliasConflict {
        alias: String,
        first: String,
        second: String,
    },

    #[error("No sensor specification for {0}")]
    MissingSensorSpec(String),
}

impl MedisenseError {
    /// Create an invalid configuration error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport-unavailable error
    pub fn unavailable(port: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransportUnavailable {
            port: port.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap an I/O error raised while streaming from `port`
    pub fn transport(port: impl Into<String>, source: io::Error) -> Self {
        Self::TransportFailure {
            port: port.into(),
            source,
        }
    }

    /// Create a protocol error from a string
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors that should move a streaming channel towards `Degraded`
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure { .. } | Self::Io(_))
    }
}
