//! Synapse error types

use thiserror::Error;

/// Synapse error type
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown key, or a retrieval that missed every tier
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Version index outside the key's history
    #[error("Version {version} not found for key '{key}' ({available} versions recorded)")]
    VersionNotFound {
        key: String,
        version: u64,
        available: usize,
    },

    /// Typed buffer inconsistent with its dtype and shape
    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    /// Corrupt or undecodable compressed payload
    #[error("Codec error: {0}")]
    Codec(String),

    /// Accelerator index outside the configured device list
    #[error("Device index {index} not found ({configured} devices configured)")]
    DeviceNotFound { index: usize, configured: usize },

    /// Lease not obtained within the acquire timeout
    #[error("Timed out acquiring lock for '{key}' after {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Mutation refused by the key's permission
    #[error("Permission denied for '{key}': key is {permission}")]
    PermissionDenied { key: String, permission: String },

    /// Key holds a different artifact kind than the one requested
    #[error("Key '{key}' holds a {actual} artifact, not {expected}")]
    KindMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// Spill file does not match the description supplied by the caller
    #[error("Spill file for '{key}' rejected: {reason}")]
    SpillMismatch { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Synapse operations
pub type Result<T> = std::result::Result<T, Error>;
