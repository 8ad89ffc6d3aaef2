//! Error types and handling for Wallbox Sync
//!
//! This module defines the error taxonomy used throughout the synchronization
//! layer. Per-block and per-field failures are absorbed into snapshots;
//! connection-level and authentication-level failures escalate as values of
//! [`WallboxError`].

use thiserror::Error;

/// Result type alias for Wallbox Sync operations
pub type Result<T> = std::result::Result<T, WallboxError>;

/// Main error type for Wallbox Sync
#[derive(Debug, Error)]
pub enum WallboxError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The Modbus connection could not be established after bounded retries
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// A single block or field could not be read
    #[error("Transient read error: {message}")]
    TransientRead { message: String },

    /// A write was refused by validation or by the device
    #[error("Write rejected for {key}: {cause}")]
    WriteRejected { key: String, cause: String },

    /// The REST token was refused and could not be recovered
    #[error("Authentication expired: {message}")]
    AuthExpired { message: String },

    /// A poll cycle could not produce a new snapshot
    #[error("Update failed: {message}")]
    UpdateFailed { message: String },

    /// Modbus protocol errors that are not tied to a specific write
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Non-success HTTP status from the wallbox web API
    #[error("HTTP error {status} on {path}: {body}")]
    Http {
        status: u16,
        path: String,
        body: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl WallboxError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new connection failure
    pub fn connection_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create a new transient read error
    pub fn transient_read<S: Into<String>>(message: S) -> Self {
        Self::TransientRead {
            message: message.into(),
        }
    }

    /// Create a new write rejection
    pub fn write_rejected<K: Into<String>, C: Into<String>>(key: K, cause: C) -> Self {
        Self::WriteRejected {
            key: key.into(),
            cause: cause.into(),
        }
    }

    /// Create a new authentication expiry error
    pub fn auth_expired<S: Into<String>>(message: S) -> Self {
        Self::AuthExpired {
            message: message.into(),
        }
    }

    /// Create a new update failure
    pub fn update_failed<S: Into<String>>(message: S) -> Self {
        Self::UpdateFailed {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        Self::Modbus {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new HTTP status error
    pub fn http<P: Into<String>, B: Into<String>>(status: u16, path: P, body: B) -> Self {
        Self::Http {
            status,
            path: path.into(),
            body: body.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Whether this error means the transport itself is unusable
    pub const fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } | Self::Network { .. }
        )
    }
}

impl From<std::io::Error> for WallboxError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for WallboxError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for WallboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for WallboxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() {
            Self::Serialization {
                message: err.to_string(),
            }
        } else {
            Self::network(err.to_string())
        }
    }
}
