//! Error types for the WAN orchestrator
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the WAN orchestrator
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration store errors (row read/write failures)
    #[error("Config store error: {0}")]
    Store(String),

    /// Plugin-related errors
    #[error("Plugin error ({plugin}): {message}")]
    Plugin {
        /// Plugin name
        plugin: String,
        /// Error message
        message: String,
    },

    /// Malformed or incomplete WAN configuration row
    #[error("WAN config error: {0}")]
    WanConfig(String),

    /// Reachability probe setup errors
    #[error("Probe error: {0}")]
    Probe(String),

    /// Plugin descriptor was not found in the registry
    #[error("Plugin not registered: {0}")]
    NotRegistered(String),

    /// File and socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a config store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a plugin-specific error
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a WAN config error
    pub fn wan_config(msg: impl Into<String>) -> Self {
        Self::WanConfig(msg.into())
    }

    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a "not registered" error
    pub fn not_registered(msg: impl Into<String>) -> Self {
        Self::NotRegistered(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
