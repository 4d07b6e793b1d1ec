//! Error types for the keysign front end

use std::path::PathBuf;

use thiserror::Error;

use crate::target::InvalidTargetKey;

/// Result type alias for configuration and reporting
pub type Result<T> = std::result::Result<T, KeysignError>;

/// Errors outside the ceremony steps themselves
#[derive(Debug, Error)]
pub enum KeysignError {
    /// IO error on a specific file
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for the schema
    #[error("Could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration parsed but is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Target key identifier rejected
    #[error(transparent)]
    Target(#[from] InvalidTargetKey),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KeysignError {
    fn from(e: serde_json::Error) -> Self {
        KeysignError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for KeysignError {
    fn from(e: toml::ser::Error) -> Self {
        KeysignError::Serialization(e.to_string())
    }
}
