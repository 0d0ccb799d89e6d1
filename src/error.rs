//! Error types for voxbridge.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxbridgeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio device errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio stream failed: {message}")]
    AudioStream { message: String },

    #[error("Audio driver unavailable: {message}")]
    DriverUnavailable { message: String },

    // Classifier errors
    #[error("VAD engine initialization failed: {message}")]
    VadInit { message: String },

    // State machine errors
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoxbridgeError {
    /// Shorthand for a configuration value that failed validation.
    pub fn invalid(key: &str, message: impl Into<String>) -> Self {
        VoxbridgeError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxbridgeError>;
