//! Error types for mailhook.

use std::path::PathBuf;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file {} not found", .0.display())]
    MissingFile(PathBuf),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to open audit log {}: {reason}", .path.display())]
    AuditLog { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while turning header or body bytes into text.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown charset: {0}")]
    UnknownCharset(String),

    #[error("Malformed {charset} data in {context}")]
    Malformed { charset: String, context: String },

    #[error("Invalid encoded word {word:?}: {reason}")]
    InvalidEncodedWord { word: String, reason: String },
}

/// Webhook delivery errors. Terminal for the attempt that raised them.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("Webhook worker pool error: {0}")]
    Pool(String),
}

/// Mail listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
