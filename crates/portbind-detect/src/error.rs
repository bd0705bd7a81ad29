//! Error types for device detection

use thiserror::Error;

/// Errors that can occur during enumeration, probing or path resolution
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectError {
    /// Device glob could not be evaluated
    #[error("failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    /// Failed to open serial port
    #[error("failed to open port {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    /// I/O error during probe
    #[error("I/O error on {port}: {reason}")]
    Io { port: String, reason: String },

    /// Every topology tier failed for this node
    #[error("could not resolve physical port path for {0}")]
    Resolution(String),

    /// External command could not be spawned
    #[error("failed to run {program}: {reason}")]
    Command { program: String, reason: String },
}

/// Reasons a probe stops without producing an outcome
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The cancel flag was raised between attempts
    #[error("probe cancelled")]
    Cancelled,
}
