//! Error types for the rule store

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or mutating rule files
#[derive(Debug, Error)]
pub enum RuleError {
    /// A new or rewritten rule file could not be installed
    #[error("failed to write rule {}: {reason}", .file.display())]
    Write { file: PathBuf, reason: String },

    /// A rule line or file could not be removed
    #[error("failed to remove rule from {}: {reason}", .file.display())]
    Remove { file: PathBuf, reason: String },

    /// A rule file could not be read
    #[error("failed to read rule file {}: {source}", .file.display())]
    Scan {
        file: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A privileged action failed
    #[error("{action} failed: {reason}")]
    Privileged { action: String, reason: String },

    /// Symlink name is empty or contains characters outside `[A-Za-z0-9_-]`
    #[error("invalid symlink name {0:?}")]
    InvalidName(String),
}
