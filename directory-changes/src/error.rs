//! Error types for directory change streams.

use std::path::Path;

use thiserror::Error;

/// Result type alias for directory change operations.
pub type Result<T> = std::result::Result<T, DirectoryChangesError>;

/// Errors that can occur while building or running a directory change stream.
#[derive(Error, Debug)]
pub enum DirectoryChangesError {
    /// Directory not found.
    #[error("the path {0} does not exist")]
    DirectoryNotFound(String),

    /// Path exists but is not a directory.
    #[error("the path {0} is not a directory")]
    NotADirectory(String),

    /// Buffer limit must be positive.
    #[error("invalid max buffer size: {0} (must be at least 1)")]
    InvalidBufferSize(usize),

    /// More changes arrived than the consumer pulled.
    #[error("max event buffer size {max_buffer_size} reached for {directory}")]
    BufferOverflow {
        /// Configured limit.
        max_buffer_size: usize,
        /// Watched directory.
        directory: String,
    },

    /// The underlying watch facility reported an error.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DirectoryChangesError {
    pub(crate) fn buffer_overflow(max_buffer_size: usize, directory: &Path) -> Self {
        Self::BufferOverflow {
            max_buffer_size,
            directory: directory.display().to_string(),
        }
    }

    /// Whether this error was raised before any watch was established.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DirectoryNotFound(_)
                | Self::NotADirectory(_)
                | Self::InvalidBufferSize(_)
                | Self::Serialization(_)
                | Self::Config(_)
        )
    }
}
