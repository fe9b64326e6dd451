//! Configuration for a directory change stream.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryChangesError, Result};

/// Default number of undelivered changes tolerated before the stream fails.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 200;

/// Configuration for a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryChangesConfig {
    /// Path to the directory.
    pub directory: PathBuf,

    /// Maximum number of buffered changes before the stream fails.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

impl DirectoryChangesConfig {
    /// Create a new config with the default buffer size.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Set the maximum buffer size.
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Load a config from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check the construction preconditions.
    ///
    /// This runs before any watch is established: the directory must exist
    /// and be a directory, and the buffer must hold at least one change.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(DirectoryChangesError::InvalidBufferSize(
                self.max_buffer_size,
            ));
        }

        if !self.directory.exists() {
            return Err(DirectoryChangesError::DirectoryNotFound(
                self.directory.display().to_string(),
            ));
        }

        if !self.directory.is_dir() {
            return Err(DirectoryChangesError::NotADirectory(
                self.directory.display().to_string(),
            ));
        }

        Ok(())
    }
}

fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}
