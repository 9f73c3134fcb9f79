//! Storage builder and handles.
//!
//! Provides a builder pattern for opening the dataset and cursor store
//! together, and a handles struct owning both.

use std::path::{Path, PathBuf};

use crate::storage::StorageError;
use crate::storage::cursor::CursorStore;
use crate::storage::dataset::DatasetWriter;
use crate::storage::types::FileRotation;

/// Default dataset file name prefix.
pub const DEFAULT_FILE_PREFIX: &str = "gps_data";

/// Default cursor state file name, relative to the data directory.
pub const DEFAULT_STATE_FILE: &str = "collector_state.json";

/// Builder for constructing the storage layer.
#[derive(Debug, Clone)]
pub struct StorageBuilder {
    data_dir: PathBuf,
    file_prefix: String,
    rotation: FileRotation,
    state_file: Option<PathBuf>,
}

impl StorageBuilder {
    /// Create a new storage builder rooted at `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            rotation: FileRotation::default(),
            state_file: None,
        }
    }

    /// Set the dataset file name prefix.
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Set the dataset file rotation.
    pub fn rotation(mut self, rotation: FileRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set an explicit cursor state file (default: `<data_dir>/collector_state.json`).
    pub fn state_file(mut self, path: impl AsRef<Path>) -> Self {
        self.state_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Open the dataset (building its index) and the cursor store.
    ///
    /// # Errors
    /// Returns `StorageError` if the dataset cannot be opened.
    pub fn build(self) -> Result<StorageHandles, StorageError> {
        let dataset = DatasetWriter::open(&self.data_dir, self.file_prefix, self.rotation)?;
        let state_path = self
            .state_file
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_STATE_FILE));

        Ok(StorageHandles {
            dataset,
            cursor_store: CursorStore::new(state_path),
        })
    }
}

/// Handles to the storage layer, owned by the scheduler.
#[derive(Debug)]
pub struct StorageHandles {
    /// Append-only dataset writer.
    pub dataset: DatasetWriter,
    /// Persisted cursor.
    pub cursor_store: CursorStore,
}
