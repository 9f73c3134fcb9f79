//! Durable cursor persistence.
//!
//! The cursor is stored as a small JSON document and replaced atomically
//! (temp file, fsync, rename), so a crash leaves either the previous or the
//! new cursor on disk, never a torn one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;
use crate::storage::types::Cursor;

/// On-disk cursor document.
#[derive(Debug, Serialize, Deserialize)]
struct CursorState {
    cursor: Cursor,
    updated_at: DateTime<Utc>,
}

/// Reads and writes the collection cursor.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted cursor.
    ///
    /// A missing file means no cursor yet. An unreadable or corrupt file is
    /// logged and also treated as no cursor; the dataset index keeps any
    /// resulting re-fetch harmless.
    pub fn load(&self) -> Option<Cursor> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read cursor state, starting without cursor");
                return None;
            }
        };

        match serde_json::from_str::<CursorState>(&content) {
            Ok(state) => {
                tracing::info!(cursor = %state.cursor, updated_at = %state.updated_at, "Resuming from persisted cursor");
                Some(state.cursor)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Corrupt cursor state, starting without cursor");
                None
            }
        }
    }

    /// Atomically replace the persisted cursor.
    ///
    /// # Errors
    /// Returns `StorageError` if the temp file cannot be written or renamed.
    pub fn save(&self, cursor: &Cursor) -> Result<(), StorageError> {
        let state = CursorState {
            cursor: cursor.clone(),
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
            file.write_all(&body)
                .and_then(|()| file.write_all(b"\n"))
                .and_then(|()| file.sync_all())
                .map_err(|e| StorageError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))?;

        tracing::debug!(cursor = %cursor, "Cursor persisted");
        Ok(())
    }
}
