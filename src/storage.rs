//! Storage Layer
//!
//! Durable, append-only persistence of collected locations:
//! - **Dataset**: CSV files with a fixed header, deduplicated by `(vehicle id, timestamp)`
//! - **Cursor**: JSON state file replaced atomically after every successful write
//!
//! # Components
//!
//! - [`DatasetWriter`]: Idempotent append with an in-memory key index
//! - [`CursorStore`]: Cursor load/save
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and ownership

mod builder;
mod cursor;
mod dataset;
mod error;
mod types;

pub use builder::{DEFAULT_FILE_PREFIX, DEFAULT_STATE_FILE, StorageBuilder, StorageHandles};
pub use cursor::CursorStore;
pub use dataset::DatasetWriter;
pub use error::{DataError, StorageError};
pub use types::{
    Cursor, DATASET_HEADER, DedupKey, FileRotation, LocationRecord, WriteReport,
};
