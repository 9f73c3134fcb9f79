//! Append-only CSV dataset with a deduplication index.
//!
//! Single-writer: the [`DatasetWriter`] owns the dedup index and is only ever
//! driven by the collection scheduler, so no locking is involved.
//!
//! Durability rules:
//! - Rows are appended after existing content; files are never rewritten.
//! - Every append is flushed and `fsync`ed before its keys enter the index.
//! - A failed append truncates the file back to its previous length.
//! - On open, a torn trailing row left by a crash is cut off before indexing.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::storage::StorageError;
use crate::storage::types::{DATASET_HEADER, DedupKey, FileRotation, LocationRecord, WriteReport};

/// Chunk size used when scanning backwards for the last complete row.
const TAIL_SCAN_CHUNK: usize = 4096;

/// Append-only writer over one or more CSV dataset files.
#[derive(Debug)]
pub struct DatasetWriter {
    dir: PathBuf,
    file_prefix: String,
    rotation: FileRotation,
    index: HashSet<DedupKey>,
}

impl DatasetWriter {
    /// Open the dataset directory, repair torn tails and build the key index.
    ///
    /// # Errors
    /// Returns `StorageError` if the directory cannot be created, a file cannot
    /// be read or repaired, or an existing file has a foreign header.
    pub fn open(
        dir: impl AsRef<Path>,
        file_prefix: impl Into<String>,
        rotation: FileRotation,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut writer = Self {
            dir,
            file_prefix: file_prefix.into(),
            rotation,
            index: HashSet::new(),
        };

        let files = writer.dataset_files()?;
        for path in &files {
            repair_torn_tail(path)?;
            let loaded = load_keys(path, &mut writer.index)?;
            tracing::debug!(path = %path.display(), rows = loaded, "Indexed dataset file");
        }

        tracing::info!(
            dir = %writer.dir.display(),
            files = files.len(),
            keys = writer.index.len(),
            rotation = %writer.rotation,
            "Dataset opened"
        );
        Ok(writer)
    }

    /// Number of distinct observations currently stored.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether an observation with this key is already stored.
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.index.contains(key)
    }

    /// Dataset file a record belongs to.
    pub fn file_for(&self, record: &LocationRecord) -> PathBuf {
        match self.rotation {
            FileRotation::None => self.dir.join(format!("{}.csv", self.file_prefix)),
            FileRotation::Daily => self.dir.join(format!(
                "{}_{}.csv",
                self.file_prefix,
                record.timestamp().format("%Y%m%d")
            )),
        }
    }

    /// Append new records, skipping every key that is already stored.
    ///
    /// Keys repeated within `records` are written once; later copies count as
    /// duplicates. Nothing is opened when all records are duplicates.
    ///
    /// # Errors
    /// Returns `StorageError` if a file cannot be opened, written or synced.
    /// Files completed before the failure keep their rows and index entries.
    pub fn append(&mut self, records: &[LocationRecord]) -> Result<WriteReport, StorageError> {
        let mut report = WriteReport::default();
        let mut batch_keys = HashSet::new();
        let mut pending: BTreeMap<PathBuf, Vec<&LocationRecord>> = BTreeMap::new();

        for record in records {
            let key = record.key();
            if self.index.contains(&key) || !batch_keys.insert(key) {
                tracing::debug!(
                    vehicle_id = %record.vehicle_id(),
                    timestamp = %record.timestamp(),
                    "Skipping duplicate record"
                );
                report.duplicates += 1;
                continue;
            }
            pending.entry(self.file_for(record)).or_default().push(record);
        }

        for (path, rows) in pending {
            match append_rows(&path, &rows) {
                Ok(()) => {}
                Err(AppendFailure::RolledBack(e)) => return Err(e),
                Err(AppendFailure::Dirty(e)) => {
                    // Rows of unknown extent reached the disk; index whatever is there.
                    if let Err(reload) = load_keys(&path, &mut self.index) {
                        tracing::error!(path = %path.display(), error = %reload, "Failed to re-index dataset file");
                    }
                    return Err(e);
                }
            }
            report.written += rows.len();
            self.index.extend(rows.iter().map(|r| r.key()));
        }

        Ok(report)
    }

    fn dataset_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let single = format!("{}.csv", self.file_prefix);
        let daily_prefix = format!("{}_", self.file_prefix);

        let mut files = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == single || (name.starts_with(&daily_prefix) && name.ends_with(".csv")) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Append failure, tagged with whether the file was restored to its old length.
enum AppendFailure {
    RolledBack(StorageError),
    Dirty(StorageError),
}

/// Append rows to one file; the handle is closed on every exit path.
fn append_rows(path: &Path, rows: &[&LocationRecord]) -> Result<(), AppendFailure> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| AppendFailure::RolledBack(StorageError::io(path, e)))?;
    let start_len = file
        .metadata()
        .map_err(|e| AppendFailure::RolledBack(StorageError::io(path, e)))?
        .len();

    let Err(err) = write_rows(path, &mut file, start_len == 0, rows) else {
        return Ok(());
    };

    tracing::warn!(path = %path.display(), error = %err, "Append failed, rolling back file");
    match file.set_len(start_len).and_then(|()| file.sync_data()) {
        Ok(()) => Err(AppendFailure::RolledBack(err)),
        Err(rollback) => {
            tracing::error!(path = %path.display(), error = %rollback, "Rollback failed");
            Err(AppendFailure::Dirty(err))
        }
    }
}

fn write_rows(
    path: &Path,
    file: &mut File,
    write_header: bool,
    rows: &[&LocationRecord],
) -> Result<(), StorageError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(&mut *file);

    if write_header {
        writer
            .write_record(DATASET_HEADER)
            .map_err(|e| StorageError::csv(path, e))?;
    }
    for row in rows {
        writer.serialize(row).map_err(|e| StorageError::csv(path, e))?;
    }
    writer.flush().map_err(|e| StorageError::io(path, e))?;
    drop(writer);

    file.sync_data().map_err(|e| StorageError::io(path, e))
}

/// Cut off a trailing row that lacks its terminating newline.
fn repair_torn_tail(path: &Path) -> Result<(), StorageError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))?;
    let len = file.metadata().map_err(|e| StorageError::io(path, e))?.len();
    if len == 0 {
        return Ok(());
    }

    let keep = complete_prefix_len(&mut file, len).map_err(|e| StorageError::io(path, e))?;
    if keep == len {
        return Ok(());
    }

    file.set_len(keep)
        .and_then(|()| file.sync_data())
        .map_err(|e| StorageError::io(path, e))?;
    tracing::warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "Truncated torn trailing row left by an interrupted write"
    );
    Ok(())
}

/// Length of the file up to and including its last newline.
fn complete_prefix_len(file: &mut File, len: u64) -> std::io::Result<u64> {
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK];
    let mut end = len;

    while end > 0 {
        let chunk = TAIL_SCAN_CHUNK.min(end as usize);
        let start = end - chunk as u64;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..chunk])?;
        if let Some(pos) = buf[..chunk].iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Add every parseable row's key to the index; returns the number of rows indexed.
fn load_keys(path: &Path, index: &mut HashSet<DedupKey>) -> Result<usize, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| StorageError::csv(path, e))?;

    let headers = reader
        .headers()
        .map_err(|e| StorageError::csv(path, e))?
        .clone();
    if headers.is_empty() {
        return Ok(0);
    }
    if !headers.iter().eq(DATASET_HEADER.iter().copied()) {
        return Err(StorageError::SchemaMismatch {
            path: path.to_path_buf(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }

    let mut loaded = 0;
    for (row, result) in reader.deserialize::<LocationRecord>().enumerate() {
        match result {
            Ok(record) => {
                index.insert(record.key());
                loaded += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), row = row + 1, error = %e, "Skipping unreadable dataset row");
            }
        }
    }
    Ok(loaded)
}
