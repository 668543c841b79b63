//! Durable storage for the provisioning [`StatusRecord`].
//!
//! The record outlives the process that writes it: a phase may reboot the
//! machine, and the next invocation resumes from whatever was last saved.
//! Saves write a sibling temporary file and rename it over the record, so a
//! reader observes either the previous record or the new one, never a torn
//! write. The directory is synced after the rename.

use std::io::{self, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::runner::parent_dir;
use crate::status::StatusRecord;

/// Errors raised while persisting the status record.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the persisted record cannot be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the record cannot be rendered.
    #[error("failed to serialise status record for {path}: {message}")]
    Serialise {
        /// Destination path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the configured path cannot name a file.
    #[error("invalid status path {path}: {message}")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Abstraction over status persistence for dependency injection.
pub trait StatusStore {
    /// Returns the persisted record, or a fresh one when nothing usable is
    /// stored.
    ///
    /// A missing, unreadable, or malformed record yields a fresh record. This
    /// favours being able to provision at all over strict durability;
    /// implementations log the discarded state so it is not silently lost.
    fn load(&self) -> StatusRecord;

    /// Stamps `record.updated` and persists the full record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the record cannot be written.
    fn save(&self, record: &mut StatusRecord) -> Result<(), StoreError>;
}

/// JSON file store rooted at a single path.
#[derive(Clone, Debug)]
pub struct FileStatusStore {
    path: Utf8PathBuf,
}

impl FileStatusStore {
    /// Creates a store for the record at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the record location.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads the persisted record without falling back to a fresh one.
    ///
    /// Returns `Ok(None)` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be read, or
    /// [`StoreError::Parse`] when its content is not a valid record.
    pub fn try_load(&self) -> Result<Option<StatusRecord>, StoreError> {
        let (parent, file_name) = split_path(&self.path)?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(parent, &err)),
        };

        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, &err)),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| StoreError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }
}

impl StatusStore for FileStatusStore {
    fn load(&self) -> StatusRecord {
        match self.try_load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(path = %self.path, "no status record; starting fresh");
                StatusRecord::fresh()
            }
            Err(err) => {
                warn!(error = %err, "discarding unreadable status record; starting fresh");
                StatusRecord::fresh()
            }
        }
    }

    fn save(&self, record: &mut StatusRecord) -> Result<(), StoreError> {
        record.touch(Utc::now());
        let (parent, file_name) = split_path(&self.path)?;
        let rendered =
            serde_json::to_string_pretty(record).map_err(|err| StoreError::Serialise {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;

        let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4().simple());
        let published = write_synced(&dir, &temp_name, rendered.as_bytes())
            .and_then(|()| dir.rename(&temp_name, &dir, file_name));
        if let Err(err) = published {
            dir.remove_file(&temp_name).ok();
            return Err(io_error(&self.path, &err));
        }
        sync_dir(&dir).map_err(|err| io_error(parent, &err))
    }
}

fn write_synced(dir: &Dir, name: &str, contents: &[u8]) -> io::Result<()> {
    let mut file = dir.create(name)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Flushes the directory entry so a completed rename survives power loss.
fn sync_dir(dir: &Dir) -> io::Result<()> {
    dir.open(".")?.sync_all()
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), StoreError> {
    let parent = parent_dir(path);
    let file_name = path.file_name().ok_or_else(|| StoreError::InvalidPath {
        path: path.to_path_buf(),
        message: String::from("status path is missing a filename"),
    })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
