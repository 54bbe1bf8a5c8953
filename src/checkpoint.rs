//! Durable per-group checkpoints.
//!
//! A checkpoint is the global position of the last event a subscription
//! group fully handled. `None` means nothing has been handled yet and the
//! group starts at the beginning of the feed.
//!
//! Checkpoints only move forward. Writing the stored position again is a
//! no-op; writing a smaller one is rejected with
//! [`CheckpointError::Rewind`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::document::{DocumentStore, load_document, save_document};
use crate::error::CheckpointError;

/// Durable storage for subscription-group checkpoints.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last handled global position for `name`, or `None` if never written.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the store cannot be read.
    async fn get(&self, name: &str) -> Result<Option<u64>, CheckpointError>;

    /// Record `position` as the last handled global position for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Rewind`] if `position` is smaller than the
    /// stored one, or another [`CheckpointError`] if the write fails.
    async fn put(&self, name: &str, position: u64) -> Result<(), CheckpointError>;
}

/// Persisted form of a checkpoint.
///
/// Serialized to JSON as `{ "name": "<group>", "position": <N> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Group the checkpoint belongs to.
    pub name: String,
    /// Last fully handled global position.
    pub position: u64,
}

/// Decide whether moving from `current` to `position` writes, is a no-op,
/// or must be rejected.
fn advance(name: &str, current: Option<u64>, position: u64) -> Result<bool, CheckpointError> {
    match current {
        Some(current) if position < current => {
            tracing::error!(
                checkpoint = name,
                current,
                attempted = position,
                "refusing to rewind checkpoint"
            );
            Err(CheckpointError::Rewind {
                name: name.to_string(),
                current,
                attempted: position,
            })
        }
        Some(current) if position == current => Ok(false),
        _ => Ok(true),
    }
}

/// Checkpoints stored as one JSON file per group under a base directory.
///
/// Layout: `<dir>/<name>/checkpoint.json`. Writes go to a temporary file
/// first and are renamed into place, so a crash mid-write leaves the
/// previous checkpoint intact.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Base directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn group_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

/// Save a checkpoint atomically into `dir`.
///
/// Writes to a temporary file then renames to `checkpoint.json` in `dir`.
/// Creates `dir` if it does not exist.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, file writing, or renaming fails.
fn save_checkpoint_file(dir: &Path, checkpoint: &Checkpoint) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("checkpoint.json");
    let tmp_path = dir.join("checkpoint.json.tmp");
    let json = serde_json::to_string_pretty(checkpoint).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load a checkpoint from `dir`.
///
/// Returns `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// * [`CheckpointError::Codec`] if the file is corrupt. The group does not
///   fall back to the start of the feed; it keeps failing until the file is
///   repaired or removed.
/// * [`CheckpointError::Io`] for I/O failures other than file-not-found.
fn load_checkpoint_file(dir: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    let path = dir.join("checkpoint.json");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let checkpoint = serde_json::from_str(&content).inspect_err(|e| {
        tracing::error!(
            path = %path.display(),
            error = %e,
            "corrupt checkpoint file"
        );
    })?;
    Ok(Some(checkpoint))
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<u64>, CheckpointError> {
        let checkpoint = load_checkpoint_file(&self.group_dir(name))?;
        Ok(checkpoint.map(|c| c.position))
    }

    async fn put(&self, name: &str, position: u64) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.group_dir(name);
        let current = load_checkpoint_file(&dir)?.map(|c| c.position);
        if !advance(name, current, position)? {
            return Ok(());
        }
        save_checkpoint_file(
            &dir,
            &Checkpoint {
                name: name.to_string(),
                position,
            },
        )?;
        tracing::trace!(checkpoint = name, position, "checkpoint saved");
        Ok(())
    }
}

/// Checkpoints stored as documents under `checkpoints/<name>` in a
/// [`DocumentStore`], typically the same store that holds the read models.
pub struct DocumentCheckpointStore {
    documents: Arc<dyn DocumentStore>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for DocumentCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentCheckpointStore").finish_non_exhaustive()
    }
}

impl DocumentCheckpointStore {
    /// Store checkpoints in `documents`.
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            documents,
            write_lock: Mutex::new(()),
        }
    }

    /// Document key a checkpoint named `name` is stored under.
    pub fn key(name: &str) -> String {
        format!("checkpoints/{name}")
    }
}

#[async_trait::async_trait]
impl CheckpointStore for DocumentCheckpointStore {
    async fn get(&self, name: &str) -> Result<Option<u64>, CheckpointError> {
        let checkpoint: Option<Checkpoint> =
            load_document(self.documents.as_ref(), &Self::key(name)).await?;
        Ok(checkpoint.map(|c| c.position))
    }

    async fn put(&self, name: &str, position: u64) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let key = Self::key(name);
        let current: Option<Checkpoint> = load_document(self.documents.as_ref(), &key).await?;
        if !advance(name, current.map(|c| c.position), position)? {
            return Ok(());
        }
        save_document(
            self.documents.as_ref(),
            &key,
            &Checkpoint {
                name: name.to_string(),
                position,
            },
        )
        .await?;
        Ok(())
    }
}
