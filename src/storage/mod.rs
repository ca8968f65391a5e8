//! Persistence of target bundles, crash artifacts and backups.

pub mod local;

use crate::config::{Paths, StorageKind};
use serde::{Deserialize, Serialize};
use std::{fmt, io, path::PathBuf, sync::Arc};
use thiserror::Error;

pub use local::LocalStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{what} does not exist: {path}")]
    Missing { what: &'static str, path: String },
    #[error("storage io on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("bad artifact metadata: {0}")]
    Meta(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Kind of artifact an engine produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Crash,
    Hang,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Crash => write!(f, "CRASH"),
            Category::Hang => write!(f, "HANG"),
        }
    }
}

/// A reproducing input found by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzerPayload {
    pub category: Category,
    /// Host path of the artifact.
    pub location: PathBuf,
    pub revision: String,
}

/// Engine-side output accompanying a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzerOutput {
    pub identifier: String,
    pub output: PathBuf,
}

/// Storage bound to one target.
pub trait StorageHandler: Send + Sync {
    /// Fetches the target bundle, returns a local path to the archive.
    fn get_target(&self) -> Result<PathBuf, StorageError>;

    fn backup_exists(&self) -> Result<bool, StorageError>;

    /// Fetches the latest backup, returns a local path to the archive.
    fn get_backup(&self) -> Result<PathBuf, StorageError>;

    /// Persists the archive found at [`StorageHandler::backup_location`],
    /// replacing any previous backup.
    fn make_backup(&self) -> Result<(), StorageError>;

    fn save_payload(&self, payload: &FuzzerPayload) -> Result<String, StorageError>;

    fn save_output(&self, output: &FuzzerOutput) -> Result<(), StorageError>;

    /// Where the backup service writes the archive before `make_backup`.
    fn backup_location(&self) -> PathBuf;
}

pub fn open(kind: StorageKind, paths: &Paths, target: &str) -> Arc<dyn StorageHandler> {
    match kind {
        StorageKind::Local => Arc::new(LocalStorage::new(paths.clone(), target)),
    }
}
