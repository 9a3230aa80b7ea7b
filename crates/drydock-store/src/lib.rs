//! State persistence for Drydock.
//!
//! This crate provides the storage layer: `HomeLayout` for the tool home
//! directory structure (`state/`, `plugins/`, lock and config files) and
//! `StateStore`, which loads and atomically saves the committed `Config` as a
//! single JSON document.

pub mod layout;
pub mod state;

pub use layout::{HomeLayout, HOME_ENV};
pub use state::StateStore;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file not found: {0}")]
    NotFound(PathBuf),
    #[error("state file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cannot determine home directory: set DRYDOCK_HOME or HOME")]
    NoHome,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
