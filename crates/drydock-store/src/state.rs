use crate::layout::HomeLayout;
use crate::{fsync_dir, StoreError};
use drydock_schema::Config;
use serde_json::Value;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const UPDATED_AT_KEY: &str = "updated_at";

/// The committed resource set, persisted as one JSON document.
///
/// Writes go to a temp file in the same directory, are fsynced, then renamed
/// over the target. A crash mid-save leaves either the old or the new
/// document, never a torn one.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(layout: &HomeLayout) -> Self {
        Self::at(layout.state_file())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the committed state. A missing file is [`StoreError::NotFound`].
    pub fn load(&self) -> Result<Config, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Load the committed state, falling back to an empty `Config`.
    ///
    /// A missing file is the normal first-run case; any other failure is
    /// logged as a warning.
    pub fn load_or_empty(&self) -> Config {
        match self.load() {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                debug!("no state at {}, starting empty", self.path.display());
                Config::new()
            }
            Err(e) => {
                warn!("ignoring unreadable state: {e}");
                Config::new()
            }
        }
    }

    /// Atomically replace the state document.
    pub fn save(&self, config: &Config) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut doc = config.clone();
        doc.set_extra(
            UPDATED_AT_KEY,
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        let content = serde_json::to_string_pretty(&doc)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        debug!(
            "saved {} resources to {}",
            config.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Remove the state document. Removing a missing file succeeds.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::Io(e)),
        }
        if let Some(dir) = self.path.parent() {
            fsync_dir(dir)?;
        }
        Ok(())
    }
}
