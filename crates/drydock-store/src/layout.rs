use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the tool home.
pub const HOME_ENV: &str = "DRYDOCK_HOME";

const DEFAULT_DIR: &str = ".drydock";

/// Directory layout of the Drydock home.
///
/// ```text
/// <root>/config.toml
/// <root>/state/state.json
/// <root>/state/.lock
/// <root>/plugins/
/// ```
#[derive(Debug, Clone)]
pub struct HomeLayout {
    root: PathBuf,
}

impl HomeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$DRYDOCK_HOME`, else `$HOME/.drydock`.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::resolve(std::env::var_os(HOME_ENV), std::env::var_os("HOME"))
    }

    fn resolve(
        explicit: Option<std::ffi::OsString>,
        home: Option<std::ffi::OsString>,
    ) -> Result<Self, StoreError> {
        if let Some(root) = explicit.filter(|v| !v.is_empty()) {
            return Ok(Self::new(root));
        }
        match home.filter(|v| !v.is_empty()) {
            Some(home) => Ok(Self::new(PathBuf::from(home).join(DEFAULT_DIR))),
            None => Err(StoreError::NoHome),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.json")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(".lock")
    }

    #[inline]
    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.state_dir())?;
        fs::create_dir_all(self.plugins_dir())?;
        Ok(())
    }
}
