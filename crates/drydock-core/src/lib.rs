//! Core orchestration engine for Drydock.
//!
//! This crate ties together blueprint parsing, state persistence, and
//! providers into the `Engine`: the API for applying, planning, and
//! destroying environments. It contains the diff engine that classifies
//! desired against committed resources, the lifecycle executor that walks the
//! dependency graph with bounded parallelism, the image-cache binder, the
//! lifecycle event stream, engine configuration, and process-level locking
//! and interrupt handling.

pub mod concurrency;
pub mod config;
pub mod diff;
pub mod engine;
pub mod events;
pub mod executor;
pub mod image_cache;

pub use concurrency::{install_signal_handler, StoreLock};
pub use config::EngineConfig;
pub use diff::{Change, Plan};
pub use engine::{Engine, StatusSummary};
pub use events::{Event, EventBus, EventKind, Subscription};

use drydock_runtime::{PluginError, ProviderError, RegistryError};
use drydock_schema::SchemaError;
use drydock_store::StoreError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status for a successful run.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status for any apply or destroy failure.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status for parse or validation failures.
pub const EXIT_INVALID_CONFIG: u8 = 2;
/// Exit status after a user interrupt.
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] SchemaError),
    #[error("create {id} failed: {source}")]
    ProviderCreate {
        id: String,
        #[source]
        source: ProviderError,
    },
    #[error("destroy {id} failed: {source}")]
    ProviderDestroy {
        id: String,
        #[source]
        source: ProviderError,
    },
    #[error("refresh {id} failed: {source}")]
    ProviderRefresh {
        id: String,
        #[source]
        source: ProviderError,
    },
    #[error("lookup {id} failed: {source}")]
    ProviderLookup {
        id: String,
        #[source]
        source: ProviderError,
    },
    #[error("provider for {id} could not be initialized: {source}")]
    ProviderInit {
        id: String,
        #[source]
        source: ProviderError,
    },
    #[error("{id} skipped: dependency {dependency} failed")]
    DependencySkipped { id: String, dependency: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("state error: {0}")]
    StateIo(#[from] StoreError),
    #[error("type '{0}' is already registered")]
    DuplicateType(String),
    #[error("no provider registered for type '{0}'")]
    UnknownType(String),
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
    #[error("engine configuration error: {0}")]
    Config(String),
    #[error("another drydock process holds {0}")]
    Locked(PathBuf),
    #[error("resource not found in state: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(FailureReport),
}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicateType(t) => CoreError::DuplicateType(t),
            RegistryError::UnknownType(t) => CoreError::UnknownType(t),
            RegistryError::Init { id, source } => CoreError::ProviderInit { id, source },
        }
    }
}

impl CoreError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            CoreError::InvalidConfig(_) | CoreError::Config(_) => EXIT_INVALID_CONFIG,
            CoreError::Cancelled => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }

    /// True for cancellation, including a provider call that observed it.
    pub fn is_cancelled(&self) -> bool {
        match self {
            CoreError::Cancelled => true,
            CoreError::ProviderCreate { source, .. }
            | CoreError::ProviderDestroy { source, .. }
            | CoreError::ProviderRefresh { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, CoreError::DependencySkipped { .. })
    }
}

/// Composite error from an apply or destroy walk.
#[derive(Debug, Default)]
pub struct FailureReport {
    pub errors: Vec<CoreError>,
}

impl FailureReport {
    pub fn new(errors: Vec<CoreError>) -> Self {
        Self { errors }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors other than dependency skips.
    pub fn failures(&self) -> impl Iterator<Item = &CoreError> {
        self.errors.iter().filter(|e| !e.is_skip())
    }

    pub fn skipped(&self) -> usize {
        self.errors.iter().filter(|e| e.is_skip()).count()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self.failures().map(ToString::to_string).collect();
        write!(f, "{} resource(s) failed", failures.len())?;
        let skipped = self.skipped();
        if skipped > 0 {
            write!(f, ", {skipped} skipped")?;
        }
        if !failures.is_empty() {
            write!(f, ": {}", failures.join("; "))?;
        }
        Ok(())
    }
}
