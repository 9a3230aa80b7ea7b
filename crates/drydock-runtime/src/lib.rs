//! Provider layer for Drydock.
//!
//! This crate implements the boundary between the engine and the outside
//! world: the async `Provider` contract every resource type is driven
//! through, the `Registry` mapping type tags to prototypes and provider
//! factories, built-in prototypes for structural and well-known types, a
//! recording `MockBackend` for tests and dry runs, the out-of-process plugin
//! loader, and host network interface enumeration.

pub mod builtin;
pub mod host;
pub mod mock;
pub mod plugin;
pub mod provider;
pub mod registry;

pub use builtin::{
    prototype_for, register_structural, GenericType, NetworkType, NoopProvider, StructuralType,
    WELL_KNOWN_TYPES,
};
pub use host::host_networks;
pub use mock::{MockBackend, MockCall, Op};
pub use plugin::{load_plugins, ExecPlugin, Plugin, PluginContext};
pub use provider::{factory, Provider, ProviderFactory, ResourceType};
pub use registry::Registry;

use std::path::PathBuf;
use thiserror::Error;

/// Error returned by a provider operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_) | ProviderError::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("type '{0}' is already registered")]
    DuplicateType(String),
    #[error("no provider registered for type '{0}'")]
    UnknownType(String),
    #[error("failed to initialize provider for {id}: {source}")]
    Init {
        id: String,
        #[source]
        source: ProviderError,
    },
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plugin {path} failed to describe itself: {reason}")]
    Describe { path: PathBuf, reason: String },
    #[error("plugin '{plugin}' registration failed: {source}")]
    Registration {
        plugin: String,
        #[source]
        source: RegistryError,
    },
    #[error("plugin protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Retryable("busy".to_owned()).is_retryable());
        assert!(ProviderError::Transient("flaky".to_owned()).is_retryable());
        assert!(!ProviderError::Fatal("boom".to_owned()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
        assert!(ProviderError::Cancelled.is_cancelled());
    }

    #[test]
    fn registry_error_display() {
        let e = RegistryError::DuplicateType("network".to_owned());
        assert!(e.to_string().contains("network"));
        let e = RegistryError::Init {
            id: "resource.container.a".to_owned(),
            source: ProviderError::InvalidResource("missing image".to_owned()),
        };
        let msg = e.to_string();
        assert!(msg.contains("resource.container.a"));
        assert!(msg.contains("missing image"));
    }
}
