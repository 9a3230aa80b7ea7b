//! Resource model, configuration snapshots, and blueprint parsing for Drydock.
//!
//! This crate defines the schema layer: the `Resource` / `Meta` records every
//! resource type shares, the ordered `Config` snapshot that doubles as the
//! persisted state document, content checksums used for change detection,
//! the dependency graph with its stable topological order, subnet validation
//! for networks, and the TOML blueprint parser with variables and modules.

pub mod blueprint;
pub mod checksum;
pub mod config;
pub mod graph;
pub mod network;
pub mod resource;
pub mod types;
pub mod variables;

pub use blueprint::{parse_blueprint, ParseOptions, ParseOutcome, TypeCatalog};
pub use checksum::{canonical_json, compute_checksum};
pub use config::Config;
pub use graph::DependencyGraph;
pub use network::{validate_subnets, HostNetwork};
pub use resource::{
    Checksum, Meta, Resource, Status, IMAGE_CACHE_ID, TYPE_IMAGE_CACHE, TYPE_MODULE,
    TYPE_NETWORK, TYPE_OUTPUT, TYPE_VARIABLE,
};
pub use types::ResourceId;
pub use variables::VariableSet;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read blueprint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no blueprint files found at {0}")]
    EmptyBlueprint(PathBuf),
    #[error("duplicate resource id: {0}")]
    DuplicateResource(ResourceId),
    #[error("resource {id} has unknown type '{kind}'")]
    UnknownType { id: ResourceId, kind: String },
    #[error("resource {id} depends on unknown resource '{reference}'")]
    UnresolvedReference { id: ResourceId, reference: String },
    #[error("unresolved variable '{name}' in {context}")]
    UnresolvedVariable { name: String, context: String },
    #[error("dependency cycle detected between: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("invalid resource {id}: {reason}")]
    InvalidResource { id: ResourceId, reason: String },
    #[error("network {id} has invalid subnet '{subnet}': {reason}")]
    InvalidSubnet {
        id: ResourceId,
        subnet: String,
        reason: String,
    },
    #[error("network {first} subnet overlaps network {second}")]
    SubnetOverlap {
        first: ResourceId,
        second: ResourceId,
    },
    #[error("network {id} subnet {subnet} overlaps host interface {interface} ({address})")]
    HostSubnetOverlap {
        id: ResourceId,
        subnet: String,
        interface: String,
        address: String,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{} configuration errors: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<SchemaError>),
}

impl SchemaError {
    /// Collapse a list of errors into a single error, or `None` when empty.
    pub fn collect(mut errors: Vec<SchemaError>) -> Option<SchemaError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(SchemaError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
