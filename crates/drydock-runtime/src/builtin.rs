//! Built-in type prototypes and the no-op provider.

use crate::provider::{carry_properties, Provider, ResourceType};
use crate::registry::Registry;
use crate::{ProviderError, RegistryError};
use async_trait::async_trait;
use drydock_schema::network::parse_subnet;
use drydock_schema::{
    Resource, SchemaError, TYPE_MODULE, TYPE_NETWORK, TYPE_OUTPUT, TYPE_VARIABLE,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Resource types a complete backend provides, with the fields of each that
/// hold filesystem paths relative to the declaring file.
pub const WELL_KNOWN_TYPES: &[(&str, &[&str])] = &[
    ("network", &[]),
    ("image_cache", &[]),
    ("container", &["volumes.source", "build.context"]),
    ("sidecar", &["volumes.source"]),
    ("build", &["context", "dockerfile"]),
    ("k8s_cluster", &["volumes.source"]),
    ("k8s_config", &["paths"]),
    ("helm", &["chart", "values"]),
    ("nomad_cluster", &["volumes.source"]),
    ("nomad_job", &["paths"]),
    ("ingress", &[]),
    ("certificate_ca", &["output"]),
    ("certificate_leaf", &["output"]),
    ("template", &["source", "destination"]),
    ("copy", &["source", "destination"]),
    ("exec_local", &["working_directory"]),
    ("exec_remote", &["script"]),
    ("random_number", &[]),
    ("random_password", &[]),
    ("docs", &["path"]),
];

/// `network`: requires a valid CIDR `subnet`.
#[derive(Debug, Default)]
pub struct NetworkType;

impl ResourceType for NetworkType {
    fn process(
        &self,
        resource: &mut Resource,
        committed: Option<&Resource>,
    ) -> Result<(), SchemaError> {
        parse_subnet(resource)?;
        carry_properties(resource, committed);
        Ok(())
    }
}

/// `module`, `variable`, `output`: no external side effects.
#[derive(Debug, Default)]
pub struct StructuralType;

impl ResourceType for StructuralType {}

/// Opaque type whose listed fields are paths resolved against the directory
/// of the declaring file. A dotted field `a.b` addresses key `b` inside
/// object `a` or inside each object of array `a`.
#[derive(Debug, Default, Clone)]
pub struct GenericType {
    path_fields: Vec<String>,
}

impl GenericType {
    pub fn new<S: AsRef<str>>(path_fields: &[S]) -> Self {
        Self {
            path_fields: path_fields.iter().map(|s| s.as_ref().to_owned()).collect(),
        }
    }

    pub fn path_fields(&self) -> &[String] {
        &self.path_fields
    }
}

impl ResourceType for GenericType {
    fn process(
        &self,
        resource: &mut Resource,
        committed: Option<&Resource>,
    ) -> Result<(), SchemaError> {
        if let Some(base) = resource.base_dir().map(Path::to_path_buf) {
            for field in &self.path_fields {
                let segments: Vec<&str> = field.split('.').collect();
                if let Some((first, rest)) = segments.split_first() {
                    if let Some(v) = resource.fields.get_mut(*first) {
                        resolve_path(v, rest, &base);
                    }
                }
            }
        }
        carry_properties(resource, committed);
        Ok(())
    }
}

fn resolve_path(value: &mut Value, rest: &[&str], base: &Path) {
    match (value, rest.split_first()) {
        (Value::String(s), None) => {
            let p = Path::new(s.as_str());
            if p.is_relative() && !s.contains("://") {
                *s = base.join(p).to_string_lossy().into_owned();
            }
        }
        (Value::Array(items), _) => {
            for item in items {
                resolve_path(item, rest, base);
            }
        }
        (Value::Object(map), Some((key, tail))) => {
            if let Some(v) = map.get_mut(*key) {
                resolve_path(v, tail, base);
            }
        }
        _ => {}
    }
}

/// Provider for types with nothing to reconcile.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

#[async_trait]
impl Provider for NoopProvider {
    async fn create(
        &self,
        _resource: &mut Resource,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn destroy(
        &self,
        _resource: &mut Resource,
        _force: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn refresh(
        &self,
        _resource: &mut Resource,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Register `module`, `variable`, and `output` with the no-op provider.
pub fn register_structural(registry: &mut Registry) -> Result<(), RegistryError> {
    for kind in [TYPE_MODULE, TYPE_VARIABLE, TYPE_OUTPUT] {
        registry.register(
            kind,
            Arc::new(StructuralType),
            crate::provider::factory(|_| Ok(Box::new(NoopProvider))),
        )?;
    }
    Ok(())
}

/// Prototype for a well-known type tag.
pub fn prototype_for(kind: &str) -> Arc<dyn ResourceType> {
    if kind == TYPE_NETWORK {
        return Arc::new(NetworkType);
    }
    let fields = WELL_KNOWN_TYPES
        .iter()
        .find(|(k, _)| *k == kind)
        .map_or(&[][..], |(_, f)| *f);
    Arc::new(GenericType::new(fields))
}
