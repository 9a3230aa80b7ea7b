use crate::builtin::register_structural;
use crate::provider::{Provider, ProviderFactory, ResourceType};
use crate::RegistryError;
use drydock_schema::{Resource, SchemaError, TypeCatalog};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

struct Entry {
    prototype: Arc<dyn ResourceType>,
    factory: ProviderFactory,
}

/// Type tag → prototype and provider factory.
///
/// The registry is built once at startup (built-ins, backend, plugins) and
/// is read-only afterwards.
#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the structural types (`module`, `variable`, `output`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // A fresh registry has no entries, so this cannot collide.
        let _ = register_structural(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        kind: &str,
        prototype: Arc<dyn ResourceType>,
        factory: ProviderFactory,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(kind) {
            return Err(RegistryError::DuplicateType(kind.to_owned()));
        }
        tracing::debug!("registered type '{kind}'");
        self.entries
            .insert(kind.to_owned(), Entry { prototype, factory });
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instantiate the provider for `resource`.
    pub fn provider(&self, resource: &Resource) -> Result<Box<dyn Provider>, RegistryError> {
        let entry = self
            .entries
            .get(resource.kind())
            .ok_or_else(|| RegistryError::UnknownType(resource.kind().to_owned()))?;
        (entry.factory)(resource).map_err(|source| RegistryError::Init {
            id: resource.id().to_string(),
            source,
        })
    }
}

impl TypeCatalog for Registry {
    fn contains(&self, kind: &str) -> bool {
        Registry::contains(self, kind)
    }

    fn process(
        &self,
        resource: &mut Resource,
        committed: Option<&Resource>,
    ) -> Result<(), SchemaError> {
        match self.entries.get(resource.kind()) {
            Some(entry) => entry.prototype.process(resource, committed),
            None => Err(SchemaError::UnknownType {
                id: resource.id().clone(),
                kind: resource.kind().to_owned(),
            }),
        }
    }
}
