use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub const TYPE_NETWORK: &str = "network";
pub const TYPE_IMAGE_CACHE: &str = "image_cache";
pub const TYPE_MODULE: &str = "module";
pub const TYPE_VARIABLE: &str = "variable";
pub const TYPE_OUTPUT: &str = "output";

/// Id of the singleton image cache maintained by the engine.
pub const IMAGE_CACHE_ID: &str = "resource.image_cache.default";

const STATUS_KEY: &str = "status";

/// Lifecycle status recorded in `meta.properties.status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Tainted,
    Failed,
    Disabled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Tainted => "tainted",
            Status::Failed => "failed",
            Status::Disabled => "disabled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Status::Created),
            "tainted" => Some(Status::Tainted),
            "failed" => Some(Status::Failed),
            "disabled" => Some(Status::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content hashes of a resource declaration before and after `process()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checksum {
    #[serde(default)]
    pub parsed: String,
    #[serde(default)]
    pub processed: String,
}

/// Common record carried by every resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Meta {
    pub id: ResourceId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub checksum: Checksum,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Fields written by newer versions; preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resource: the shared [`Meta`] plus opaque type-specific fields.
///
/// Type-specific fields are kept as JSON so that the state document
/// round-trips fields this build does not know about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub meta: Meta,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Resource {
    pub fn new(module: &str, kind: &str, name: &str) -> Self {
        Self {
            meta: Meta {
                id: ResourceId::build(module, kind, name),
                name: name.to_owned(),
                kind: kind.to_owned(),
                module: module.to_owned(),
                file: String::new(),
                depends_on: Vec::new(),
                disabled: false,
                checksum: Checksum::default(),
                properties: Map::new(),
                extra: Map::new(),
            },
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<ResourceId>) -> Self {
        self.add_dependency(id.into());
        self
    }

    #[must_use]
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.meta.disabled = disabled;
        self
    }

    pub fn id(&self) -> &ResourceId {
        &self.meta.id
    }

    pub fn kind(&self) -> &str {
        &self.meta.kind
    }

    pub fn is_disabled(&self) -> bool {
        self.meta.disabled
    }

    pub fn status(&self) -> Option<Status> {
        self.meta
            .properties
            .get(STATUS_KEY)
            .and_then(Value::as_str)
            .and_then(Status::parse)
    }

    pub fn set_status(&mut self, status: Status) {
        self.meta
            .properties
            .insert(STATUS_KEY.to_owned(), Value::String(status.as_str().to_owned()));
    }

    pub fn clear_status(&mut self) {
        self.meta.properties.remove(STATUS_KEY);
    }

    /// Append a dependency unless already present. Returns whether it was added.
    pub fn add_dependency(&mut self, id: ResourceId) -> bool {
        if self.meta.depends_on.contains(&id) {
            return false;
        }
        self.meta.depends_on.push(id);
        true
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.meta.properties.get(key)
    }

    pub fn set_property(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.properties.insert(key.to_owned(), value.into());
    }

    /// Directory of the declaring file, used to resolve relative paths.
    pub fn base_dir(&self) -> Option<&Path> {
        if self.meta.file.is_empty() {
            return None;
        }
        Path::new(&self.meta.file).parent()
    }
}
