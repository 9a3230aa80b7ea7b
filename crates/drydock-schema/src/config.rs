use crate::resource::Resource;
use crate::types::ResourceId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Ordered collection of resources with lookup by id and by type.
///
/// A `Config` is both the parser's output and the persisted state document.
/// Iteration order is insertion order and is stable across save/load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    blueprint: Option<Value>,
    resources: Vec<Resource>,
    index: HashMap<ResourceId, usize>,
    extra: Map<String, Value>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn blueprint(&self) -> Option<&Value> {
        self.blueprint.as_ref()
    }

    pub fn set_blueprint(&mut self, blueprint: Option<Value>) {
        self.blueprint = blueprint;
    }

    /// Top-level document keys other than `blueprint` and `resources`.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn set_extra(&mut self, key: &str, value: Value) {
        self.extra.insert(key.to_owned(), value);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.resources.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Resource> {
        self.resources.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.iter().map(Resource::id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Resource> {
        self.index.get(id).map(|&i| &mut self.resources[i])
    }

    pub fn find_by_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources.iter().filter(move |r| r.kind() == kind)
    }

    pub fn count_type(&self, kind: &str) -> usize {
        self.find_by_type(kind).count()
    }

    /// Append a resource; fails if its id is already present.
    pub fn append(&mut self, resource: Resource) -> Result<(), SchemaError> {
        if self.index.contains_key(resource.id()) {
            return Err(SchemaError::DuplicateResource(resource.id().clone()));
        }
        self.index
            .insert(resource.id().clone(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Replace the resource with the same id in place, or append it.
    pub fn upsert(&mut self, resource: Resource) {
        if let Some(&i) = self.index.get(resource.id()) {
            self.resources[i] = resource;
        } else {
            self.index
                .insert(resource.id().clone(), self.resources.len());
            self.resources.push(resource);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Resource> {
        let i = self.index.remove(id)?;
        let removed = self.resources.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn into_resources(self) -> Vec<Resource> {
        self.resources
    }
}

impl<'a> IntoIterator for &'a Config {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

impl TryFrom<Vec<Resource>> for Config {
    type Error = SchemaError;

    fn try_from(resources: Vec<Resource>) -> Result<Self, Self::Error> {
        let mut config = Config::new();
        for r in resources {
            config.append(r)?;
        }
        Ok(config)
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    blueprint: &'a Option<Value>,
    resources: &'a [Resource],
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    blueprint: Option<Value>,
    #[serde(default)]
    resources: Vec<Resource>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Serialize for Config {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        DocumentRef {
            blueprint: &self.blueprint,
            resources: &self.resources,
            extra: &self.extra,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = Document::deserialize(deserializer)?;
        let mut config = Config::try_from(doc.resources).map_err(serde::de::Error::custom)?;
        config.blueprint = doc.blueprint;
        config.extra = doc.extra;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Status;

    fn sample() -> Config {
        Config::try_from(vec![
            Resource::new("", "network", "onprem").with_field("subnet", "10.15.0.0/16"),
            Resource::new("", "container", "consul")
                .with_field("image", "consul:1.8.1")
                .with_dependency("resource.network.onprem"),
            Resource::new("", "container", "vault"),
        ])
        .unwrap()
    }

    #[test]
    fn lookup_by_id_and_type() {
        let c = sample();
        assert_eq!(c.len(), 3);
        assert!(c.contains("resource.container.consul"));
        assert_eq!(c.count_type("container"), 2);
        assert_eq!(
            c.get("resource.network.onprem").unwrap().field_str("subnet"),
            Some("10.15.0.0/16")
        );
    }

    #[test]
    fn append_rejects_duplicates() {
        let mut c = sample();
        let err = c.append(Resource::new("", "network", "onprem")).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateResource(_)));
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let mut c = sample();
        let removed = c.remove("resource.network.onprem").unwrap();
        assert_eq!(removed.meta.name, "onprem");
        assert!(c.get("resource.network.onprem").is_none());
        assert_eq!(c.get("resource.container.vault").unwrap().meta.name, "vault");
        let order: Vec<_> = c.ids().map(ToString::to_string).collect();
        assert_eq!(
            order,
            vec!["resource.container.consul", "resource.container.vault"]
        );
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut c = sample();
        let mut consul = c.get("resource.container.consul").unwrap().clone();
        consul.set_status(Status::Created);
        c.upsert(consul);
        assert_eq!(c.len(), 3);
        assert_eq!(
            c.get("resource.container.consul").unwrap().status(),
            Some(Status::Created)
        );
        assert_eq!(c.iter().nth(1).unwrap().meta.name, "consul");
    }

    #[test]
    fn document_roundtrip_preserves_unknown_keys() {
        let input = r#"{
            "blueprint": {"title": "dev"},
            "resources": [
                {"meta": {"id": "resource.network.a", "name": "a", "type": "network",
                          "properties": {"status": "created"}},
                 "subnet": "10.0.0.0/16", "mtu": 1500}
            ],
            "schema_hint": "v2"
        }"#;
        let c: Config = serde_json::from_str(input).unwrap();
        assert_eq!(c.blueprint().unwrap()["title"], "dev");
        let out = serde_json::to_value(&c).unwrap();
        assert_eq!(out["schema_hint"], "v2");
        assert_eq!(out["resources"][0]["mtu"], 1500);
        assert_eq!(out["resources"][0]["meta"]["properties"]["status"], "created");
    }

    #[test]
    fn document_rejects_duplicate_ids() {
        let input = r#"{"resources": [
            {"meta": {"id": "resource.network.a", "name": "a", "type": "network"}},
            {"meta": {"id": "resource.network.a", "name": "a", "type": "network"}}
        ]}"#;
        assert!(serde_json::from_str::<Config>(input).is_err());
    }
}
