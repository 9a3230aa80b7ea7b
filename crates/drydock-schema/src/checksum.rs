use crate::resource::Resource;
use serde_json::{Map, Value};

/// Serialize a JSON value with object keys sorted at every level.
///
/// Two declarations that differ only in key order hash identically.
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for k in keys {
                out.insert(k.clone(), sorted(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Content hash of a resource declaration.
///
/// Covers identity, dependencies, and type-specific fields. Runtime
/// properties, the declaring file, and the `disabled` flag are excluded:
/// outputs written by providers must not look like a declaration change, and
/// toggling `disabled` is handled by the disabled policy rather than recreate.
pub fn compute_checksum(resource: &Resource) -> String {
    let mut hasher = blake3::Hasher::new();

    hasher.update(format!("type:{}", resource.meta.kind).as_bytes());
    hasher.update(format!("name:{}", resource.meta.name).as_bytes());
    hasher.update(format!("module:{}", resource.meta.module).as_bytes());
    for dep in &resource.meta.depends_on {
        hasher.update(format!("dep:{dep}").as_bytes());
    }
    hasher.update(canonical_json(&Value::Object(resource.fields.clone())).as_bytes());

    hasher.finalize().to_hex().to_string()
}
