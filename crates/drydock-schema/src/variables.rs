//! Blueprint variables and `${var.<name>}` interpolation.

use crate::SchemaError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Environment variable prefix that supplies blueprint variables.
pub const ENV_VAR_PREFIX: &str = "DRYDOCK_VAR_";

const OPEN: &str = "${var.";

/// Named variable values. Later sources override earlier ones via [`merge`](Self::merge).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSet {
    values: BTreeMap<String, Value>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect `DRYDOCK_VAR_<name>` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_iter(std::env::vars())
    }

    pub fn from_env_iter(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut set = Self::new();
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(ENV_VAR_PREFIX) {
                if !name.is_empty() {
                    set.set(name, Value::String(value));
                }
            }
        }
        set
    }

    pub fn from_strings<'a>(vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut set = Self::new();
        for (k, v) in vars {
            set.set(k, Value::String(v.clone()));
        }
        set
    }

    /// Load a TOML variables file: top-level `name = value` pairs.
    pub fn load_file(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: toml::Table =
            toml::from_str(&content).map_err(|source| SchemaError::ParseToml {
                path: path.to_path_buf(),
                source,
            })?;
        let mut set = Self::new();
        for (k, v) in table {
            set.set(&k, serde_json::to_value(v)?);
        }
        Ok(set)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_owned(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Overlay `other` on top of `self`; values in `other` win.
    pub fn merge(&mut self, other: &VariableSet) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Replace `${var.<name>}` references inside `value`.
    ///
    /// A string consisting of a single reference takes the variable's typed
    /// value; references embedded in longer strings are spliced as text.
    pub fn interpolate(&self, value: &Value, context: &str) -> Result<Value, SchemaError> {
        match value {
            Value::String(s) => self.interpolate_str(s, context),
            Value::Array(items) => items
                .iter()
                .map(|v| self.interpolate(v, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(v, context)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn interpolate_str(&self, s: &str, context: &str) -> Result<Value, SchemaError> {
        if !s.contains(OPEN) {
            return Ok(Value::String(s.to_owned()));
        }

        if let Some(name) = s.strip_prefix(OPEN).and_then(|r| r.strip_suffix('}')) {
            if !name.contains('}') {
                return self.lookup(name, context).cloned();
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let Some(end) = after.find('}') else {
                return Err(SchemaError::UnresolvedVariable {
                    name: after.to_owned(),
                    context: context.to_owned(),
                });
            };
            match self.lookup(&after[..end], context)? {
                Value::String(v) => out.push_str(v),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn lookup(&self, name: &str, context: &str) -> Result<&Value, SchemaError> {
        self.values
            .get(name)
            .ok_or_else(|| SchemaError::UnresolvedVariable {
                name: name.to_owned(),
                context: context.to_owned(),
            })
    }
}
