//! Newtype wrappers for string identifiers.
//!
//! Newtypes serialize/deserialize as plain strings so the state document stays
//! readable by other tooling.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Fully-qualified resource identifier, `resource.<type>.<name>` with any
    /// enclosing modules prepended as `module.<name>.`.
    ResourceId
);

impl ResourceId {
    /// Build the canonical id for a resource declared in `module` (dot-separated
    /// module path, empty for the root blueprint).
    pub fn build(module: &str, kind: &str, name: &str) -> Self {
        Self(format!("{}resource.{kind}.{name}", module_prefix(module)))
    }

    /// The trailing `<type>.<name>` part of the id.
    pub fn short(&self) -> &str {
        match self.0.rfind("resource.") {
            Some(idx) => &self.0[idx + "resource.".len()..],
            None => &self.0,
        }
    }
}

/// Id prefix contributed by a module path: `a.b` becomes `module.a.module.b.`.
pub fn module_prefix(module: &str) -> String {
    if module.is_empty() {
        return String::new();
    }
    module
        .split('.')
        .map(|segment| format!("module.{segment}."))
        .collect()
}
