//! Qualified names and module alias resolution.
//!
//! Every schema object (concept, link, atom) is addressed by a fully
//! qualified name of the form `module::local`. Surface queries may use
//! short names or per-query module aliases; resolution happens once, in
//! [`resolve_name`], and the rest of the crate only ever sees `FullName`s.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::errors::SchemaError;

/// The module that holds the builtin atoms and the implicit `id` pointer.
pub const STD_MODULE: &str = "std";

/// A fully qualified schema name: `module::local`. Serialized as its
/// `module::local` string form so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FullName {
    pub module: String,
    pub name: String,
}

impl Serialize for FullName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FullName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.split_once("::") {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(FullName::new(module, name))
            }
            _ => Err(D::Error::custom(format!(
                "expected a qualified name 'module::local', got '{raw}'"
            ))),
        }
    }
}

impl FullName {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        FullName {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Builtin names live in the `std` module.
    pub fn std(name: impl Into<String>) -> Self {
        FullName::new(STD_MODULE, name)
    }

    pub fn is_std(&self) -> bool {
        self.module == STD_MODULE
    }
}

impl fmt::Display for FullName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

lazy_static::lazy_static! {
    /// The implicit identity pointer carried by every concept.
    pub static ref ID_POINTER: FullName = FullName::std("id");
    /// Target atom of the identity pointer.
    pub static ref UUID_ATOM: FullName = FullName::std("uuid");
    pub static ref STR_ATOM: FullName = FullName::std("str");
    pub static ref INT_ATOM: FullName = FullName::std("int");
    pub static ref FLOAT_ATOM: FullName = FullName::std("float");
    pub static ref BOOL_ATOM: FullName = FullName::std("bool");
}

/// Resolve a surface name against the per-query module aliases.
///
/// A qualified name (`m::x`) has its module part looked up in `aliases`
/// first, falling back to the literal module. An unqualified name resolves
/// into `default_module`.
pub fn resolve_name(
    raw: &str,
    default_module: &str,
    aliases: &BTreeMap<String, String>,
) -> Result<FullName, SchemaError> {
    match raw.split_once("::") {
        Some((module, local)) => {
            if local.is_empty() || module.is_empty() {
                return Err(SchemaError::MalformedName {
                    name: raw.to_string(),
                });
            }
            let module = aliases.get(module).map(String::as_str).unwrap_or(module);
            Ok(FullName::new(module, local))
        }
        None => {
            if raw.is_empty() {
                return Err(SchemaError::MalformedName {
                    name: raw.to_string(),
                });
            }
            Ok(FullName::new(default_module, raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_uses_alias() {
        let mut aliases = BTreeMap::new();
        aliases.insert("t".to_string(), "test".to_string());
        let name = resolve_name("t::User", "app", &aliases).unwrap();
        assert_eq!(name, FullName::new("test", "User"));
    }

    #[test]
    fn unqualified_name_uses_default_module() {
        let name = resolve_name("User", "app", &BTreeMap::new()).unwrap();
        assert_eq!(name, FullName::new("app", "User"));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(resolve_name("", "app", &BTreeMap::new()).is_err());
        assert!(resolve_name("m::", "app", &BTreeMap::new()).is_err());
    }
}
