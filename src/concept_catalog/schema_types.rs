//! Schema object definitions.
//!
//! The catalog stores three kinds of prototypes: *concepts* (entity types,
//! arranged in an inheritance lattice), *links* (typed directed relations
//! between a concept and either another concept or an atom), and *atoms*
//! (scalar leaf types). Links may carry their own scalar properties and may
//! be declared searchable, which enters them into full-text search
//! predicates.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::names::FullName;

/// What a link points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerTarget {
    Concept(FullName),
    Atom(FullName),
}

impl PointerTarget {
    pub fn name(&self) -> &FullName {
        match self {
            PointerTarget::Concept(n) | PointerTarget::Atom(n) => n,
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, PointerTarget::Atom(_))
    }
}

/// Full-text search participation of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpec {
    /// Relative ranking weight, higher sorts first.
    pub weight: u8,
}

/// A link prototype: a named relation originating at `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDef {
    pub name: FullName,
    pub source: FullName,
    pub target: PointerTarget,
    #[serde(default)]
    pub search: Option<SearchSpec>,
    /// Scalar properties carried by the link itself, keyed by property name.
    #[serde(default)]
    pub properties: BTreeMap<FullName, FullName>,
}

impl LinkDef {
    pub fn atomic(&self) -> bool {
        self.target.is_atomic()
    }
}

/// A concept prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptDef {
    pub name: FullName,
    /// Direct bases in the inheritance lattice.
    #[serde(default)]
    pub bases: BTreeSet<FullName>,
    /// Names of the links declared on this concept itself; inherited
    /// pointers are found through the bases.
    #[serde(default)]
    pub own_pointers: BTreeSet<FullName>,
}

/// An atom prototype. Atoms are leaves; the analyzer only needs their
/// identity and an optional base for coercion decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomDef {
    pub name: FullName,
    #[serde(default)]
    pub base: Option<FullName>,
}

/// Any schema object, as returned by untyped catalog lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaObject<'a> {
    Concept(&'a ConceptDef),
    Link(&'a LinkDef),
    Atom(&'a AtomDef),
}

impl SchemaObject<'_> {
    pub fn name(&self) -> &FullName {
        match self {
            SchemaObject::Concept(c) => &c.name,
            SchemaObject::Link(l) => &l.name,
            SchemaObject::Atom(a) => &a.name,
        }
    }
}
