//! # Concept catalog
//!
//! The schema collaborator of the analyzer: concepts (entity types in an
//! inheritance lattice), links (typed relations with optional scalar
//! properties and search participation), and atoms (scalar leaf types).
//!
//! ## Module Organization
//!
//! - `names.rs`: qualified names and module-alias resolution
//! - `schema_types.rs`: prototype definitions
//! - `schema.rs`: the catalog store and its query interface
//! - `type_rules.rs`: operator/function result-type table
//! - `errors.rs`: error types

pub mod errors;
pub mod names;
pub mod schema;
pub mod schema_types;
pub mod type_rules;

pub use errors::SchemaError;
pub use names::{FullName, ID_POINTER};
pub use schema::Schema;
pub use schema_types::{AtomDef, ConceptDef, LinkDef, PointerTarget, SchemaObject, SearchSpec};
