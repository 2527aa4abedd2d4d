//! ConceptQL - semantic analyzer and path-algebra normalizer for a query
//! language over a typed object-graph schema.
//!
//! The language navigates a schema of *concepts* (entity types), *links*
//! (typed directed relations with their own properties), and *atoms*
//! (scalar leaf attributes). This crate consumes the parser's surface tree
//! and produces a normalized graph IR suitable for lowering to a
//! relational backend:
//! - surface path steps resolved against the schema catalog
//! - repeated navigations fused into shared graph nodes
//! - filter predicates distributed along the paths they constrain
//! - branching organized as flattened conjunctions/disjunctions of paths
//! - disjunctions of link conjunctions boolean-minimized

pub mod analyzer;
pub mod concept_catalog;
pub mod gir;
pub mod ops;
pub mod surface_ast;

pub use analyzer::{
    get_node_references, normalize_refs, renormalize, transform, Location, TransformError,
    TransformResult, Transformer,
};
pub use concept_catalog::{FullName, Schema};
pub use gir::{GirExprTree, GirGraph, NodeId};
