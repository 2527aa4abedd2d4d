//! Shared fixtures: a small social-graph schema and helpers to inspect
//! normalized graphs.

use std::collections::{BTreeMap, BTreeSet};

use conceptql::concept_catalog::schema_types::{ConceptDef, LinkDef, PointerTarget, SearchSpec};
use conceptql::gir::{GirExprTree, GirNode, GraphExpr, NodeId};
use conceptql::surface_ast::SelectQuery;
use conceptql::{transform, FullName, Schema};

pub fn n(name: &str) -> FullName {
    FullName::new("test", name)
}

fn concept(schema: &mut Schema, name: &str, bases: &[&str]) {
    schema.add_concept(ConceptDef {
        name: n(name),
        bases: bases.iter().map(|b| n(b)).collect(),
        own_pointers: BTreeSet::new(),
    });
}

fn link(schema: &mut Schema, name: &str, source: &str, target: PointerTarget, weight: Option<u8>) {
    schema.add_link(LinkDef {
        name: n(name),
        source: n(source),
        target,
        search: weight.map(|weight| SearchSpec { weight }),
        properties: BTreeMap::new(),
    });
}

/// Named <- User <- {Admin, Moderator}; User links to itself over `friend`
/// and `follows` (the latter carrying a `since` property), and to Post
/// over `posts`. `Thing` has no searchable links.
pub fn schema() -> Schema {
    let mut schema = Schema::new("test");
    concept(&mut schema, "Named", &[]);
    concept(&mut schema, "User", &["Named"]);
    concept(&mut schema, "Admin", &["User"]);
    concept(&mut schema, "Moderator", &["User"]);
    concept(&mut schema, "Post", &[]);
    concept(&mut schema, "Thing", &[]);

    link(
        &mut schema,
        "name",
        "Named",
        PointerTarget::Atom(FullName::std("str")),
        Some(10),
    );
    link(
        &mut schema,
        "age",
        "User",
        PointerTarget::Atom(FullName::std("int")),
        None,
    );
    link(&mut schema, "friend", "User", PointerTarget::Concept(n("User")), None);
    link(&mut schema, "posts", "User", PointerTarget::Concept(n("Post")), None);
    link(
        &mut schema,
        "title",
        "Post",
        PointerTarget::Atom(FullName::std("str")),
        Some(5),
    );
    link(
        &mut schema,
        "weight",
        "Thing",
        PointerTarget::Atom(FullName::std("int")),
        None,
    );

    let mut follows = LinkDef {
        name: n("follows"),
        source: n("User"),
        target: PointerTarget::Concept(n("User")),
        search: None,
        properties: BTreeMap::new(),
    };
    follows
        .properties
        .insert(n("since"), FullName::std("str"));
    schema.add_link(follows);

    schema
}

/// Opt into analyzer logging with `RUST_LOG=trace` when a test misbehaves.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tx(schema: &Schema, query: &SelectQuery) -> GirExprTree {
    init_logging();
    transform(query, schema, &BTreeMap::new(), &BTreeMap::new()).expect("transform")
}

pub fn graph_expr(tree: &GirExprTree) -> GraphExpr {
    match tree.graph.node(tree.root) {
        GirNode::GraphExpr(g) => g.clone(),
        other => panic!("root is {}, not a graph expression", other.kind_name()),
    }
}

/// All distinct entity sets reachable from the normalized root.
pub fn reachable_entity_sets(tree: &GirExprTree) -> Vec<NodeId> {
    tree.graph
        .reachable(tree.root)
        .into_iter()
        .filter(|id| tree.graph.is_entity_set(*id))
        .collect()
}

/// Reachable entity sets of a given concept.
pub fn entity_sets_of(tree: &GirExprTree, concept: &str) -> Vec<NodeId> {
    reachable_entity_sets(tree)
        .into_iter()
        .filter(|id| tree.graph.entity_set(*id).map(|s| s.concept == n(concept)) == Some(true))
        .collect()
}
