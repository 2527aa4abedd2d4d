//! # Graph IR
//!
//! The normalized intermediate representation the analyzer produces: a DAG
//! of entity sets connected by link edges, with filter predicates, path
//! combinations (AND/OR sets of paths), atomic references, operators, and a
//! top-level [`GraphExpr`] wrapping the query clauses.
//!
//! Nodes live in an arena ([`GirGraph`]) and refer to each other by
//! [`NodeId`] index. The graph is cyclic by construction — an entity set
//! points back at its incoming link (`rlink`), and links point at their
//! source and target sets — so back-edges are plain indices, never owning
//! pointers. All unordered reference sets are `BTreeSet`s, which keeps every
//! traversal deterministic.
//!
//! ## Module Organization
//!
//! - `mod.rs` (this file): node taxonomy, arena, rewiring, structural digest
//! - `linear_path.rs`: canonical path identity
//! - `path_index.rs`: multimap from path identity to graph nodes

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::concept_catalog::FullName;
use crate::ops::{Direction, Op, UnaryOperator};

pub mod linear_path;
pub mod path_index;

pub use linear_path::{LinearPath, LinearPathStep};
pub use path_index::{PathIndex, PathKey};

/// Arena index of a GIR node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A scalar literal carried by a [`Constant`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Null,
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The builtin atom this literal naturally types as.
    pub fn atom_type(&self) -> Option<FullName> {
        match self {
            Value::Bool(_) => Some(FullName::std("bool")),
            Value::Int(_) => Some(FullName::std("int")),
            Value::Float(_) => Some(FullName::std("float")),
            Value::Str(_) => Some(FullName::std("str")),
            Value::List(items) => items.first().and_then(Value::atom_type),
            Value::Null => None,
        }
    }
}

/// Label-and-direction constraint of a link edge; two links merge during
/// prefix matching only when these are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFilter {
    pub labels: BTreeSet<FullName>,
    pub direction: Direction,
}

/// Context tags identifying which query clauses use a path node.
pub type UserTag = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySet {
    pub concept: FullName,
    pub id: LinearPath,
    pub anchor: Option<String>,
    /// Boolean predicate over this set, grown by inline-filter folding.
    pub filter: Option<NodeId>,
    /// Sub-concepts selected by `IS NOT` narrowing.
    pub conceptfilter: BTreeSet<FullName>,
    /// Required outbound paths (a combination node, normally a Conjunction).
    pub conjunction: NodeId,
    /// Optional outbound paths (a combination node, normally a Disjunction).
    pub disjunction: NodeId,
    pub atomrefs: BTreeSet<NodeId>,
    pub metarefs: BTreeSet<NodeId>,
    pub users: BTreeSet<UserTag>,
    pub joins: BTreeSet<NodeId>,
    pub backrefs: BTreeSet<NodeId>,
    /// The link this set was reached through, if any.
    pub rlink: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub link_proto: FullName,
    pub filter: Option<LinkFilter>,
    /// Predicate over the link's own properties.
    pub propfilter: Option<NodeId>,
    pub proprefs: BTreeSet<NodeId>,
    pub users: BTreeSet<UserTag>,
    pub anchor: Option<String>,
}

/// Shared shape of `Conjunction` and `Disjunction`: an unordered,
/// de-duplicated set of member paths.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathSet {
    pub paths: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombinationKind {
    Conjunction,
    Disjunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicRefSimple {
    /// Owning entity set, or a disjunction of candidate sets after
    /// reference rewiring.
    pub ref_id: NodeId,
    pub name: FullName,
    pub id: Option<LinearPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRef {
    pub ref_id: NodeId,
    pub name: String,
    pub id: Option<LinearPath>,
}

/// An expression whose net value is atomic, with a back-pointer to the
/// entity set (or link) that owns the referenced atoms. Used for both
/// `AtomicRefExpr` and `LinkPropRefExpr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefExpr {
    pub expr: NodeId,
    pub ref_id: Option<NodeId>,
    pub id: Option<LinearPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPropRefSimple {
    /// Owning entity link.
    pub ref_id: NodeId,
    pub name: FullName,
    pub id: Option<LinearPath>,
}

/// A predicate lifted onto the `filter` slot of an entity set (or the
/// `propfilter` of a link), left in the expression tree as a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineFilter {
    pub expr: NodeId,
    pub ref_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinOp {
    pub left: NodeId,
    pub op: Op,
    pub right: NodeId,
    pub aggregates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryOp {
    pub op: UnaryOperator,
    pub expr: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoneTest {
    pub expr: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCast {
    pub expr: NodeId,
    pub target: FullName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub value: Option<Value>,
    /// Constant-folded expression subtree, for constants without an
    /// immediate literal value.
    pub expr: Option<NodeId>,
    pub type_: Option<FullName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub elements: Vec<NodeId>,
    pub aggregates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub elements: Vec<NodeId>,
    pub concept: FullName,
    pub aggregates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub module: Option<String>,
    pub name: String,
    pub args: Vec<NodeId>,
    pub aggregates: bool,
}

impl FunctionCall {
    pub fn full_name(&self) -> String {
        match &self.module {
            Some(module) => format!("{}::{}", module, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorItem {
    pub name: Option<String>,
    pub expr: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortItem {
    pub expr: NodeId,
    pub ascending: bool,
}

/// A (sub)query: generator predicate plus ordered projection, grouping and
/// sorting lists. Opaque to the enclosing query's path algebra.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphExpr {
    pub generator: Option<NodeId>,
    pub selector: Vec<SelectorItem>,
    pub grouper: Vec<NodeId>,
    pub sorter: Vec<SortItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GirNode {
    EntitySet(EntitySet),
    EntityLink(EntityLink),
    Conjunction(PathSet),
    Disjunction(PathSet),
    AtomicRefSimple(AtomicRefSimple),
    AtomicRefExpr(RefExpr),
    MetaRef(MetaRef),
    LinkPropRefSimple(LinkPropRefSimple),
    LinkPropRefExpr(RefExpr),
    InlineFilter(InlineFilter),
    InlinePropFilter(InlineFilter),
    BinOp(BinOp),
    UnaryOp(UnaryOp),
    NoneTest(NoneTest),
    TypeCast(TypeCast),
    Constant(Constant),
    Sequence(Sequence),
    Record(Record),
    FunctionCall(FunctionCall),
    GraphExpr(GraphExpr),
}

impl GirNode {
    pub fn kind_name(&self) -> &'static str {
        match self {
            GirNode::EntitySet(_) => "EntitySet",
            GirNode::EntityLink(_) => "EntityLink",
            GirNode::Conjunction(_) => "Conjunction",
            GirNode::Disjunction(_) => "Disjunction",
            GirNode::AtomicRefSimple(_) => "AtomicRefSimple",
            GirNode::AtomicRefExpr(_) => "AtomicRefExpr",
            GirNode::MetaRef(_) => "MetaRef",
            GirNode::LinkPropRefSimple(_) => "LinkPropRefSimple",
            GirNode::LinkPropRefExpr(_) => "LinkPropRefExpr",
            GirNode::InlineFilter(_) => "InlineFilter",
            GirNode::InlinePropFilter(_) => "InlinePropFilter",
            GirNode::BinOp(_) => "BinOp",
            GirNode::UnaryOp(_) => "UnaryOp",
            GirNode::NoneTest(_) => "NoneTest",
            GirNode::TypeCast(_) => "TypeCast",
            GirNode::Constant(_) => "Constant",
            GirNode::Sequence(_) => "Sequence",
            GirNode::Record(_) => "Record",
            GirNode::FunctionCall(_) => "FunctionCall",
            GirNode::GraphExpr(_) => "GraphExpr",
        }
    }
}

/// The arena holding one GIR. All node handles are indices into it; the
/// graph as a whole is owned by whoever owns the arena.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GirGraph {
    nodes: Vec<GirNode>,
}

/// A graph together with the node of interest in it.
#[derive(Debug, Clone)]
pub struct GirExprTree {
    pub graph: GirGraph,
    pub root: NodeId,
}

impl GirGraph {
    pub fn new() -> GirGraph {
        GirGraph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alloc(&mut self, node: GirNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &GirNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut GirNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Allocate an entity set together with its (initially empty)
    /// conjunction and disjunction combination nodes.
    pub fn new_entity_set(
        &mut self,
        concept: FullName,
        id: LinearPath,
        anchor: Option<String>,
    ) -> NodeId {
        let conjunction = self.alloc(GirNode::Conjunction(PathSet::default()));
        let disjunction = self.alloc(GirNode::Disjunction(PathSet::default()));
        self.alloc(GirNode::EntitySet(EntitySet {
            concept,
            id,
            anchor,
            filter: None,
            conceptfilter: BTreeSet::new(),
            conjunction,
            disjunction,
            atomrefs: BTreeSet::new(),
            metarefs: BTreeSet::new(),
            users: BTreeSet::new(),
            joins: BTreeSet::new(),
            backrefs: BTreeSet::new(),
            rlink: None,
        }))
    }

    pub fn new_disjunction(&mut self, paths: BTreeSet<NodeId>) -> NodeId {
        self.alloc(GirNode::Disjunction(PathSet { paths }))
    }

    pub fn new_conjunction(&mut self, paths: BTreeSet<NodeId>) -> NodeId {
        self.alloc(GirNode::Conjunction(PathSet { paths }))
    }

    pub fn new_combination(&mut self, kind: CombinationKind, paths: BTreeSet<NodeId>) -> NodeId {
        match kind {
            CombinationKind::Conjunction => self.new_conjunction(paths),
            CombinationKind::Disjunction => self.new_disjunction(paths),
        }
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub fn entity_set(&self, id: NodeId) -> Option<&EntitySet> {
        match self.node(id) {
            GirNode::EntitySet(s) => Some(s),
            _ => None,
        }
    }

    pub fn entity_set_mut(&mut self, id: NodeId) -> Option<&mut EntitySet> {
        match self.node_mut(id) {
            GirNode::EntitySet(s) => Some(s),
            _ => None,
        }
    }

    pub fn entity_link(&self, id: NodeId) -> Option<&EntityLink> {
        match self.node(id) {
            GirNode::EntityLink(l) => Some(l),
            _ => None,
        }
    }

    pub fn entity_link_mut(&mut self, id: NodeId) -> Option<&mut EntityLink> {
        match self.node_mut(id) {
            GirNode::EntityLink(l) => Some(l),
            _ => None,
        }
    }

    pub fn combination_kind(&self, id: NodeId) -> Option<CombinationKind> {
        match self.node(id) {
            GirNode::Conjunction(_) => Some(CombinationKind::Conjunction),
            GirNode::Disjunction(_) => Some(CombinationKind::Disjunction),
            _ => None,
        }
    }

    pub fn combination_paths(&self, id: NodeId) -> Option<&BTreeSet<NodeId>> {
        match self.node(id) {
            GirNode::Conjunction(p) | GirNode::Disjunction(p) => Some(&p.paths),
            _ => None,
        }
    }

    pub fn combination_paths_mut(&mut self, id: NodeId) -> Option<&mut BTreeSet<NodeId>> {
        match self.node_mut(id) {
            GirNode::Conjunction(p) | GirNode::Disjunction(p) => Some(&mut p.paths),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Kind predicates
    // ------------------------------------------------------------------

    pub fn is_entity_set(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::EntitySet(_))
    }

    pub fn is_entity_link(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::EntityLink(_))
    }

    pub fn is_set_or_link(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::EntitySet(_) | GirNode::EntityLink(_))
    }

    pub fn is_combination(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::Conjunction(_) | GirNode::Disjunction(_))
    }

    pub fn is_disjunction(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::Disjunction(_))
    }

    pub fn is_conjunction(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::Conjunction(_))
    }

    /// Atomic references: simple, expression-valued, or meta.
    pub fn is_atomic_ref(&self, id: NodeId) -> bool {
        matches!(
            self.node(id),
            GirNode::AtomicRefSimple(_) | GirNode::AtomicRefExpr(_) | GirNode::MetaRef(_)
        )
    }

    pub fn is_link_prop_ref(&self, id: NodeId) -> bool {
        matches!(
            self.node(id),
            GirNode::LinkPropRefSimple(_) | GirNode::LinkPropRefExpr(_)
        )
    }

    pub fn is_base_ref(&self, id: NodeId) -> bool {
        self.is_atomic_ref(id) || self.is_link_prop_ref(id)
    }

    /// Any node participating in the path algebra.
    pub fn is_path(&self, id: NodeId) -> bool {
        self.is_set_or_link(id) || self.is_combination(id) || self.is_base_ref(id)
    }

    pub fn is_constant(&self, id: NodeId) -> bool {
        matches!(self.node(id), GirNode::Constant(_))
    }

    /// The `ref` slot of any reference-carrying node.
    pub fn ref_of(&self, id: NodeId) -> Option<NodeId> {
        match self.node(id) {
            GirNode::AtomicRefSimple(r) => Some(r.ref_id),
            GirNode::MetaRef(r) => Some(r.ref_id),
            GirNode::AtomicRefExpr(r) | GirNode::LinkPropRefExpr(r) => r.ref_id,
            GirNode::LinkPropRefSimple(r) => Some(r.ref_id),
            GirNode::InlineFilter(f) | GirNode::InlinePropFilter(f) => Some(f.ref_id),
            _ => None,
        }
    }

    /// Aggregate flag of nodes that carry one.
    pub fn aggregates_flag(&self, id: NodeId) -> bool {
        match self.node(id) {
            GirNode::BinOp(b) => b.aggregates,
            GirNode::FunctionCall(f) => f.aggregates,
            GirNode::Sequence(s) => s.aggregates,
            GirNode::Record(r) => r.aggregates,
            _ => false,
        }
    }

    /// Canonical path identity of a path node, when it has one.
    pub fn path_id_of(&self, id: NodeId) -> Option<LinearPath> {
        match self.node(id) {
            GirNode::EntitySet(s) => Some(s.id.clone()),
            GirNode::AtomicRefSimple(r) => r.id.clone(),
            GirNode::MetaRef(r) => r.id.clone(),
            GirNode::AtomicRefExpr(r) | GirNode::LinkPropRefExpr(r) => r.id.clone(),
            GirNode::LinkPropRefSimple(r) => r.id.clone(),
            GirNode::EntityLink(l) => match l.target {
                Some(target) => self.entity_set(target).map(|s| s.id.clone()),
                None => {
                    let source = l.source?;
                    let source_id = self.entity_set(source)?.id.clone();
                    let filter = l.filter.as_ref()?;
                    Some(source_id.extended(filter.labels.clone(), filter.direction, None))
                }
            },
            _ => None,
        }
    }

    /// Path-index key of a node: its anchor when set, its path id otherwise.
    pub fn index_key_of(&self, id: NodeId) -> Option<PathKey> {
        match self.node(id) {
            GirNode::EntitySet(s) => match &s.anchor {
                Some(anchor) => Some(PathKey::Anchor(anchor.clone())),
                None => Some(PathKey::Path(s.id.clone())),
            },
            GirNode::AtomicRefSimple(r) => r.id.clone().map(PathKey::Path),
            GirNode::MetaRef(r) => r.id.clone().map(PathKey::Path),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Traversal and rewiring
    // ------------------------------------------------------------------

    /// The structural children of a node: every slot taking part in the
    /// expression/path shape. Bookkeeping index sets (`atomrefs`,
    /// `metarefs`, `proprefs`, `joins`, `backrefs`) are not children.
    pub fn structural_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        match self.node(id) {
            GirNode::EntitySet(s) => {
                out.extend(s.filter);
                out.push(s.conjunction);
                out.push(s.disjunction);
                out.extend(s.rlink);
            }
            GirNode::EntityLink(l) => {
                out.extend(l.source);
                out.extend(l.target);
                out.extend(l.propfilter);
            }
            GirNode::Conjunction(p) | GirNode::Disjunction(p) => {
                out.extend(p.paths.iter().copied());
            }
            GirNode::AtomicRefSimple(r) => out.push(r.ref_id),
            GirNode::MetaRef(r) => out.push(r.ref_id),
            GirNode::AtomicRefExpr(r) | GirNode::LinkPropRefExpr(r) => {
                out.push(r.expr);
                out.extend(r.ref_id);
            }
            GirNode::LinkPropRefSimple(r) => out.push(r.ref_id),
            GirNode::InlineFilter(f) | GirNode::InlinePropFilter(f) => {
                out.push(f.expr);
                out.push(f.ref_id);
            }
            GirNode::BinOp(b) => {
                out.push(b.left);
                out.push(b.right);
            }
            GirNode::UnaryOp(u) => out.push(u.expr),
            GirNode::NoneTest(n) => out.push(n.expr),
            GirNode::TypeCast(c) => out.push(c.expr),
            GirNode::Constant(c) => out.extend(c.expr),
            GirNode::Sequence(s) => out.extend(s.elements.iter().copied()),
            GirNode::Record(r) => out.extend(r.elements.iter().copied()),
            GirNode::FunctionCall(f) => out.extend(f.args.iter().copied()),
            GirNode::GraphExpr(g) => {
                out.extend(g.generator);
                out.extend(g.selector.iter().map(|s| s.expr));
                out.extend(g.grouper.iter().copied());
                out.extend(g.sorter.iter().map(|s| s.expr));
            }
        }
        out
    }

    /// Depth-first collection of all nodes reachable from `root` through
    /// structural children (including `root`), in deterministic pre-order.
    /// Cycles are cut by the visited set.
    pub fn reachable(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            order.push(id);
            let mut children = self.structural_children(id);
            children.reverse();
            stack.extend(children);
        }
        order
    }

    /// All reachable nodes matching `predicate`, pre-order.
    pub fn collect_matching<P>(&self, root: NodeId, predicate: P) -> Vec<NodeId>
    where
        P: Fn(&GirGraph, NodeId) -> bool,
    {
        self.reachable(root)
            .into_iter()
            .filter(|id| predicate(self, *id))
            .collect()
    }

    fn replace_in_set(set: &mut BTreeSet<NodeId>, old: &[NodeId], new: NodeId) {
        let mut hit = false;
        for o in old {
            if set.remove(o) {
                hit = true;
            }
        }
        if hit {
            set.insert(new);
        }
    }

    fn replace_slot(slot: &mut NodeId, old: &[NodeId], new: NodeId) {
        if old.contains(slot) {
            *slot = new;
        }
    }

    fn replace_opt_slot(slot: &mut Option<NodeId>, old: &[NodeId], new: NodeId) {
        if let Some(id) = slot {
            if old.contains(id) {
                *slot = Some(new);
            }
        }
    }

    /// Replace every reference to a node in `old` with `new` inside a single
    /// node's slots, including the bookkeeping sets.
    fn replace_refs_in_node(&mut self, id: NodeId, old: &[NodeId], new: NodeId) {
        match self.node_mut(id) {
            GirNode::EntitySet(s) => {
                Self::replace_opt_slot(&mut s.filter, old, new);
                Self::replace_slot(&mut s.conjunction, old, new);
                Self::replace_slot(&mut s.disjunction, old, new);
                Self::replace_opt_slot(&mut s.rlink, old, new);
                Self::replace_in_set(&mut s.atomrefs, old, new);
                Self::replace_in_set(&mut s.metarefs, old, new);
                Self::replace_in_set(&mut s.joins, old, new);
                Self::replace_in_set(&mut s.backrefs, old, new);
            }
            GirNode::EntityLink(l) => {
                Self::replace_opt_slot(&mut l.source, old, new);
                Self::replace_opt_slot(&mut l.target, old, new);
                Self::replace_opt_slot(&mut l.propfilter, old, new);
                Self::replace_in_set(&mut l.proprefs, old, new);
            }
            GirNode::Conjunction(p) | GirNode::Disjunction(p) => {
                Self::replace_in_set(&mut p.paths, old, new);
            }
            GirNode::AtomicRefSimple(r) => Self::replace_slot(&mut r.ref_id, old, new),
            GirNode::MetaRef(r) => Self::replace_slot(&mut r.ref_id, old, new),
            GirNode::AtomicRefExpr(r) | GirNode::LinkPropRefExpr(r) => {
                Self::replace_slot(&mut r.expr, old, new);
                Self::replace_opt_slot(&mut r.ref_id, old, new);
            }
            GirNode::LinkPropRefSimple(r) => Self::replace_slot(&mut r.ref_id, old, new),
            GirNode::InlineFilter(f) | GirNode::InlinePropFilter(f) => {
                Self::replace_slot(&mut f.expr, old, new);
                Self::replace_slot(&mut f.ref_id, old, new);
            }
            GirNode::BinOp(b) => {
                Self::replace_slot(&mut b.left, old, new);
                Self::replace_slot(&mut b.right, old, new);
            }
            GirNode::UnaryOp(u) => Self::replace_slot(&mut u.expr, old, new),
            GirNode::NoneTest(n) => Self::replace_slot(&mut n.expr, old, new),
            GirNode::TypeCast(c) => Self::replace_slot(&mut c.expr, old, new),
            GirNode::Constant(c) => Self::replace_opt_slot(&mut c.expr, old, new),
            GirNode::Sequence(s) => {
                for e in &mut s.elements {
                    Self::replace_slot(e, old, new);
                }
            }
            GirNode::Record(r) => {
                for e in &mut r.elements {
                    Self::replace_slot(e, old, new);
                }
            }
            GirNode::FunctionCall(f) => {
                for a in &mut f.args {
                    Self::replace_slot(a, old, new);
                }
            }
            GirNode::GraphExpr(g) => {
                Self::replace_opt_slot(&mut g.generator, old, new);
                for s in &mut g.selector {
                    Self::replace_slot(&mut s.expr, old, new);
                }
                for gr in &mut g.grouper {
                    Self::replace_slot(gr, old, new);
                }
                for s in &mut g.sorter {
                    Self::replace_slot(&mut s.expr, old, new);
                }
            }
        }
    }

    /// Re-point every reference to any node in `old` at `new`, across the
    /// whole arena. This is the unification workhorse: after two path nodes
    /// merge, one sweep makes the survivor canonical everywhere, back-edges
    /// included.
    pub fn fixup_refs(&mut self, old: &[NodeId], new: NodeId) {
        if old.is_empty() {
            return;
        }
        let count = self.nodes.len() as u32;
        for i in 0..count {
            self.replace_refs_in_node(NodeId(i), old, new);
        }
        // A merged node must not list itself among its own joins.
        if let Some(set) = self.entity_set_mut(new) {
            set.joins.remove(&new);
            set.backrefs.remove(&new);
        }
    }

    /// Scoped variant of [`fixup_refs`]: rewires only the nodes reachable
    /// from `root`, used when folding one operand of a binary operation into
    /// another without disturbing unrelated paths.
    pub fn replace_refs_in_subtree(&mut self, root: NodeId, old: &[NodeId], new: NodeId) {
        for id in self.reachable(root) {
            self.replace_refs_in_node(id, old, new);
        }
    }

    // ------------------------------------------------------------------
    // Structural digest
    // ------------------------------------------------------------------

    /// A canonical, `NodeId`-independent description of the graph reachable
    /// from `id`. Two normalized graphs describing the same query produce
    /// equal digests, which is what the structural-equality tests compare.
    /// Bookkeeping sets are excluded; `conceptfilter`, filters, anchors and
    /// combination structure are included.
    pub fn digest(&self, id: NodeId) -> String {
        let mut stack = Vec::new();
        self.digest_inner(id, &mut stack)
    }

    fn digest_set(&self, ids: &BTreeSet<NodeId>, stack: &mut Vec<NodeId>) -> String {
        let mut parts: Vec<String> = ids.iter().map(|p| self.digest_inner(*p, stack)).collect();
        parts.sort();
        parts.join(",")
    }

    fn digest_opt(&self, id: Option<NodeId>, stack: &mut Vec<NodeId>) -> String {
        match id {
            Some(id) => self.digest_inner(id, stack),
            None => "-".to_string(),
        }
    }

    fn digest_inner(&self, id: NodeId, stack: &mut Vec<NodeId>) -> String {
        if stack.contains(&id) {
            return match self.node(id) {
                GirNode::EntitySet(s) => format!("&set({})", s.id),
                GirNode::EntityLink(l) => format!("&link({})", l.link_proto),
                other => format!("&{}", other.kind_name()),
            };
        }
        stack.push(id);
        let out = match self.node(id) {
            GirNode::EntitySet(s) => {
                let cf: Vec<String> = s.conceptfilter.iter().map(|c| c.to_string()).collect();
                let conj = self
                    .combination_paths(s.conjunction)
                    .cloned()
                    .unwrap_or_default();
                let disj = self
                    .combination_paths(s.disjunction)
                    .cloned()
                    .unwrap_or_default();
                format!(
                    "set({}|anchor={}|filter={}|cf=[{}]|conj=[{}]|disj=[{}])",
                    s.id,
                    s.anchor.as_deref().unwrap_or("-"),
                    self.digest_opt(s.filter, stack),
                    cf.join(","),
                    self.digest_set(&conj, stack),
                    self.digest_set(&disj, stack),
                )
            }
            GirNode::EntityLink(l) => {
                let labels = l
                    .filter
                    .as_ref()
                    .map(|f| {
                        let names: Vec<String> = f.labels.iter().map(|n| n.to_string()).collect();
                        format!("{}{}", f.direction, names.join("|"))
                    })
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "link({}|{}|prop={}|target={})",
                    l.link_proto,
                    labels,
                    self.digest_opt(l.propfilter, stack),
                    self.digest_opt(l.target, stack),
                )
            }
            GirNode::Conjunction(p) => format!("and[{}]", self.digest_set(&p.paths, stack)),
            GirNode::Disjunction(p) => format!("or[{}]", self.digest_set(&p.paths, stack)),
            GirNode::AtomicRefSimple(r) => {
                format!("aref({}@{})", r.name, self.digest_inner(r.ref_id, stack))
            }
            GirNode::MetaRef(r) => {
                format!("meta({}@{})", r.name, self.digest_inner(r.ref_id, stack))
            }
            GirNode::AtomicRefExpr(r) => {
                format!("arefx({})", self.digest_inner(r.expr, stack))
            }
            GirNode::LinkPropRefSimple(r) => {
                format!("pref({}@{})", r.name, self.digest_inner(r.ref_id, stack))
            }
            GirNode::LinkPropRefExpr(r) => {
                format!("prefx({})", self.digest_inner(r.expr, stack))
            }
            GirNode::InlineFilter(f) => {
                format!("inline({})", self.digest_inner(f.expr, stack))
            }
            GirNode::InlinePropFilter(f) => {
                format!("inlineprop({})", self.digest_inner(f.expr, stack))
            }
            GirNode::BinOp(b) => format!(
                "({} {} {})",
                self.digest_inner(b.left, stack),
                b.op,
                self.digest_inner(b.right, stack)
            ),
            GirNode::UnaryOp(u) => format!("({} {})", u.op, self.digest_inner(u.expr, stack)),
            GirNode::NoneTest(n) => format!("none?({})", self.digest_inner(n.expr, stack)),
            GirNode::TypeCast(c) => {
                format!("cast({} as {})", self.digest_inner(c.expr, stack), c.target)
            }
            GirNode::Constant(c) => match (&c.value, c.expr) {
                (Some(v), _) => format!("const({v:?})"),
                (None, Some(e)) => format!("constx({})", self.digest_inner(e, stack)),
                (None, None) => "const(-)".to_string(),
            },
            GirNode::Sequence(s) => {
                let parts: Vec<String> =
                    s.elements.iter().map(|e| self.digest_inner(*e, stack)).collect();
                format!("seq[{}]", parts.join(","))
            }
            GirNode::Record(r) => {
                let parts: Vec<String> =
                    r.elements.iter().map(|e| self.digest_inner(*e, stack)).collect();
                format!("record({})[{}]", r.concept, parts.join(","))
            }
            GirNode::FunctionCall(f) => {
                let parts: Vec<String> =
                    f.args.iter().map(|a| self.digest_inner(*a, stack)).collect();
                format!("{}({})", f.full_name(), parts.join(","))
            }
            GirNode::GraphExpr(g) => {
                let sel: Vec<String> = g
                    .selector
                    .iter()
                    .map(|s| {
                        format!(
                            "{}:{}",
                            s.name.as_deref().unwrap_or("-"),
                            self.digest_inner(s.expr, stack)
                        )
                    })
                    .collect();
                let grp: Vec<String> =
                    g.grouper.iter().map(|e| self.digest_inner(*e, stack)).collect();
                let srt: Vec<String> = g
                    .sorter
                    .iter()
                    .map(|s| {
                        format!(
                            "{}{}",
                            self.digest_inner(s.expr, stack),
                            if s.ascending { "+" } else { "-" }
                        )
                    })
                    .collect();
                format!(
                    "graph(gen={}|sel=[{}]|grp=[{}]|srt=[{}])",
                    self.digest_opt(g.generator, stack),
                    sel.join(";"),
                    grp.join(";"),
                    srt.join(";"),
                )
            }
        };
        stack.pop();
        out
    }
}
