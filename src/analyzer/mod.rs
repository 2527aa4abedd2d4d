//! # Analyzer
//!
//! The semantic analyzer and path-algebra normalizer. It consumes the
//! parser's surface tree and produces a normalized [`GraphExpr`]: every
//! surface path resolved against the catalog, repeated navigations fused
//! into shared graph nodes, filter predicates distributed along the paths
//! they constrain, and branching organized as flattened conjunctions and
//! disjunctions of paths.
//!
//! ## Pass pipeline
//!
//! ```text
//! 1. Lowering            - surface tree -> raw GIR (per clause)
//! 2. Path merging        - fold operators onto path references
//! 3. Aggregate analysis  - propagate aggregate-ness, reject bad mixes
//! 4. Clause unification  - fuse equal navigations across clauses
//! 5. Reference rewiring  - re-point atomic refs at canonical nodes
//! 6. Post-processing     - generator role fixups
//! ```
//!
//! ## Module Organization
//!
//! - `lowering.rs`: surface tree to GIR, name resolution
//! - `merge.rs`: contextual operator folding (`merge_paths`)
//! - `binop.rs`: binary/unary/function/sequence lowering rewrites
//! - `path_algebra.rs`: additive/multiplicative path combination
//! - `boolean_minimize.rs`: disjunction minimization bridge
//! - `prefix_extraction.rs`: path indexing and atomic-ref rewiring
//! - `aggregates.rs`: aggregate propagation
//! - `postprocess.rs`: role fixups after merging
//! - `typing.rs`: result-type inference for selectors
//! - `errors.rs`: error types

use std::collections::{BTreeMap, BTreeSet};

use crate::concept_catalog::{FullName, Schema};
use crate::gir::{
    GirExprTree, GirGraph, GirNode, GraphExpr, LinearPath, NodeId, PathIndex, SelectorItem,
    SortItem,
};
use crate::surface_ast as ast;

pub mod aggregates;
pub mod binop;
pub mod boolean_minimize;
pub mod errors;
pub mod lowering;
pub mod merge;
pub mod path_algebra;
pub mod postprocess;
pub mod prefix_extraction;
pub mod typing;

pub use errors::{TransformError, TransformResult};

/// The syntactic clause an expression is being processed under. The
/// generator (WHERE) is the only strong context: predicates there constrain
/// the outer path set; everywhere else path combination is disjunctive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Generator,
    Selector,
    Grouper,
    Sorter,
}

impl Location {
    pub fn tag(&self) -> &'static str {
        match self {
            Location::Generator => "generator",
            Location::Selector => "selector",
            Location::Grouper => "grouper",
            Location::Sorter => "sorter",
        }
    }
}

/// Subquery recursion mode for path extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurse {
    No,
    Once,
    Deep,
}

/// Options for [`Transformer::extract_paths`].
#[derive(Debug, Clone, Copy)]
pub struct ExtractOpts {
    /// Walk every entity set back to its navigation root.
    pub reverse: bool,
    /// Resolve atomic references to their owning sets.
    pub resolve_arefs: bool,
    pub recurse: Recurse,
}

impl ExtractOpts {
    pub fn new() -> ExtractOpts {
        ExtractOpts {
            reverse: false,
            resolve_arefs: true,
            recurse: Recurse::No,
        }
    }

    pub fn reverse(mut self, on: bool) -> ExtractOpts {
        self.reverse = on;
        self
    }

    pub fn resolve_arefs(mut self, on: bool) -> ExtractOpts {
        self.resolve_arefs = on;
        self
    }

    pub fn recurse(mut self, mode: Recurse) -> ExtractOpts {
        self.recurse = mode;
        self
    }
}

impl Default for ExtractOpts {
    fn default() -> Self {
        ExtractOpts::new()
    }
}

/// One transformation: a surface query, a schema snapshot, and the GIR
/// being built. Instantiate one per query; nothing is shared between
/// transformations and the schema is never written to.
pub struct Transformer<'a> {
    pub(crate) schema: &'a Schema,
    pub graph: GirGraph,
    pub(crate) module_aliases: BTreeMap<String, String>,
    pub(crate) anchors: BTreeMap<String, FullName>,
    /// Path identities of the grouping expressions of the query currently
    /// being transformed; paths listed here count as aggregated.
    pub(crate) group_prefixes: BTreeSet<LinearPath>,
}

impl<'a> Transformer<'a> {
    pub fn new(
        schema: &'a Schema,
        anchors: BTreeMap<String, FullName>,
        module_aliases: BTreeMap<String, String>,
    ) -> Transformer<'a> {
        Transformer {
            schema,
            graph: GirGraph::new(),
            module_aliases,
            anchors,
            group_prefixes: BTreeSet::new(),
        }
    }

    /// Resume over an existing graph, for re-normalization.
    pub fn resume(schema: &'a Schema, graph: GirGraph) -> Transformer<'a> {
        Transformer {
            schema,
            graph,
            module_aliases: BTreeMap::new(),
            anchors: BTreeMap::new(),
            group_prefixes: BTreeSet::new(),
        }
    }

    /// Transform one select query into a normalized [`GraphExpr`].
    pub fn transform_select(&mut self, query: &ast::SelectQuery) -> TransformResult<NodeId> {
        let generator = match &query.where_clause {
            Some(expr) => Some(self.process_expr(Location::Generator, expr)?),
            None => None,
        };

        let mut grouper = Vec::new();
        for expr in &query.grouper {
            let id = self.process_expr(Location::Grouper, expr)?;
            if let Some(path_id) = self.graph.path_id_of(id) {
                self.group_prefixes.insert(path_id);
            }
            grouper.push(id);
        }

        let mut selector = Vec::new();
        for item in &query.selector {
            let id = self.process_expr(Location::Selector, &item.expr)?;
            selector.push(SelectorItem {
                name: item.name.clone(),
                expr: id,
            });
        }

        let mut sorter = Vec::new();
        for item in &query.sorter {
            let id = self.process_expr(Location::Sorter, &item.expr)?;
            sorter.push(SortItem {
                expr: id,
                ascending: item.ascending,
            });
        }

        // The graph expression is allocated before unification so that
        // reference rewiring reaches its clause slots: when a clause's
        // path root is merged away, the slot must follow to the survivor.
        let root = self.graph.alloc(GirNode::GraphExpr(GraphExpr::default()));
        self.normalize_graph_parts_at(
            root,
            GraphExpr {
                generator,
                selector,
                grouper,
                sorter,
            },
        )?;
        Ok(root)
    }

    /// Merge, aggregate-check, unify and post-process lowered clause parts,
    /// storing the result at `root`. Running this twice over the same parts
    /// is a no-op the second time, which is what makes normalization
    /// idempotent.
    pub(crate) fn normalize_graph_parts_at(
        &mut self,
        root: NodeId,
        parts: GraphExpr,
    ) -> TransformResult<()> {
        let GraphExpr {
            generator,
            selector,
            grouper,
            sorter,
        } = parts;

        for id in &grouper {
            if let Some(path_id) = self.graph.path_id_of(*id) {
                self.group_prefixes.insert(path_id);
            }
        }

        let generator = match generator {
            Some(id) => {
                let merged = self.merge_paths(id, Location::Generator)?;
                self.reorder_aggregates(merged)?;
                Some(merged)
            }
            None => None,
        };

        let mut merged_grouper = Vec::new();
        for id in grouper {
            merged_grouper.push(self.merge_paths(id, Location::Grouper)?);
        }

        let mut merged_selector = Vec::new();
        for item in selector {
            let merged = self.merge_paths(item.expr, Location::Selector)?;
            self.reorder_aggregates(merged)?;
            merged_selector.push(SelectorItem {
                name: item.name,
                expr: merged,
            });
        }

        let mut merged_sorter = Vec::new();
        for item in sorter {
            let merged = self.merge_paths(item.expr, Location::Sorter)?;
            merged_sorter.push(SortItem {
                expr: merged,
                ascending: item.ascending,
            });
        }

        *self.graph.node_mut(root) = GirNode::GraphExpr(GraphExpr {
            generator,
            selector: merged_selector,
            grouper: merged_grouper,
            sorter: merged_sorter,
        });
        self.unify_clauses(root)?;
        Ok(())
    }

    /// Fuse equal navigations across query clauses: extract every clause's
    /// path roots, unify them into one canonical path graph, and re-point
    /// all atomic references at the canonical nodes. The clause slots are
    /// read from (and rewired through) the arena node at `root`.
    fn unify_clauses(&mut self, root: NodeId) -> TransformResult<()> {
        let parts = match self.graph.node(root) {
            GirNode::GraphExpr(g) => g.clone(),
            other => {
                return Err(TransformError::tree(format!(
                    "clause unification expects a graph expression, found {}",
                    other.kind_name()
                )))
            }
        };
        let mut clause_parts: Vec<(NodeId, Location)> = Vec::new();
        if let Some(g) = parts.generator {
            clause_parts.push((g, Location::Generator));
        }
        for item in &parts.selector {
            clause_parts.push((item.expr, Location::Selector));
        }
        for id in &parts.grouper {
            clause_parts.push((*id, Location::Grouper));
        }
        for item in &parts.sorter {
            clause_parts.push((item.expr, Location::Sorter));
        }

        let mut roots = BTreeSet::new();
        for (part, loc) in &clause_parts {
            let opts = ExtractOpts::new().reverse(true).resolve_arefs(true);
            if let Some(clause_root) = self.extract_paths(*part, opts, *loc)? {
                roots.insert(clause_root);
            }
        }

        if roots.is_empty() {
            return Ok(());
        }

        log::debug!("unifying {} clause path root(s)", roots.len());
        let unified = self.unify_paths(
            roots,
            crate::gir::CombinationKind::Disjunction,
            true,
            true,
            Location::Generator,
        )?;

        let mut index = PathIndex::new();
        if let Some(unified) = unified {
            self.extract_prefixes(unified, &mut index)?;
        }

        // Unification may have rewired the clause slots; work off the
        // current state of the graph expression from here on.
        let parts = match self.graph.node(root) {
            GirNode::GraphExpr(g) => g.clone(),
            _ => return Err(TransformError::tree("graph expression vanished")),
        };
        let mut current_parts: Vec<NodeId> = Vec::new();
        current_parts.extend(parts.generator);
        current_parts.extend(parts.selector.iter().map(|s| s.expr));
        current_parts.extend(parts.grouper.iter().copied());
        current_parts.extend(parts.sorter.iter().map(|s| s.expr));
        for part in current_parts {
            self.replace_atom_refs(part, &index)?;
        }

        if let Some(generator) = parts.generator {
            self.postprocess_expr(generator, Location::Generator)?;
        }
        Ok(())
    }
}

/// Primary entry point: lower and normalize one query.
///
/// `anchors` maps caller-introduced bindings to the concepts they stand
/// for; `module_aliases` maps surface module aliases to real module names.
pub fn transform(
    query: &ast::SelectQuery,
    schema: &Schema,
    anchors: &BTreeMap<String, FullName>,
    module_aliases: &BTreeMap<String, String>,
) -> TransformResult<GirExprTree> {
    let mut transformer = Transformer::new(schema, anchors.clone(), module_aliases.clone());
    let root = transformer.transform_select(query)?;
    Ok(GirExprTree {
        graph: transformer.graph,
        root,
    })
}

/// Re-run normalization over an already transformed query. The result is
/// structurally identical for trees produced by [`transform`].
pub fn renormalize(tree: &mut GirExprTree, schema: &Schema) -> TransformResult<()> {
    let parts = match tree.graph.node(tree.root) {
        GirNode::GraphExpr(g) => g.clone(),
        other => {
            return Err(TransformError::tree(format!(
                "renormalize expects a graph expression, found {}",
                other.kind_name()
            )))
        }
    };
    let mut transformer = Transformer::resume(schema, std::mem::take(&mut tree.graph));
    transformer.normalize_graph_parts_at(tree.root, parts)?;
    tree.graph = transformer.graph;
    Ok(())
}

/// Resolve every name in a surface tree to its fully qualified form
/// without lowering to GIR.
pub fn normalize_refs(
    query: &ast::SelectQuery,
    schema: &Schema,
    module_aliases: &BTreeMap<String, String>,
) -> TransformResult<ast::SelectQuery> {
    lowering::normalize_query_refs(query, schema, module_aliases)
}

/// The unique schema entities (concepts and link prototypes) referenced by
/// a surface tree.
pub fn get_node_references(
    query: &ast::SelectQuery,
    schema: &Schema,
    module_aliases: &BTreeMap<String, String>,
) -> TransformResult<BTreeSet<FullName>> {
    lowering::collect_node_references(query, schema, module_aliases)
}

/// Validate that a processed expression only references atoms local to its
/// source: a bare reference, or a disjunction of references. Used by
/// callers that embed computed expressions into pointer definitions.
pub fn check_local_atomic_expr(graph: &GirGraph, expr: NodeId) -> TransformResult<()> {
    let ok = graph.is_base_ref(expr)
        || (graph.is_disjunction(expr)
            && graph
                .combination_paths(expr)
                .and_then(|paths| paths.iter().next())
                .map(|first| graph.is_base_ref(*first))
                .unwrap_or(false));
    if ok {
        Ok(())
    } else {
        Err(TransformError::reference(
            "invalid link reference: expression must only contain references to local atoms",
        ))
    }
}
