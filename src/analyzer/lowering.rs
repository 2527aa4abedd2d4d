//! Surface tree to GIR lowering.
//!
//! Resolves surface path steps against the catalog and builds entity
//! set/link chains, extending the canonical path identity one step at a
//! time. Newly created links hang off their source set's disjunction; the
//! post-processing pass later promotes them to conjunctions where the
//! generator requires strong paths. Operators and calls are handed to the
//! binary-op lowering immediately after their operands.

use std::collections::{BTreeMap, BTreeSet};

use crate::concept_catalog::{FullName, Schema};
use crate::gir::{
    AtomicRefSimple, Constant, FunctionCall, GirNode, LinearPath, LinkFilter, LinkPropRefSimple,
    MetaRef, NodeId, Record, Sequence, TypeCast, Value,
};
use crate::ops::Direction;
use crate::surface_ast as ast;

use super::errors::{TransformError, TransformResult};
use super::{Location, Transformer};

impl<'a> Transformer<'a> {
    pub fn process_expr(&mut self, loc: Location, expr: &ast::Expr) -> TransformResult<NodeId> {
        match expr {
            ast::Expr::Path(path) => self.process_path(loc, path),

            ast::Expr::BinOp(binop) => {
                if binop.op.is_type_check() {
                    let left = self.process_expr(loc, &binop.left)?;
                    let concept = self.resolve_concept_operand(&binop.right)?;
                    self.process_type_check(left, &concept, binop.op, loc)
                } else {
                    let left = self.process_expr(loc, &binop.left)?;
                    let right = self.process_expr(loc, &binop.right)?;
                    self.process_binop(left, right, binop.op, loc)
                }
            }

            ast::Expr::UnaryOp(unary) => {
                let inner = self.process_expr(loc, &unary.expr)?;
                self.process_unaryop(inner, unary.op, loc)
            }

            ast::Expr::Constant(constant) => {
                let value = lower_literal(&constant.value);
                let type_ = value.atom_type();
                Ok(self.graph.alloc(GirNode::Constant(Constant {
                    value: Some(value),
                    expr: None,
                    type_,
                })))
            }

            ast::Expr::FunctionCall(call) => {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in &call.args {
                    args.push(self.process_expr(loc, arg)?);
                }
                let node = self.graph.alloc(GirNode::FunctionCall(FunctionCall {
                    module: call.module.clone(),
                    name: call.name.clone(),
                    args,
                    aggregates: false,
                }));
                self.process_function_call(node)
            }

            ast::Expr::Sequence(sequence) => {
                let mut elements = Vec::with_capacity(sequence.elements.len());
                for element in &sequence.elements {
                    elements.push(self.process_expr(loc, element)?);
                }
                let node = self.graph.alloc(GirNode::Sequence(Sequence {
                    elements,
                    aggregates: false,
                }));
                self.process_sequence(node)
            }

            ast::Expr::Record(record) => {
                let concept = self.schema.resolve(&record.concept, &self.module_aliases)?;
                self.schema.get_concept(&concept)?;
                let mut elements = Vec::with_capacity(record.elements.len());
                for element in &record.elements {
                    elements.push(self.process_expr(loc, element)?);
                }
                Ok(self.graph.alloc(GirNode::Record(Record {
                    elements,
                    concept,
                    aggregates: false,
                })))
            }

            ast::Expr::TypeCast(cast) => {
                let inner = self.process_expr(loc, &cast.expr)?;
                let target = self.schema.resolve(&cast.target, &self.module_aliases)?;
                self.schema.get(&target)?;
                Ok(self
                    .graph
                    .alloc(GirNode::TypeCast(TypeCast { expr: inner, target })))
            }

            ast::Expr::NoneTest(test) => {
                let inner = self.process_expr(loc, &test.expr)?;
                self.process_none_test(inner)
            }

            ast::Expr::Select(subquery) => {
                // A subquery is its own unification scope; the enclosing
                // query's grouping state must not leak into it.
                let saved_prefixes = std::mem::take(&mut self.group_prefixes);
                let result = self.transform_select(subquery);
                self.group_prefixes = saved_prefixes;
                result
            }
        }
    }

    fn resolve_concept_operand(&self, expr: &ast::Expr) -> TransformResult<FullName> {
        let ast::Expr::Path(path) = expr else {
            return Err(TransformError::reference(
                "type check expects a concept name on the right",
            ));
        };
        let [ast::PathStep::Root { name }] = path.steps.as_slice() else {
            return Err(TransformError::reference(
                "type check expects a bare concept name, not a navigation",
            ));
        };
        let concept = self.schema.resolve(name, &self.module_aliases)?;
        self.schema.get_concept(&concept)?;
        Ok(concept)
    }

    pub fn process_path(&mut self, loc: Location, path: &ast::PathNode) -> TransformResult<NodeId> {
        let mut steps = path.steps.iter();
        let Some(ast::PathStep::Root { name }) = steps.next() else {
            return Err(TransformError::reference(
                "a path must begin with a concept or anchor step",
            ));
        };

        let (concept, anchor) = match self.anchors.get(name) {
            Some(concept) => (concept.clone(), Some(name.clone())),
            None => {
                let resolved = self.schema.resolve(name, &self.module_aliases)?;
                self.schema.get_concept(&resolved).map_err(|_| {
                    TransformError::reference(format!("'{name}' is neither a concept nor an anchor"))
                })?;
                (resolved, None)
            }
        };

        let id = LinearPath::from_origin(concept.clone());
        let mut current = self.graph.new_entity_set(concept, id, anchor);
        let mut leaf: Option<NodeId> = None;

        for step in steps {
            if leaf.is_some() {
                return Err(TransformError::reference(
                    "cannot navigate past an atomic value",
                ));
            }
            match step {
                ast::PathStep::Link { name, direction } => {
                    let link_name = self.schema.resolve(name, &self.module_aliases)?;
                    let link_def = self.schema.get_link(&link_name)?.clone();
                    let cur_concept = self
                        .graph
                        .entity_set(current)
                        .map(|s| s.concept.clone())
                        .expect("path cursor is a set");

                    match direction {
                        Direction::Outbound => {
                            if self.schema.get_attr(&cur_concept, &link_name).is_none() {
                                return Err(TransformError::reference(format!(
                                    "concept '{cur_concept}' has no link '{link_name}'"
                                )));
                            }
                            match &link_def.target {
                                crate::concept_catalog::PointerTarget::Atom(atom) => {
                                    let base = self
                                        .graph
                                        .entity_set(current)
                                        .map(|s| s.id.clone())
                                        .expect("path cursor is a set");
                                    let id = base.extended(
                                        [link_name.clone()].into_iter().collect(),
                                        Direction::Outbound,
                                        Some(atom.clone()),
                                    );
                                    let aref = self.graph.alloc(GirNode::AtomicRefSimple(
                                        AtomicRefSimple {
                                            ref_id: current,
                                            name: link_name,
                                            id: Some(id),
                                        },
                                    ));
                                    self.register_atom_ref(current, aref);
                                    leaf = Some(aref);
                                }
                                crate::concept_catalog::PointerTarget::Concept(target) => {
                                    current = self.extend_entity_path(
                                        current,
                                        link_name,
                                        Direction::Outbound,
                                        target.clone(),
                                        loc,
                                    );
                                }
                            }
                        }
                        Direction::Inbound => {
                            let points_here = match &link_def.target {
                                crate::concept_catalog::PointerTarget::Concept(target) => {
                                    self.schema.issubclass(&cur_concept, target)
                                        || self.schema.issubclass(target, &cur_concept)
                                }
                                crate::concept_catalog::PointerTarget::Atom(_) => false,
                            };
                            if !points_here {
                                return Err(TransformError::reference(format!(
                                    "link '{link_name}' does not point at concept '{cur_concept}'"
                                )));
                            }
                            current = self.extend_entity_path(
                                current,
                                link_name,
                                Direction::Inbound,
                                link_def.source.clone(),
                                loc,
                            );
                        }
                    }
                }

                ast::PathStep::LinkProp { name } => {
                    let link_id = self
                        .graph
                        .entity_set(current)
                        .and_then(|s| s.rlink)
                        .ok_or_else(|| {
                            TransformError::reference(
                                "link property access requires a preceding link step",
                            )
                        })?;
                    let prop_name = self.schema.resolve(name, &self.module_aliases)?;
                    let link_proto = self
                        .graph
                        .entity_link(link_id)
                        .map(|l| l.link_proto.clone())
                        .expect("rlink is a link");
                    let link_def = self.schema.get_link(&link_proto)?;
                    let Some(prop_atom) = link_def.properties.get(&prop_name).cloned() else {
                        return Err(TransformError::reference(format!(
                            "link '{link_proto}' has no property '{prop_name}'"
                        )));
                    };

                    let id = self.graph.path_id_of(link_id).map(|base| {
                        base.extended(
                            [prop_name.clone()].into_iter().collect(),
                            Direction::Outbound,
                            Some(prop_atom),
                        )
                    });
                    let pref = self
                        .graph
                        .alloc(GirNode::LinkPropRefSimple(LinkPropRefSimple {
                            ref_id: link_id,
                            name: prop_name,
                            id,
                        }));
                    if let Some(link) = self.graph.entity_link_mut(link_id) {
                        link.proprefs.insert(pref);
                    }
                    leaf = Some(pref);
                }

                ast::PathStep::Meta { name } => {
                    let base = self
                        .graph
                        .entity_set(current)
                        .map(|s| s.id.clone())
                        .expect("path cursor is a set");
                    let id = base.extended(
                        [FullName::std(name.clone())].into_iter().collect(),
                        Direction::Outbound,
                        None,
                    );
                    let mref = self.graph.alloc(GirNode::MetaRef(MetaRef {
                        ref_id: current,
                        name: name.clone(),
                        id: Some(id),
                    }));
                    self.register_meta_ref(current, mref);
                    leaf = Some(mref);
                }

                ast::PathStep::Root { name } => {
                    return Err(TransformError::reference(format!(
                        "unexpected root step '{name}' in the middle of a path"
                    )));
                }
            }
        }

        if let Some(anchor) = &path.anchor {
            if leaf.is_none() {
                let concept = self
                    .graph
                    .entity_set(current)
                    .map(|s| s.concept.clone())
                    .expect("path cursor is a set");
                if let Some(set) = self.graph.entity_set_mut(current) {
                    set.anchor = Some(anchor.clone());
                }
                self.anchors.insert(anchor.clone(), concept);
            }
        }

        self.add_path_user(current, loc.tag());
        Ok(leaf.unwrap_or(current))
    }

    /// Append one link traversal: a new edge from `current` and a new
    /// entity set at its far end, the edge held in the source's
    /// disjunction until roles are fixed up.
    fn extend_entity_path(
        &mut self,
        current: NodeId,
        link_name: FullName,
        direction: Direction,
        target_concept: FullName,
        loc: Location,
    ) -> NodeId {
        let base = self
            .graph
            .entity_set(current)
            .map(|s| s.id.clone())
            .expect("path cursor is a set");
        let labels: BTreeSet<FullName> = [link_name.clone()].into_iter().collect();
        let new_id = base.extended(labels.clone(), direction, Some(target_concept.clone()));

        let link = self.graph.alloc(GirNode::EntityLink(crate::gir::EntityLink {
            source: Some(current),
            target: None,
            link_proto: link_name,
            filter: Some(LinkFilter { labels, direction }),
            propfilter: None,
            proprefs: BTreeSet::new(),
            users: [loc.tag().to_string()].into_iter().collect(),
            anchor: None,
        }));
        let target = self.graph.new_entity_set(target_concept, new_id, None);
        if let Some(l) = self.graph.entity_link_mut(link) {
            l.target = Some(target);
        }
        if let Some(t) = self.graph.entity_set_mut(target) {
            t.rlink = Some(link);
            t.users.insert(loc.tag().to_string());
        }
        let disjunction = self
            .graph
            .entity_set(current)
            .map(|s| s.disjunction)
            .expect("path cursor is a set");
        if let Some(paths) = self.graph.combination_paths_mut(disjunction) {
            paths.insert(link);
        }
        target
    }
}

fn lower_literal(literal: &ast::LiteralValue) -> Value {
    match literal {
        ast::LiteralValue::Bool(b) => Value::Bool(*b),
        ast::LiteralValue::Int(i) => Value::Int(*i),
        ast::LiteralValue::Float(f) => Value::Float(*f),
        ast::LiteralValue::Str(s) => Value::Str(s.clone()),
        ast::LiteralValue::List(items) => Value::List(items.iter().map(lower_literal).collect()),
        ast::LiteralValue::Null => Value::Null,
    }
}

// ----------------------------------------------------------------------
// Surface-tree-only helpers
// ----------------------------------------------------------------------

/// Rewrite a surface tree with every resolvable name fully qualified.
/// Names that do not resolve (anchors, unknown identifiers) are left
/// untouched.
pub fn normalize_query_refs(
    query: &ast::SelectQuery,
    schema: &Schema,
    aliases: &BTreeMap<String, String>,
) -> TransformResult<ast::SelectQuery> {
    let mut out = query.clone();
    if let Some(w) = &mut out.where_clause {
        normalize_expr_refs(w, schema, aliases);
    }
    for item in &mut out.selector {
        normalize_expr_refs(&mut item.expr, schema, aliases);
    }
    for expr in &mut out.grouper {
        normalize_expr_refs(expr, schema, aliases);
    }
    for item in &mut out.sorter {
        normalize_expr_refs(&mut item.expr, schema, aliases);
    }
    Ok(out)
}

fn normalize_name(raw: &mut String, schema: &Schema, aliases: &BTreeMap<String, String>) {
    if let Ok(resolved) = schema.resolve(raw, aliases) {
        if schema.get(&resolved).is_ok() {
            *raw = resolved.to_string();
        }
    }
}

fn normalize_expr_refs(expr: &mut ast::Expr, schema: &Schema, aliases: &BTreeMap<String, String>) {
    match expr {
        ast::Expr::Path(path) => {
            for step in &mut path.steps {
                match step {
                    ast::PathStep::Root { name } => normalize_name(name, schema, aliases),
                    ast::PathStep::Link { name, .. } => normalize_name(name, schema, aliases),
                    ast::PathStep::LinkProp { name } => normalize_name(name, schema, aliases),
                    ast::PathStep::Meta { .. } => {}
                }
            }
        }
        ast::Expr::BinOp(b) => {
            normalize_expr_refs(&mut b.left, schema, aliases);
            normalize_expr_refs(&mut b.right, schema, aliases);
        }
        ast::Expr::UnaryOp(u) => normalize_expr_refs(&mut u.expr, schema, aliases),
        ast::Expr::Constant(_) => {}
        ast::Expr::FunctionCall(f) => {
            for arg in &mut f.args {
                normalize_expr_refs(arg, schema, aliases);
            }
        }
        ast::Expr::Sequence(s) => {
            for element in &mut s.elements {
                normalize_expr_refs(element, schema, aliases);
            }
        }
        ast::Expr::Record(r) => {
            normalize_name(&mut r.concept, schema, aliases);
            for element in &mut r.elements {
                normalize_expr_refs(element, schema, aliases);
            }
        }
        ast::Expr::TypeCast(c) => {
            normalize_name(&mut c.target, schema, aliases);
            normalize_expr_refs(&mut c.expr, schema, aliases);
        }
        ast::Expr::NoneTest(n) => normalize_expr_refs(&mut n.expr, schema, aliases),
        ast::Expr::Select(sub) => {
            if let Ok(normalized) = normalize_query_refs(sub, schema, aliases) {
                **sub = normalized;
            }
        }
    }
}

/// Collect the unique concepts and link prototypes a surface tree
/// references, subqueries included.
pub fn collect_node_references(
    query: &ast::SelectQuery,
    schema: &Schema,
    aliases: &BTreeMap<String, String>,
) -> TransformResult<BTreeSet<FullName>> {
    let mut refs = BTreeSet::new();
    if let Some(w) = &query.where_clause {
        collect_expr_references(w, schema, aliases, &mut refs);
    }
    for item in &query.selector {
        collect_expr_references(&item.expr, schema, aliases, &mut refs);
    }
    for expr in &query.grouper {
        collect_expr_references(expr, schema, aliases, &mut refs);
    }
    for item in &query.sorter {
        collect_expr_references(&item.expr, schema, aliases, &mut refs);
    }
    Ok(refs)
}

fn collect_expr_references(
    expr: &ast::Expr,
    schema: &Schema,
    aliases: &BTreeMap<String, String>,
    refs: &mut BTreeSet<FullName>,
) {
    match expr {
        ast::Expr::Path(path) => {
            for step in &path.steps {
                match step {
                    ast::PathStep::Root { name } => {
                        if let Ok(resolved) = schema.resolve(name, aliases) {
                            if schema.get_concept(&resolved).is_ok() {
                                refs.insert(resolved);
                            }
                        }
                    }
                    ast::PathStep::Link { name, .. } => {
                        if let Ok(resolved) = schema.resolve(name, aliases) {
                            if schema.get_link(&resolved).is_ok() {
                                refs.insert(resolved);
                            }
                        }
                    }
                    ast::PathStep::LinkProp { .. } | ast::PathStep::Meta { .. } => {}
                }
            }
        }
        ast::Expr::BinOp(b) => {
            collect_expr_references(&b.left, schema, aliases, refs);
            collect_expr_references(&b.right, schema, aliases, refs);
        }
        ast::Expr::UnaryOp(u) => collect_expr_references(&u.expr, schema, aliases, refs),
        ast::Expr::Constant(_) => {}
        ast::Expr::FunctionCall(f) => {
            for arg in &f.args {
                collect_expr_references(arg, schema, aliases, refs);
            }
        }
        ast::Expr::Sequence(s) => {
            for element in &s.elements {
                collect_expr_references(element, schema, aliases, refs);
            }
        }
        ast::Expr::Record(r) => {
            for element in &r.elements {
                collect_expr_references(element, schema, aliases, refs);
            }
        }
        ast::Expr::TypeCast(c) => collect_expr_references(&c.expr, schema, aliases, refs),
        ast::Expr::NoneTest(n) => collect_expr_references(&n.expr, schema, aliases, refs),
        ast::Expr::Select(sub) => {
            if let Ok(sub_refs) = collect_node_references(sub, schema, aliases) {
                refs.extend(sub_refs);
            }
        }
    }
}
