//! Binary-operation lowering and the specialized rewrites around it:
//! concept joins, type checks, constant id filters, search predicates,
//! constant folding, unary and null-test wrapping, sequence folding.
//!
//! The driver tries the operands in source order first; a shape it does not
//! recognize is reported with an "unhandled" sentinel rather than an error,
//! and the driver retries with the operands swapped before giving up.

use std::collections::{BTreeMap, BTreeSet};

use crate::concept_catalog::names::ID_POINTER;
use crate::concept_catalog::FullName;
use crate::gir::{
    AtomicRefSimple, Constant, GirNode, LinearPath, NodeId, NoneTest, RefExpr, Sequence, UnaryOp,
    Value,
};
use crate::ops::{Direction, Op, UnaryOperator};

use super::errors::{TransformError, TransformResult};
use super::{ExtractOpts, Location, Transformer};

/// Which reference family an atomic disjunction is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefKind {
    Atomic,
    LinkProp,
}

impl<'a> Transformer<'a> {
    // ------------------------------------------------------------------
    // Node construction helpers
    // ------------------------------------------------------------------

    /// Allocate a binary operation, restoring the source operand order
    /// when processing happened reversed.
    pub(crate) fn new_binop_node(
        &mut self,
        left: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
    ) -> NodeId {
        let (left, right) = if reversed { (right, left) } else { (left, right) };
        self.graph.alloc(GirNode::BinOp(crate::gir::BinOp {
            left,
            op,
            right,
            aggregates: false,
        }))
    }

    fn derive_ref_expr(&self, expr: NodeId, kind: RefKind) -> (Option<NodeId>, Option<LinearPath>) {
        let matching = self.graph.collect_matching(expr, |g, id| match kind {
            RefKind::Atomic => matches!(g.node(id), GirNode::AtomicRefSimple(_) | GirNode::MetaRef(_)),
            RefKind::LinkProp => matches!(g.node(id), GirNode::LinkPropRefSimple(_)),
        });
        let owners: BTreeSet<NodeId> = matching
            .iter()
            .filter_map(|id| self.graph.ref_of(*id))
            .collect();
        let ref_id = if owners.len() == 1 {
            owners.into_iter().next()
        } else {
            None
        };
        let id = matching.first().and_then(|m| self.graph.path_id_of(*m));
        (ref_id, id)
    }

    /// Wrap an expression whose net value is atomic, deriving the owning
    /// entity set from the atomic references inside it.
    pub(crate) fn make_atomic_ref_expr(&mut self, expr: NodeId) -> NodeId {
        let (ref_id, id) = self.derive_ref_expr(expr, RefKind::Atomic);
        self.graph
            .alloc(GirNode::AtomicRefExpr(RefExpr { expr, ref_id, id }))
    }

    /// Symmetric wrapper for link-property expressions.
    pub(crate) fn make_link_prop_ref_expr(&mut self, expr: NodeId) -> NodeId {
        let (ref_id, id) = self.derive_ref_expr(expr, RefKind::LinkProp);
        self.graph
            .alloc(GirNode::LinkPropRefExpr(RefExpr { expr, ref_id, id }))
    }

    // ------------------------------------------------------------------
    // Atomic disjunction classification
    // ------------------------------------------------------------------

    /// Check that every member of a path disjunction is a reference of the
    /// given family, and key them by owner path identity. Non-references
    /// (entities do not coerce to literals) yield `None`. A duplicate key
    /// is reported and the last occurrence kept.
    pub(crate) fn check_atomic_disjunction(
        &self,
        expr: NodeId,
        kind: RefKind,
    ) -> Option<BTreeMap<LinearPath, NodeId>> {
        let mut dict = BTreeMap::new();
        for member in self.graph.combination_paths(expr)? {
            let matches_kind = match kind {
                RefKind::Atomic => self.graph.is_atomic_ref(*member),
                RefKind::LinkProp => self.graph.is_link_prop_ref(*member),
            };
            if !matches_kind {
                return None;
            }
            let key = match kind {
                RefKind::Atomic => {
                    let owner = self.graph.ref_of(*member)?;
                    self.graph.path_id_of(owner)?
                }
                RefKind::LinkProp => self.graph.path_id_of(*member)?,
            };
            if dict.contains_key(&key) {
                log::warn!("duplicate path '{key}' in atomic disjunction, keeping the last occurrence");
            }
            dict.insert(key, *member);
        }
        if dict.is_empty() {
            None
        } else {
            Some(dict)
        }
    }

    // ------------------------------------------------------------------
    // Binary operations
    // ------------------------------------------------------------------

    /// Lower a binary operation, trying the source operand order first and
    /// the swapped order when the first attempt does not recognize the
    /// shape.
    pub fn process_binop(
        &mut self,
        left: NodeId,
        right: NodeId,
        op: Op,
        loc: Location,
    ) -> TransformResult<NodeId> {
        if let Some(result) = self.binop_once(left, right, op, false, loc)? {
            return Ok(result);
        }
        if let Some(result) = self.binop_once(right, left, op, true, loc)? {
            return Ok(result);
        }
        Err(TransformError::tree(format!(
            "unexpected operands for '{op}': {} and {}",
            self.graph.node(left).kind_name(),
            self.graph.node(right).kind_name()
        )))
    }

    fn is_join(&self, left: NodeId, right: NodeId, op: Op) -> bool {
        self.graph.is_path(left) && self.graph.is_path(right) && matches!(op, Op::Eq | Op::Ne)
    }

    fn is_const_idfilter(&self, left: NodeId, right: NodeId, op: Op, reversed: bool) -> bool {
        self.graph.is_path(left)
            && self.graph.is_constant(right)
            && (op.is_membership() || (!reversed && matches!(op, Op::Eq | Op::Ne)))
    }

    fn binop_once(
        &mut self,
        left: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
        loc: Location,
    ) -> TransformResult<Option<NodeId>> {
        let opts = ExtractOpts::new().reverse(false).resolve_arefs(false);
        let left_paths = self.extract_paths(left, opts, loc)?;

        if let Some(left_paths) = left_paths {
            let left_exprs = self.get_multipath(left_paths);
            let pathdict = self.check_atomic_disjunction(left_exprs, RefKind::Atomic);
            let proppathdict = self.check_atomic_disjunction(left_exprs, RefKind::LinkProp);

            if self.is_aggregated_expr(left, true) || self.is_aggregated_expr(right, true) {
                // Aggregates stay as plain operations; no folding into
                // inline filters may happen across an aggregate boundary.
                return Ok(Some(self.new_binop_node(left, right, op, reversed)));
            }

            if pathdict.is_none() && proppathdict.is_none() {
                if self.is_join(left, right, op) {
                    return Ok(Some(self.lower_join(left_exprs, right, op, reversed)?));
                }
                if self.is_const_idfilter(left, right, op, reversed) {
                    return Ok(Some(self.lower_idfilter(left_exprs, right, op, reversed)?));
                }
                if op == Op::Search {
                    return Ok(Some(self.lower_search(left_exprs, right, op, reversed)?));
                }
                return Ok(Some(self.new_binop_node(left, right, op, reversed)));
            }

            let right_paths = self.extract_paths(right, opts, loc)?;

            if self.graph.is_constant(right) {
                return Ok(Some(self.fold_refs_with_constant(
                    left,
                    left_exprs,
                    right,
                    op,
                    reversed,
                    &pathdict,
                    &proppathdict,
                )?));
            }

            if let Some(right_paths) = right_paths {
                let right_exprs = self.get_multipath(right_paths);
                let rightdict = self.check_atomic_disjunction(right_exprs, RefKind::Atomic);
                let rightpropdict = self.check_atomic_disjunction(right_exprs, RefKind::LinkProp);

                let both_atomic = rightdict.is_some() && pathdict.is_some();
                let both_prop = rightpropdict.is_some() && proppathdict.is_some();
                if both_atomic || both_prop {
                    let (kind, leftdict, rightdict) = if both_prop {
                        (
                            RefKind::LinkProp,
                            proppathdict.as_ref().expect("both_prop"),
                            rightpropdict.as_ref().expect("both_prop"),
                        )
                    } else {
                        (
                            RefKind::Atomic,
                            pathdict.as_ref().expect("both_atomic"),
                            rightdict.as_ref().expect("both_atomic"),
                        )
                    };
                    return Ok(Some(self.fold_ref_pair(
                        left, left_exprs, right, right_exprs, op, reversed, kind, leftdict,
                        rightdict,
                    )?));
                }
                return Ok(Some(self.new_binop_node(left, right, op, reversed)));
            }

            if let GirNode::BinOp(right_binop) = self.graph.node(right).clone() {
                if right_binop.op == op && self.graph.is_path(left) && proppathdict.is_none() {
                    if let Some(pathdict) = &pathdict {
                        return Ok(Some(self.fold_associative(
                            left,
                            right,
                            &right_binop,
                            op,
                            reversed,
                            pathdict,
                        )?));
                    }
                }
            }
            return Ok(None);
        }

        if self.graph.is_constant(left) {
            if self.graph.is_constant(right) {
                return Ok(Some(self.fold_constants(left, right, op, reversed)?));
            }
            return Ok(None);
        }

        if matches!(
            self.graph.node(left),
            GirNode::BinOp(_) | GirNode::TypeCast(_) | GirNode::FunctionCall(_)
        ) {
            return Ok(Some(self.new_binop_node(left, right, op, reversed)));
        }

        Ok(None)
    }

    /// Concept join: `<path> {=|!=} <path>` becomes a comparison of the
    /// builtin id refs of both sides, with the `joins`/`backrefs` sets
    /// cross-linked for later emission.
    fn lower_join(
        &mut self,
        left_exprs: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
    ) -> TransformResult<NodeId> {
        let right_exprs = self.get_multipath(right);

        let left_members = self.paths_of(left_exprs);
        let right_members = self.paths_of(right_exprs);

        let mut lrefs = BTreeSet::new();
        for member in &left_members {
            lrefs.insert(self.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
                ref_id: *member,
                name: ID_POINTER.clone(),
                id: None,
            })));
        }
        let mut rrefs = BTreeSet::new();
        for member in &right_members {
            rrefs.insert(self.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
                ref_id: *member,
                name: ID_POINTER.clone(),
                id: None,
            })));
        }

        let l = self.graph.new_disjunction(lrefs);
        let r = self.graph.new_disjunction(rrefs);
        let result = self.new_binop_node(l, r, op, reversed);

        for lset in &left_members {
            for rset in &right_members {
                if let Some(set) = self.graph.entity_set_mut(*lset) {
                    set.joins.insert(*rset);
                    set.backrefs.insert(*rset);
                }
                if let Some(set) = self.graph.entity_set_mut(*rset) {
                    set.joins.insert(*lset);
                    set.backrefs.insert(*lset);
                }
            }
        }
        Ok(result)
    }

    /// Type check: `<path> IS [NOT] <concept>`. `IS` keeps the paths whose
    /// concept lies under the checked one; `IS NOT` narrows the concept
    /// membership through the subtype lattice instead of dropping paths.
    pub(crate) fn process_type_check(
        &mut self,
        left: NodeId,
        rhs: &FullName,
        op: Op,
        loc: Location,
    ) -> TransformResult<NodeId> {
        let opts = ExtractOpts::new().reverse(false).resolve_arefs(false);
        let left_paths = self.extract_paths(left, opts, loc)?.ok_or_else(|| {
            TransformError::tree(format!("type check '{op}' over an expression without paths"))
        })?;
        let left_exprs = self.get_multipath(left_paths);

        let mut kept = BTreeSet::new();
        for path in self.paths_of(left_exprs) {
            let Some(set) = self.graph.entity_set(path) else {
                continue;
            };
            let concept = set.concept.clone();
            match op {
                Op::Is => {
                    // Statically satisfiable checks keep the path with its
                    // identity intact: either the path's concept already
                    // lies under the checked one, or the checked concept
                    // narrows it.
                    if self.schema.issubclass(&concept, rhs) || self.schema.issubclass(rhs, &concept)
                    {
                        kept.insert(path);
                    }
                }
                Op::IsNot => {
                    if concept != *rhs {
                        let filtered = self.schema.filter_children(&concept, |c| c != rhs);
                        if !filtered.is_empty() {
                            if let Some(set) = self.graph.entity_set_mut(path) {
                                set.conceptfilter = filtered;
                            }
                        }
                        kept.insert(path);
                    }
                }
                _ => {
                    return Err(TransformError::tree(format!(
                        "'{op}' is not a type check operator"
                    )))
                }
            }
        }
        Ok(self.path_from_set(kept))
    }

    /// Constant id filter: `<path> IN <consts>`, `<path> = <const>` and the
    /// reversed membership `<const> IN <path>`, which reads as an identity
    /// check against the path's builtin id.
    fn lower_idfilter(
        &mut self,
        left_exprs: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
    ) -> TransformResult<NodeId> {
        let membership_op = if reversed {
            if op == Op::In {
                Op::Eq
            } else {
                Op::Ne
            }
        } else {
            op
        };

        let mut paths = BTreeSet::new();
        for member in self.paths_of(left_exprs) {
            let id_ref = self.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
                ref_id: member,
                name: ID_POINTER.clone(),
                id: None,
            }));
            let expr = self.graph.alloc(GirNode::BinOp(crate::gir::BinOp {
                left: id_ref,
                op: membership_op,
                right,
                aggregates: false,
            }));
            paths.insert(self.make_atomic_ref_expr(expr));
        }
        Ok(self.path_from_set(paths))
    }

    /// Search predicate over each path's searchable links.
    fn lower_search(
        &mut self,
        left_exprs: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
    ) -> TransformResult<NodeId> {
        let mut paths = BTreeSet::new();
        for member in self.paths_of(left_exprs) {
            let concept = self
                .graph
                .entity_set(member)
                .map(|s| s.concept.clone())
                .ok_or_else(|| TransformError::tree("search predicate over a non-entity path"))?;
            if self.schema.get_searchable_links(&concept).is_empty() {
                return Err(TransformError::SearchConfiguration {
                    operation: op.to_string(),
                    concept: concept.to_string(),
                    hint: format!("configure search for '{concept}'"),
                });
            }
            // A search over an entity set is always an inline filter.
            let expr = self.new_binop_node(member, right, op, reversed);
            paths.insert(self.make_atomic_ref_expr(expr));
        }
        Ok(self.path_from_set(paths))
    }

    /// Distribute `ref op const` over every atomic ref on the left, unless
    /// the operator is boolean: boolean expressions must not be inlined
    /// past their original operation boundary.
    #[allow(clippy::too_many_arguments)]
    fn fold_refs_with_constant(
        &mut self,
        left: NodeId,
        left_exprs: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
        pathdict: &Option<BTreeMap<LinearPath, NodeId>>,
        proppathdict: &Option<BTreeMap<LinearPath, NodeId>>,
    ) -> TransformResult<NodeId> {
        let kind = if proppathdict.is_some() {
            RefKind::LinkProp
        } else {
            RefKind::Atomic
        };
        let refdict_len = proppathdict
            .as_ref()
            .or(pathdict.as_ref())
            .map(|d| d.len())
            .unwrap_or(0);

        if self.graph.is_path(left) {
            // Only paths may be broken apart; refs inside other expressions
            // stay where they are.
            let mut paths = BTreeSet::new();
            for member in self.paths_of(left_exprs) {
                let is_expr_ref = match kind {
                    RefKind::Atomic => {
                        matches!(self.graph.node(member), GirNode::AtomicRefExpr(_))
                    }
                    RefKind::LinkProp => {
                        matches!(self.graph.node(member), GirNode::LinkPropRefExpr(_))
                    }
                };
                if is_expr_ref && op.is_boolean() {
                    return Ok(self.new_binop_node(left, right, op, reversed));
                }
                let folded = self.new_binop_node(member, right, op, reversed);
                let wrapped = match kind {
                    RefKind::Atomic => self.make_atomic_ref_expr(folded),
                    RefKind::LinkProp => self.make_link_prop_ref_expr(folded),
                };
                paths.insert(wrapped);
            }
            return Ok(self.path_from_set(paths));
        }

        if refdict_len == 1 {
            // A non-path expression whose atoms all belong to one entity.
            let folded = self.new_binop_node(left, right, op, reversed);
            return Ok(match kind {
                RefKind::Atomic => self.make_atomic_ref_expr(folded),
                RefKind::LinkProp => self.make_link_prop_ref_expr(folded),
            });
        }

        Ok(self.new_binop_node(left, right, op, reversed))
    }

    /// Both operands reference atoms. When the owning paths intersect, fold
    /// the comparison into a single expression ref over the shared owner,
    /// re-pointing the right side's refs at the canonical left node.
    #[allow(clippy::too_many_arguments)]
    fn fold_ref_pair(
        &mut self,
        left: NodeId,
        left_exprs: NodeId,
        right: NodeId,
        right_exprs: NodeId,
        op: Op,
        reversed: bool,
        kind: RefKind,
        leftdict: &BTreeMap<LinearPath, NodeId>,
        rightdict: &BTreeMap<LinearPath, NodeId>,
    ) -> TransformResult<NodeId> {
        if self.graph.is_path(left) && self.graph.is_path(right) {
            let mut paths = BTreeSet::new();
            for member in self.paths_of(left_exprs) {
                let left_key = match kind {
                    RefKind::Atomic => self
                        .graph
                        .ref_of(member)
                        .and_then(|owner| self.graph.path_id_of(owner)),
                    RefKind::LinkProp => self.graph.path_id_of(member),
                };
                let Some(left_key) = left_key else { continue };
                let Some(&right_expr) = rightdict.get(&left_key) else {
                    continue;
                };
                if let (Some(old_ref), Some(new_ref)) =
                    (self.graph.ref_of(right_expr), self.graph.ref_of(member))
                {
                    self.graph
                        .replace_refs_in_subtree(right_expr, &[old_ref], new_ref);
                }
                let folded = self.new_binop_node(member, right_expr, op, reversed);
                let wrapped = match kind {
                    RefKind::Atomic => self.make_atomic_ref_expr(folded),
                    RefKind::LinkProp => self.make_link_prop_ref_expr(folded),
                };
                paths.insert(wrapped);
            }
            return Ok(if paths.is_empty() {
                self.new_binop_node(left, right, op, reversed)
            } else {
                self.path_from_set(paths)
            });
        }

        if leftdict.len() == 1 && rightdict.len() == 1 {
            let left_key = leftdict.keys().next().expect("checked");
            let right_key = rightdict.keys().next().expect("checked");
            if left_key == right_key {
                // Both sides reference the same single path.
                let canonical = *leftdict.values().next().expect("checked");
                let target_ref = self.graph.ref_of(canonical);
                let old_refs: Vec<NodeId> = self
                    .paths_of(right_exprs)
                    .into_iter()
                    .filter_map(|p| self.graph.ref_of(p))
                    .collect();
                if let Some(target_ref) = target_ref {
                    self.graph
                        .replace_refs_in_subtree(right, &old_refs, target_ref);
                }
                let folded = self.new_binop_node(left, right, op, reversed);
                return Ok(match kind {
                    RefKind::Atomic => self.make_atomic_ref_expr(folded),
                    RefKind::LinkProp => self.make_link_prop_ref_expr(folded),
                });
            }
        }

        Ok(self.new_binop_node(left, right, op, reversed))
    }

    /// Operator associativity on the right: `a.x op (b op c)` where one of
    /// the inner operands shares its owner with a left-side ref folds that
    /// operand into the ref and keeps the other bare.
    fn fold_associative(
        &mut self,
        left: NodeId,
        right: NodeId,
        right_binop: &crate::gir::BinOp,
        op: Op,
        reversed: bool,
        pathdict: &BTreeMap<LinearPath, NodeId>,
    ) -> TransformResult<NodeId> {
        let mut folded_operand = None;
        for operand in [right_binop.left, right_binop.right] {
            if !self.graph.is_atomic_ref(operand) {
                continue;
            }
            let Some(owner_id) = self
                .graph
                .ref_of(operand)
                .and_then(|owner| self.graph.path_id_of(owner))
            else {
                continue;
            };
            let Some(&target) = pathdict.get(&owner_id) else {
                continue;
            };
            if let GirNode::AtomicRefExpr(target_expr) = self.graph.node(target).clone() {
                let extended = self.extend_binop(Some(target_expr.expr), operand, op, reversed);
                if let GirNode::AtomicRefExpr(t) = self.graph.node_mut(target) {
                    t.expr = extended;
                }
                folded_operand = Some(operand);
                break;
            }
        }

        Ok(match folded_operand {
            Some(folded) => {
                let other = if folded == right_binop.right {
                    right_binop.left
                } else {
                    right_binop.right
                };
                self.new_binop_node(left, other, op, reversed)
            }
            None => self.new_binop_node(left, right, op, reversed),
        })
    }

    // ------------------------------------------------------------------
    // Constant folding
    // ------------------------------------------------------------------

    fn fold_constants(
        &mut self,
        left: NodeId,
        right: NodeId,
        op: Op,
        reversed: bool,
    ) -> TransformResult<NodeId> {
        let (GirNode::Constant(lc), GirNode::Constant(rc)) =
            (self.graph.node(left).clone(), self.graph.node(right).clone())
        else {
            return Err(TransformError::tree("constant folding over non-constants"));
        };

        // Logical operand order, undoing the retry swap.
        let (first, second) = if reversed { (&rc, &lc) } else { (&lc, &rc) };

        let result_type = if first.type_.is_some() && first.type_ == second.type_ {
            first.type_.clone()
        } else {
            crate::concept_catalog::type_rules::result_type(
                op,
                first.type_.as_ref(),
                second.type_.as_ref(),
            )
        };

        if op.is_boolean() {
            let second_node = if reversed { left } else { right };
            if let Some(folded) = self.eval_const_bool(op, first.value.as_ref(), second_node) {
                return Ok(folded);
            }
        } else if let (Some(fv), Some(sv)) = (&first.value, &second.value) {
            if let Some(value) = eval_const_values(fv, op, sv) {
                let type_ = value.atom_type().or(result_type);
                return Ok(self.graph.alloc(GirNode::Constant(Constant {
                    value: Some(value),
                    expr: None,
                    type_,
                })));
            }
        }

        let expr = self.new_binop_node(left, right, op, reversed);
        Ok(self.graph.alloc(GirNode::Constant(Constant {
            value: None,
            expr: Some(expr),
            type_: result_type,
        })))
    }

    /// Boolean short-circuit over constants: the first operand decides, or
    /// the second operand is the answer.
    fn eval_const_bool(&mut self, op: Op, first: Option<&Value>, second: NodeId) -> Option<NodeId> {
        let first = first?.as_bool()?;
        let decided = match op {
            Op::And => (!first).then_some(false),
            Op::Or => first.then_some(true),
            _ => return None,
        };
        Some(match decided {
            Some(value) => self.graph.alloc(GirNode::Constant(Constant {
                value: Some(Value::Bool(value)),
                expr: None,
                type_: Some(FullName::std("bool")),
            })),
            None => second,
        })
    }
}

impl<'a> Transformer<'a> {
    // ------------------------------------------------------------------
    // Unary operations, null tests, function calls, sequences
    // ------------------------------------------------------------------

    /// Lower a unary operation, wrapping reference operands so they keep
    /// participating in filter folding.
    pub(crate) fn process_unaryop(
        &mut self,
        expr: NodeId,
        op: UnaryOperator,
        loc: Location,
    ) -> TransformResult<NodeId> {
        if self.graph.is_atomic_ref(expr) {
            let unary = self.graph.alloc(GirNode::UnaryOp(UnaryOp { op, expr }));
            return Ok(self.make_atomic_ref_expr(unary));
        }
        if self.graph.is_link_prop_ref(expr) {
            let unary = self.graph.alloc(GirNode::UnaryOp(UnaryOp { op, expr }));
            return Ok(self.make_link_prop_ref_expr(unary));
        }

        let opts = ExtractOpts::new().reverse(false).resolve_arefs(false);
        let paths = self.extract_paths(expr, opts, loc)?;
        if let Some(paths) = paths {
            let exprs = self.get_multipath(paths);
            let arefs = self.check_atomic_disjunction(exprs, RefKind::Atomic);
            let prefs = self.check_atomic_disjunction(exprs, RefKind::LinkProp);
            if arefs.map(|d| d.len()) == Some(1) {
                let unary = self.graph.alloc(GirNode::UnaryOp(UnaryOp { op, expr }));
                return Ok(self.make_atomic_ref_expr(unary));
            }
            if prefs.map(|d| d.len()) == Some(1) {
                let unary = self.graph.alloc(GirNode::UnaryOp(UnaryOp { op, expr }));
                return Ok(self.make_link_prop_ref_expr(unary));
            }
        }
        Ok(self.graph.alloc(GirNode::UnaryOp(UnaryOp { op, expr })))
    }

    /// Lower `<expr> IS NONE`-style tests.
    pub(crate) fn process_none_test(&mut self, expr: NodeId) -> TransformResult<NodeId> {
        let test = self.graph.alloc(GirNode::NoneTest(NoneTest { expr }));
        Ok(if self.graph.is_atomic_ref(expr) {
            self.make_atomic_ref_expr(test)
        } else if self.graph.is_link_prop_ref(expr) {
            self.make_link_prop_ref_expr(test)
        } else {
            test
        })
    }

    /// Post-process a lowered function call: search functions rewrite their
    /// entity argument to the concept's searchable atoms, `agg::*` marks
    /// the call aggregated, and an all-constant call folds to a constant.
    pub(crate) fn process_function_call(&mut self, call_id: NodeId) -> TransformResult<NodeId> {
        let call = match self.graph.node(call_id) {
            GirNode::FunctionCall(c) => c.clone(),
            other => {
                return Err(TransformError::tree(format!(
                    "expected a function call, found {}",
                    other.kind_name()
                )))
            }
        };

        if call.module.as_deref() == Some("search")
            && matches!(call.name.as_str(), "rank" | "headline")
        {
            let mut refs: BTreeSet<NodeId> = BTreeSet::new();
            for arg in &call.args {
                if self.graph.is_entity_set(*arg) {
                    refs.insert(*arg);
                } else {
                    refs.extend(
                        self.graph
                            .collect_matching(*arg, |g, id| g.is_entity_set(id)),
                    );
                }
            }
            if refs.len() != 1 {
                return Err(TransformError::tree(format!(
                    "{} expects exactly one entity reference argument",
                    call.full_name()
                )));
            }
            let ref_set = refs.into_iter().next().expect("checked");
            let (concept, base_id) = {
                let set = self
                    .graph
                    .entity_set(ref_set)
                    .ok_or_else(|| TransformError::tree("entity argument vanished"))?;
                (set.concept.clone(), set.id.clone())
            };

            let searchable: Vec<(FullName, Option<FullName>)> = self
                .schema
                .get_searchable_links(&concept)
                .into_iter()
                .map(|l| (l.name.clone(), Some(l.target.name().clone())))
                .collect();
            if searchable.is_empty() {
                return Err(TransformError::SearchConfiguration {
                    operation: call.full_name(),
                    concept: concept.to_string(),
                    hint: format!("configure search for '{concept}'"),
                });
            }

            let mut cols = Vec::new();
            for (link_name, target) in searchable {
                let id = base_id.extended(
                    [link_name.clone()].into_iter().collect(),
                    Direction::Outbound,
                    target,
                );
                cols.push(self.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
                    ref_id: ref_set,
                    name: link_name,
                    id: Some(id),
                })));
            }
            if let Some(set) = self.graph.entity_set_mut(ref_set) {
                set.atomrefs.extend(cols.iter().copied());
            }

            let query = *call.args.get(1).ok_or_else(|| {
                TransformError::tree(format!("{} is missing its query argument", call.full_name()))
            })?;
            let columns = self.graph.alloc(GirNode::Sequence(Sequence {
                elements: cols,
                aggregates: false,
            }));
            if let GirNode::FunctionCall(c) = self.graph.node_mut(call_id) {
                c.args = vec![columns, query];
            }
        } else if call.module.as_deref() == Some("agg") {
            if let GirNode::FunctionCall(c) = self.graph.node_mut(call_id) {
                c.aggregates = true;
            }
        }

        let args = match self.graph.node(call_id) {
            GirNode::FunctionCall(c) => c.args.clone(),
            _ => Vec::new(),
        };
        if !args.is_empty() && args.iter().all(|a| self.graph.is_constant(*a)) {
            let type_ = match self.graph.node(args[0]) {
                GirNode::Constant(c) => c.type_.clone(),
                _ => None,
            };
            return Ok(self.graph.alloc(GirNode::Constant(Constant {
                value: None,
                expr: Some(call_id),
                type_,
            })));
        }
        Ok(call_id)
    }

    /// Fold a sequence: all-constant sequences become a constant; a
    /// sequence of references to atoms of one shared node folds into a
    /// single expression ref over that node.
    pub(crate) fn process_sequence(&mut self, seq_id: NodeId) -> TransformResult<NodeId> {
        let elements = match self.graph.node(seq_id) {
            GirNode::Sequence(s) => s.elements.clone(),
            other => {
                return Err(TransformError::tree(format!(
                    "expected a sequence, found {}",
                    other.kind_name()
                )))
            }
        };

        let mut pathdict: BTreeMap<LinearPath, NodeId> = BTreeMap::new();
        let mut proppathdict: BTreeMap<LinearPath, NodeId> = BTreeMap::new();
        let mut elems: Vec<NodeId> = Vec::new();
        let mut all_const = true;

        for element in &elements {
            if self.graph.is_base_ref(*element) || self.graph.is_disjunction(*element) {
                let disjunction = if self.graph.is_disjunction(*element) {
                    if self.paths_of(*element).len() > 1 {
                        return Ok(seq_id);
                    }
                    *element
                } else {
                    self.graph
                        .new_disjunction([*element].into_iter().collect())
                };

                if let Some(pd) = self.check_atomic_disjunction(disjunction, RefKind::Atomic) {
                    pathdict.extend(pd);
                } else if let Some(pd) =
                    self.check_atomic_disjunction(disjunction, RefKind::LinkProp)
                {
                    proppathdict.extend(pd);
                } else {
                    return Ok(seq_id);
                }

                if !pathdict.is_empty() && !proppathdict.is_empty() {
                    return Ok(seq_id);
                }

                if let Some(first) = self.first_path_of(disjunction) {
                    elems.push(first);
                }
                all_const = false;
            } else if all_const && self.graph.is_constant(*element) {
                continue;
            } else {
                // Not a sequence of plain atoms; leave it alone.
                return Ok(seq_id);
            }
        }

        if all_const {
            return Ok(self.graph.alloc(GirNode::Constant(Constant {
                value: None,
                expr: Some(seq_id),
                type_: None,
            })));
        }

        let (canonical, is_prop) = if pathdict.len() == 1 {
            (*pathdict.values().next().expect("checked"), false)
        } else if proppathdict.len() == 1 {
            (*proppathdict.values().next().expect("checked"), true)
        } else {
            return Ok(seq_id);
        };

        let canonical_ref = self.graph.ref_of(canonical);
        for elem in &elems {
            let elem_ref = self.graph.ref_of(*elem);
            if let (Some(old), Some(new)) = (elem_ref, canonical_ref) {
                if old != new {
                    self.graph.replace_refs_in_subtree(*elem, &[old], new);
                }
            }
        }

        let folded = self.graph.alloc(GirNode::Sequence(Sequence {
            elements: elems,
            aggregates: false,
        }));
        Ok(if is_prop {
            self.make_link_prop_ref_expr(folded)
        } else {
            self.make_atomic_ref_expr(folded)
        })
    }

    fn first_path_of(&self, combination: NodeId) -> Option<NodeId> {
        self.graph
            .combination_paths(combination)
            .and_then(|p| p.iter().next().copied())
    }

    /// Convert an entity reference (a set or a disjunction of sets of one
    /// concept) to its builtin-id atomic ref, or with `full_record` to a
    /// record of all atomic pointers plus the id meta ref.
    pub fn entityref_to_idref(
        &mut self,
        expr: NodeId,
        full_record: bool,
    ) -> TransformResult<NodeId> {
        let members: BTreeSet<NodeId> = if self.graph.is_combination(expr) {
            self.paths_of(expr)
        } else {
            [expr].into_iter().collect()
        };
        let Some(first) = members.iter().next().copied() else {
            return Ok(expr);
        };
        if !self.graph.is_entity_set(first) {
            return Ok(expr);
        }

        let concepts: BTreeSet<FullName> = members
            .iter()
            .filter_map(|m| self.graph.entity_set(*m).map(|s| s.concept.clone()))
            .collect();
        if concepts.len() != 1 {
            return Err(TransformError::tree(
                "entity reference over mixed concepts cannot be converted to an id reference",
            ));
        }
        let concept = concepts.into_iter().next().expect("checked");
        let base_id = self
            .graph
            .entity_set(first)
            .map(|s| s.id.clone())
            .expect("entity member");
        let ref_node = if members.len() == 1 { first } else { expr };

        if full_record {
            let pointers: Vec<(FullName, FullName)> = self
                .schema
                .pointers(&concept)
                .into_iter()
                .filter(|(_, link)| link.atomic())
                .map(|(name, link)| (name, link.target.name().clone()))
                .collect();

            let mut elements = Vec::new();
            for (name, target) in pointers {
                let id = base_id.extended(
                    [name.clone()].into_iter().collect(),
                    Direction::Outbound,
                    Some(target),
                );
                elements.push(self.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
                    ref_id: ref_node,
                    name,
                    id: Some(id),
                })));
            }
            let metaref = self.graph.alloc(GirNode::MetaRef(crate::gir::MetaRef {
                ref_id: ref_node,
                name: "id".to_string(),
                id: Some(base_id),
            }));

            for member in &members {
                if let Some(set) = self.graph.entity_set_mut(*member) {
                    set.atomrefs.extend(elements.iter().copied());
                    set.metarefs.insert(metaref);
                }
            }
            elements.push(metaref);
            Ok(self.graph.alloc(GirNode::Record(crate::gir::Record {
                elements,
                concept,
                aggregates: false,
            })))
        } else {
            let id_link = self
                .schema
                .get_link(&ID_POINTER)
                .map(|l| l.target.name().clone())?;
            let id = base_id.extended(
                [ID_POINTER.clone()].into_iter().collect(),
                Direction::Outbound,
                Some(id_link),
            );
            let idref = self.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
                ref_id: ref_node,
                name: ID_POINTER.clone(),
                id: Some(id),
            }));
            for member in &members {
                if let Some(set) = self.graph.entity_set_mut(*member) {
                    set.atomrefs.insert(idref);
                }
            }
            Ok(idref)
        }
    }
}

/// Evaluate `first op second` over literal values. `None` leaves the
/// expression symbolic (unknown operator, type mismatch, overflow,
/// division by zero).
pub(crate) fn eval_const_values(first: &Value, op: Op, second: &Value) -> Option<Value> {
    use Value::*;
    match op {
        Op::Eq => Some(Bool(first == second)),
        Op::Ne => Some(Bool(first != second)),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            let ordering = compare_values(first, second)?;
            let result = match op {
                Op::Lt => ordering.is_lt(),
                Op::Le => ordering.is_le(),
                Op::Gt => ordering.is_gt(),
                Op::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Some(Bool(result))
        }
        Op::In | Op::NotIn => {
            let List(items) = second else { return None };
            let contained = items.contains(first);
            Some(Bool(if op == Op::In { contained } else { !contained }))
        }
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => match (first, second) {
            (Int(a), Int(b)) => match op {
                Op::Add => a.checked_add(*b).map(Int),
                Op::Sub => a.checked_sub(*b).map(Int),
                Op::Mul => a.checked_mul(*b).map(Int),
                Op::Div => a.checked_div(*b).map(Int),
                Op::Mod => a.checked_rem(*b).map(Int),
                _ => unreachable!(),
            },
            (Float(a), Float(b)) => eval_float(*a, op, *b),
            (Int(a), Float(b)) => eval_float(*a as f64, op, *b),
            (Float(a), Int(b)) => eval_float(*a, op, *b as f64),
            (Str(a), Str(b)) if op == Op::Add => Some(Str(format!("{a}{b}"))),
            _ => None,
        },
        _ => None,
    }
}

fn eval_float(a: f64, op: Op, b: f64) -> Option<Value> {
    let result = match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => {
            if b == 0.0 {
                return None;
            }
            a / b
        }
        Op::Mod => {
            if b == 0.0 {
                return None;
            }
            a % b
        }
        _ => return None,
    };
    Some(Value::Float(result))
}

fn compare_values(first: &Value, second: &Value) -> Option<std::cmp::Ordering> {
    use Value::*;
    match (first, second) {
        (Int(a), Int(b)) => Some(a.cmp(b)),
        (Float(a), Float(b)) => a.partial_cmp(b),
        (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
        (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (Str(a), Str(b)) => Some(a.cmp(b)),
        (Bool(a), Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_and_membership_fold() {
        assert_eq!(
            eval_const_values(&Value::Int(3), Op::Lt, &Value::Int(5)),
            Some(Value::Bool(true))
        );
        assert_eq!(
            eval_const_values(&Value::Str("a".into()), Op::Eq, &Value::Str("a".into())),
            Some(Value::Bool(true))
        );
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(
            eval_const_values(&Value::Int(2), Op::In, &list),
            Some(Value::Bool(true))
        );
        assert_eq!(
            eval_const_values(&Value::Int(3), Op::NotIn, &list),
            Some(Value::Bool(true))
        );
    }

    #[test]
    fn arithmetic_follows_numeric_promotion() {
        assert_eq!(
            eval_const_values(&Value::Int(2), Op::Mul, &Value::Int(21)),
            Some(Value::Int(42))
        );
        assert_eq!(
            eval_const_values(&Value::Int(1), Op::Add, &Value::Float(0.5)),
            Some(Value::Float(1.5))
        );
        assert_eq!(
            eval_const_values(&Value::Str("ab".into()), Op::Add, &Value::Str("cd".into())),
            Some(Value::Str("abcd".into()))
        );
    }

    #[test]
    fn degenerate_arithmetic_stays_symbolic() {
        assert_eq!(eval_const_values(&Value::Int(1), Op::Div, &Value::Int(0)), None);
        assert_eq!(
            eval_const_values(&Value::Int(i64::MAX), Op::Add, &Value::Int(1)),
            None
        );
        assert_eq!(
            eval_const_values(&Value::Int(1), Op::In, &Value::Int(2)),
            None
        );
    }
}
