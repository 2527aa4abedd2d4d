//! Contextual expression merging.
//!
//! `merge_paths` is the rewrite driver that folds operators onto the path
//! references they constrain. In generator context an atomic expression is
//! pushed into its owning set's `filter` slot and replaced by an inline
//! filter marker; in selector context it is left in place. Binary
//! operations combine their operand paths disjunctively for weak operators
//! and conjunctively otherwise, then unify the combination.

use std::collections::BTreeSet;

use crate::gir::{CombinationKind, GirNode, InlineFilter, NodeId};
use crate::ops::Op;

use super::errors::{TransformError, TransformResult};
use super::{Location, Transformer};

impl<'a> Transformer<'a> {
    /// Weak operators do not require intersection of their operand paths:
    /// `OR` and the membership tests, and any operator at all outside a
    /// generator, where predicates do not constrain the outer path set.
    pub(crate) fn is_weak_op(&self, op: Op, loc: Location) -> bool {
        matches!(op, Op::Or | Op::In | Op::NotIn) || loc != Location::Generator
    }

    pub fn merge_paths(&mut self, expr: NodeId, loc: Location) -> TransformResult<NodeId> {
        match self.graph.node(expr).clone() {
            GirNode::AtomicRefExpr(r) => {
                if loc == Location::Generator {
                    let Some(ref_id) = r.ref_id else {
                        return Err(TransformError::tree(
                            "atomic expression without an owning entity set in generator",
                        ));
                    };
                    if self.graph.is_entity_set(ref_id) {
                        let filter = self.graph.entity_set(ref_id).and_then(|s| s.filter);
                        let extended = self.extend_binop(filter, r.expr, Op::And, false);
                        if let Some(set) = self.graph.entity_set_mut(ref_id) {
                            set.filter = Some(extended);
                        }
                        self.merge_paths(ref_id, loc)?;
                        let filter_expr = self
                            .graph
                            .entity_set(ref_id)
                            .and_then(|s| s.filter)
                            .ok_or_else(|| TransformError::tree("filter vanished during merge"))?;
                        Ok(self.graph.alloc(GirNode::InlineFilter(InlineFilter {
                            expr: filter_expr,
                            ref_id,
                        })))
                    } else {
                        // The owner is a disjunction of alternatives; the
                        // expression cannot be pinned to one set's filter.
                        self.merge_paths(r.expr, loc)?;
                        Ok(expr)
                    }
                } else {
                    self.merge_paths(r.expr, loc)?;
                    Ok(expr)
                }
            }

            GirNode::LinkPropRefExpr(r) => {
                if loc == Location::Generator {
                    let Some(ref_id) = r.ref_id else {
                        return Err(TransformError::tree(
                            "link property expression without an owning link in generator",
                        ));
                    };
                    let (propfilter, target, source) = match self.graph.entity_link(ref_id) {
                        Some(link) => (link.propfilter, link.target, link.source),
                        None => {
                            self.merge_paths(r.expr, loc)?;
                            return Ok(expr);
                        }
                    };
                    let extended = self.extend_binop(propfilter, r.expr, Op::And, false);
                    if let Some(link) = self.graph.entity_link_mut(ref_id) {
                        link.propfilter = Some(extended);
                    }
                    if let Some(next) = target.or(source) {
                        self.merge_paths(next, loc)?;
                    }
                    let filter_expr = self
                        .graph
                        .entity_link(ref_id)
                        .and_then(|l| l.propfilter)
                        .ok_or_else(|| TransformError::tree("propfilter vanished during merge"))?;
                    Ok(self.graph.alloc(GirNode::InlinePropFilter(InlineFilter {
                        expr: filter_expr,
                        ref_id,
                    })))
                } else {
                    self.merge_paths(r.expr, loc)?;
                    Ok(expr)
                }
            }

            GirNode::BinOp(binop) => {
                let left = self.merge_paths(binop.left, loc)?;
                let right = self.merge_paths(binop.right, loc)?;

                let kind = if self.is_weak_op(binop.op, loc) {
                    CombinationKind::Disjunction
                } else {
                    CombinationKind::Conjunction
                };

                let mut paths = BTreeSet::new();
                for operand in [left, right] {
                    let member = match self.graph.node(operand) {
                        GirNode::InlineFilter(f) => f.ref_id,
                        GirNode::AtomicRefSimple(r) => r.ref_id,
                        GirNode::MetaRef(r) => r.ref_id,
                        _ => operand,
                    };
                    paths.insert(member);
                }

                let combination = self.graph.new_combination(kind, paths);
                let merge_filters = loc != Location::Generator;
                self.flatten_and_unify_path_combination(combination, false, merge_filters, loc)?;

                if self.paths_of(combination).len() > 1 {
                    if let GirNode::BinOp(b) = self.graph.node_mut(expr) {
                        b.left = left;
                        b.right = right;
                    }
                    Ok(expr)
                } else {
                    self.paths_of(combination)
                        .into_iter()
                        .next()
                        .ok_or_else(|| TransformError::tree("operator lost both operand paths"))
                }
            }

            GirNode::UnaryOp(u) => {
                let merged = self.merge_paths(u.expr, loc)?;
                if let GirNode::UnaryOp(node) = self.graph.node_mut(expr) {
                    node.expr = merged;
                }
                Ok(expr)
            }

            GirNode::TypeCast(c) => {
                let merged = self.merge_paths(c.expr, loc)?;
                if let GirNode::TypeCast(node) = self.graph.node_mut(expr) {
                    node.expr = merged;
                }
                Ok(expr)
            }

            GirNode::NoneTest(n) => {
                let merged = self.merge_paths(n.expr, loc)?;
                if let GirNode::NoneTest(node) = self.graph.node_mut(expr) {
                    node.expr = merged;
                }
                Ok(expr)
            }

            GirNode::Conjunction(_) | GirNode::Disjunction(_) => {
                self.flatten_and_unify_path_combination(expr, true, false, loc)
            }

            GirNode::MetaRef(r) => {
                self.register_meta_ref(r.ref_id, expr);
                Ok(expr)
            }

            GirNode::AtomicRefSimple(r) => {
                self.register_atom_ref(r.ref_id, expr);
                Ok(expr)
            }

            GirNode::LinkPropRefSimple(r) => {
                if let Some(link) = self.graph.entity_link_mut(r.ref_id) {
                    link.proprefs.insert(expr);
                }
                Ok(expr)
            }

            GirNode::EntitySet(set) => {
                if let Some(rlink) = set.rlink {
                    if let Some(source) = self.graph.entity_link(rlink).and_then(|l| l.source) {
                        self.merge_paths(source, loc)?;
                    }
                }
                Ok(expr)
            }

            GirNode::EntityLink(link) => {
                if let Some(source) = link.source {
                    self.merge_paths(source, loc)?;
                }
                Ok(expr)
            }

            GirNode::InlineFilter(_)
            | GirNode::InlinePropFilter(_)
            | GirNode::Constant(_)
            | GirNode::GraphExpr(_) => Ok(expr),

            GirNode::FunctionCall(call) => {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in call.args {
                    args.push(self.merge_paths(arg, loc)?);
                }
                if let GirNode::FunctionCall(node) = self.graph.node_mut(expr) {
                    node.args = args;
                }
                Ok(expr)
            }

            GirNode::Sequence(s) => {
                let mut elements = Vec::with_capacity(s.elements.len());
                for element in s.elements {
                    elements.push(self.merge_paths(element, loc)?);
                }
                if let GirNode::Sequence(node) = self.graph.node_mut(expr) {
                    node.elements = elements;
                }
                Ok(expr)
            }

            GirNode::Record(r) => {
                let mut elements = Vec::with_capacity(r.elements.len());
                for element in r.elements {
                    elements.push(self.merge_paths(element, loc)?);
                }
                if let GirNode::Record(node) = self.graph.node_mut(expr) {
                    node.elements = elements;
                }
                Ok(expr)
            }
        }
    }

    /// Keep invariant bookkeeping: an atomic ref is listed by its owner.
    /// A disjunctive owner registers the ref with every alternative.
    pub(crate) fn register_atom_ref(&mut self, owner: NodeId, aref: NodeId) {
        let targets: Vec<NodeId> = if self.graph.is_combination(owner) {
            self.paths_of(owner).into_iter().collect()
        } else {
            vec![owner]
        };
        for target in targets {
            if let Some(set) = self.graph.entity_set_mut(target) {
                set.atomrefs.insert(aref);
            }
        }
    }

    pub(crate) fn register_meta_ref(&mut self, owner: NodeId, mref: NodeId) {
        let targets: Vec<NodeId> = if self.graph.is_combination(owner) {
            self.paths_of(owner).into_iter().collect()
        } else {
            vec![owner]
        };
        for target in targets {
            if let Some(set) = self.graph.entity_set_mut(target) {
                set.metarefs.insert(mref);
            }
        }
    }
}
