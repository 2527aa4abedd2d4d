//! Aggregate propagation and well-formedness.
//!
//! A post-order walk that marks expressions aggregated (a call in the
//! `agg` namespace, or any node whose children are aggregated with at most
//! constants mixed in) and rejects expressions that mix aggregated and
//! plain operands. Grouped paths count as aggregated: referencing a
//! grouping prefix inside a selector is fine.

use crate::gir::{GirNode, NodeId};
use crate::ops::Op;

use super::errors::{TransformError, TransformResult};
use super::Transformer;

impl<'a> Transformer<'a> {
    /// Is this expression aggregated? `deep` also accepts expressions with
    /// an aggregated node anywhere below them.
    pub(crate) fn is_aggregated_expr(&self, expr: NodeId, deep: bool) -> bool {
        let mut agg = self.graph.aggregates_flag(expr);

        if !agg && (self.graph.is_entity_set(expr) || self.graph.is_atomic_ref(expr)) {
            if let Some(path_id) = self.graph.path_id_of(expr) {
                agg = self.group_prefixes.contains(&path_id);
            }
        }

        if !agg && deep {
            agg = self
                .graph
                .reachable(expr)
                .into_iter()
                .any(|id| self.graph.aggregates_flag(id));
        }
        agg
    }

    /// Propagate aggregate-ness bottom-up and normalize operand order:
    /// under `AND` the aggregated operand always ends up on the left.
    pub fn reorder_aggregates(&mut self, expr: NodeId) -> TransformResult<()> {
        if self.graph.aggregates_flag(expr) {
            // Known pure aggregate, no need to drill down.
            return Ok(());
        }

        match self.graph.node(expr).clone() {
            GirNode::FunctionCall(call) => {
                let mut has_agg_args = false;
                for arg in &call.args {
                    self.reorder_aggregates(*arg)?;
                    if self.is_aggregated_expr(*arg, false) {
                        has_agg_args = true;
                    }
                }
                if has_agg_args {
                    if let GirNode::FunctionCall(c) = self.graph.node_mut(expr) {
                        c.aggregates = true;
                    }
                }
            }

            GirNode::BinOp(binop) => {
                self.reorder_aggregates(binop.left)?;
                self.reorder_aggregates(binop.right)?;

                let left_aggregates = self.is_aggregated_expr(binop.left, false);
                let right_aggregates = self.is_aggregated_expr(binop.right, false);
                let left_const = self.graph.is_constant(binop.left);
                let right_const = self.graph.is_constant(binop.right);

                if (left_aggregates && (right_aggregates || right_const))
                    || (left_const && right_aggregates)
                {
                    if let GirNode::BinOp(b) = self.graph.node_mut(expr) {
                        b.aggregates = true;
                    }
                } else if binop.op == Op::And {
                    if right_aggregates {
                        if let GirNode::BinOp(b) = self.graph.node_mut(expr) {
                            std::mem::swap(&mut b.left, &mut b.right);
                        }
                    }
                } else if left_aggregates || right_aggregates {
                    return Err(TransformError::AggregateMix);
                }
            }

            GirNode::UnaryOp(u) => self.reorder_aggregates(u.expr)?,
            GirNode::NoneTest(n) => self.reorder_aggregates(n.expr)?,
            GirNode::TypeCast(c) => self.reorder_aggregates(c.expr)?,

            GirNode::Conjunction(ps) | GirNode::Disjunction(ps) => {
                for path in ps.paths {
                    self.reorder_aggregates(path)?;
                }
            }

            GirNode::Sequence(s) => {
                self.check_element_aggregates(expr, &s.elements)?;
            }
            GirNode::Record(r) => {
                self.check_element_aggregates(expr, &r.elements)?;
            }

            GirNode::AtomicRefSimple(_)
            | GirNode::AtomicRefExpr(_)
            | GirNode::MetaRef(_)
            | GirNode::LinkPropRefSimple(_)
            | GirNode::LinkPropRefExpr(_)
            | GirNode::Constant(_)
            | GirNode::InlineFilter(_)
            | GirNode::InlinePropFilter(_)
            | GirNode::EntitySet(_)
            | GirNode::EntityLink(_)
            | GirNode::GraphExpr(_) => {}
        }
        Ok(())
    }

    /// A tuple may mix aggregates with constants, never with plain
    /// expressions.
    fn check_element_aggregates(
        &mut self,
        expr: NodeId,
        elements: &[NodeId],
    ) -> TransformResult<()> {
        let mut has_agg = false;
        let mut has_plain = false;
        for element in elements {
            self.reorder_aggregates(*element)?;
            if self.is_aggregated_expr(*element, false) {
                has_agg = true;
            } else if !self.graph.is_constant(*element) {
                has_plain = true;
            }
        }
        if has_agg && has_plain {
            return Err(TransformError::AggregateMix);
        }
        if has_agg {
            match self.graph.node_mut(expr) {
                GirNode::Sequence(s) => s.aggregates = true,
                GirNode::Record(r) => r.aggregates = true,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::concept_catalog::{FullName, Schema};
    use crate::gir::{AtomicRefSimple, BinOp, Constant, FunctionCall, LinearPath, Value};
    use crate::analyzer::Transformer;

    fn transformer(schema: &Schema) -> Transformer<'_> {
        Transformer::new(schema, BTreeMap::new(), BTreeMap::new())
    }

    /// A bare `agg::count()` call, aggregated by construction.
    fn count_call(t: &mut Transformer<'_>) -> NodeId {
        t.graph.alloc(GirNode::FunctionCall(FunctionCall {
            module: Some("agg".to_string()),
            name: "count".to_string(),
            args: Vec::new(),
            aggregates: true,
        }))
    }

    /// A plain atomic reference: neither aggregated nor constant.
    fn plain_ref(t: &mut Transformer<'_>) -> NodeId {
        let user = FullName::new("test", "User");
        let set = t
            .graph
            .new_entity_set(user.clone(), LinearPath::from_origin(user), None);
        t.graph.alloc(GirNode::AtomicRefSimple(AtomicRefSimple {
            ref_id: set,
            name: FullName::new("test", "name"),
            id: None,
        }))
    }

    fn int_const(t: &mut Transformer<'_>) -> NodeId {
        t.graph.alloc(GirNode::Constant(Constant {
            value: Some(Value::Int(1)),
            expr: None,
            type_: Some(FullName::std("int")),
        }))
    }

    fn binop(t: &mut Transformer<'_>, left: NodeId, op: Op, right: NodeId) -> NodeId {
        t.graph.alloc(GirNode::BinOp(BinOp {
            left,
            op,
            right,
            aggregates: false,
        }))
    }

    #[test]
    fn and_swaps_the_aggregate_onto_the_left() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let plain = plain_ref(&mut t);
        let agg = count_call(&mut t);
        let expr = binop(&mut t, plain, Op::And, agg);

        t.reorder_aggregates(expr).unwrap();

        let GirNode::BinOp(b) = t.graph.node(expr) else {
            panic!("expression should stay a binary op");
        };
        assert_eq!(b.left, agg, "the aggregate operand moved to the left");
        assert_eq!(b.right, plain);
        assert!(!b.aggregates, "a plain/aggregate conjunction is not itself aggregated");
    }

    #[test]
    fn and_with_the_aggregate_already_left_is_untouched() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let agg = count_call(&mut t);
        let plain = plain_ref(&mut t);
        let expr = binop(&mut t, agg, Op::And, plain);

        t.reorder_aggregates(expr).unwrap();

        let GirNode::BinOp(b) = t.graph.node(expr) else {
            panic!("expression should stay a binary op");
        };
        assert_eq!(b.left, agg);
        assert_eq!(b.right, plain);
    }

    #[test]
    fn constant_beside_an_aggregate_marks_the_operation() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);

        // const AND agg: no swap, the whole operation is aggregated.
        let constant = int_const(&mut t);
        let agg = count_call(&mut t);
        let expr = binop(&mut t, constant, Op::And, agg);
        t.reorder_aggregates(expr).unwrap();
        let GirNode::BinOp(b) = t.graph.node(expr) else {
            panic!("expression should stay a binary op");
        };
        assert_eq!(b.left, constant, "constant operands are not reordered");
        assert!(b.aggregates);

        // agg > const behaves the same with the operands flipped.
        let agg = count_call(&mut t);
        let constant = int_const(&mut t);
        let expr = binop(&mut t, agg, Op::Gt, constant);
        t.reorder_aggregates(expr).unwrap();
        assert!(t.graph.aggregates_flag(expr));
    }

    #[test]
    fn non_conjunctive_mixes_are_rejected() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let plain = plain_ref(&mut t);
        let agg = count_call(&mut t);
        let expr = binop(&mut t, plain, Op::Or, agg);

        assert_eq!(t.reorder_aggregates(expr), Err(TransformError::AggregateMix));
    }
}
