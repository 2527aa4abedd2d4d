//! Result-type inference over normalized GIR, used by callers to type the
//! selector list of a query.

use crate::concept_catalog::names::ID_POINTER;
use crate::concept_catalog::{type_rules, FullName, Schema};
use crate::gir::{GirGraph, GirNode, NodeId};

/// Inferred typing of one selector item.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorTyping {
    pub name: String,
    pub type_: Option<FullName>,
    pub is_constant: bool,
}

/// Infer the schema type an expression evaluates to, or `None` when the
/// expression has no single scalar/concept type.
pub fn get_expr_type(graph: &GirGraph, expr: NodeId, schema: &Schema) -> Option<FullName> {
    match graph.node(expr) {
        GirNode::MetaRef(_) => Some(FullName::std("str")),

        GirNode::AtomicRefSimple(aref) => {
            let concept = owner_concept(graph, aref.ref_id, schema)?;
            if aref.name == *ID_POINTER {
                Some(concept)
            } else {
                schema
                    .get_attr(&concept, &aref.name)
                    .map(|link| link.target.name().clone())
            }
        }

        GirNode::LinkPropRefSimple(pref) => {
            let link_proto = match graph.node(pref.ref_id) {
                GirNode::EntityLink(link) => Some(link.link_proto.clone()),
                GirNode::Conjunction(ps) | GirNode::Disjunction(ps) => ps
                    .paths
                    .iter()
                    .next()
                    .and_then(|p| graph.entity_link(*p))
                    .map(|l| l.link_proto.clone()),
                _ => None,
            }?;
            let link = schema.get_link(&link_proto).ok()?;
            link.properties.get(&pref.name).cloned()
        }

        GirNode::AtomicRefExpr(r) | GirNode::LinkPropRefExpr(r) => {
            get_expr_type(graph, r.expr, schema)
        }

        GirNode::InlineFilter(f) | GirNode::InlinePropFilter(f) => {
            get_expr_type(graph, f.expr, schema)
        }

        GirNode::Record(record) => Some(record.concept.clone()),

        GirNode::FunctionCall(call) => {
            let args: Vec<Option<FullName>> = call
                .args
                .iter()
                .map(|a| get_expr_type(graph, *a, schema))
                .collect();
            type_rules::function_result_type(call.module.as_deref(), &call.name, &args)
        }

        GirNode::Constant(constant) => constant
            .type_
            .clone()
            .or_else(|| constant.value.as_ref().and_then(|v| v.atom_type())),

        GirNode::BinOp(binop) => {
            let left = get_expr_type(graph, binop.left, schema);
            let right = get_expr_type(graph, binop.right, schema);
            type_rules::result_type(binop.op, left.as_ref(), right.as_ref())
        }

        GirNode::UnaryOp(u) => get_expr_type(graph, u.expr, schema),
        GirNode::TypeCast(cast) => Some(cast.target.clone()),
        GirNode::NoneTest(_) => Some(FullName::std("bool")),

        GirNode::EntitySet(set) => Some(set.concept.clone()),

        GirNode::Disjunction(ps) => ps
            .paths
            .iter()
            .next()
            .and_then(|p| get_expr_type(graph, *p, schema)),

        _ => None,
    }
}

/// The concept owning an atomic reference: a single entity set's concept,
/// or the nearest common ancestor over a disjunction of alternatives.
fn owner_concept(graph: &GirGraph, ref_id: NodeId, schema: &Schema) -> Option<FullName> {
    match graph.node(ref_id) {
        GirNode::EntitySet(set) => Some(set.concept.clone()),
        GirNode::Conjunction(ps) | GirNode::Disjunction(ps) => {
            let concepts: Vec<FullName> = ps
                .paths
                .iter()
                .filter_map(|p| graph.entity_set(*p).map(|s| s.concept.clone()))
                .collect();
            if concepts.is_empty() {
                None
            } else {
                schema.nearest_common_ancestor(&concepts).ok()
            }
        }
        _ => None,
    }
}

/// Type every selector item of a graph expression, in order. Unnamed items
/// are keyed by position.
pub fn get_selector_types(
    graph: &GirGraph,
    graph_expr: NodeId,
    schema: &Schema,
) -> Vec<SelectorTyping> {
    let GirNode::GraphExpr(ge) = graph.node(graph_expr) else {
        return Vec::new();
    };
    ge.selector
        .iter()
        .enumerate()
        .map(|(i, item)| SelectorTyping {
            name: item.name.clone().unwrap_or_else(|| i.to_string()),
            type_: get_expr_type(graph, item.expr, schema),
            is_constant: graph.is_constant(item.expr),
        })
        .collect()
}
