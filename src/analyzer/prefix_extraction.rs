//! Path indexing and atomic-reference rewiring.
//!
//! `extract_prefixes` walks an expression and records, for every entity set
//! and atomic reference, which nodes carry which navigation identity.
//! `replace_atom_refs` then consults that index to re-point atomic
//! references at the canonical nodes that survived unification, keeping the
//! owners' `atomrefs`/`metarefs` sets in lockstep.

use std::collections::BTreeSet;

use crate::gir::{GirNode, NodeId, PathIndex, PathKey};

use super::errors::{TransformError, TransformResult};
use super::Transformer;

impl<'a> Transformer<'a> {
    /// Index all path-bearing subnodes of `expr` under their anchor or path
    /// identity. Subqueries and constants are terminal: a nested query's
    /// paths never leak into the enclosing index.
    pub fn extract_prefixes(
        &mut self,
        expr: NodeId,
        prefixes: &mut PathIndex,
    ) -> TransformResult<()> {
        match self.graph.node(expr).clone() {
            GirNode::Conjunction(ps) | GirNode::Disjunction(ps) => {
                for path in ps.paths {
                    self.extract_prefixes(path, prefixes)?;
                }
            }

            GirNode::EntitySet(set) => {
                if let Some(key) = self.graph.index_key_of(expr) {
                    prefixes.add(key, expr);
                }
                if let Some(rlink) = set.rlink {
                    if let Some(source) = self.graph.entity_link(rlink).and_then(|l| l.source) {
                        self.extract_prefixes(source, prefixes)?;
                    }
                }
            }

            GirNode::AtomicRefSimple(aref) => {
                if let Some(key) = self.graph.index_key_of(expr) {
                    prefixes.add(key, expr);
                }
                self.extract_prefixes(aref.ref_id, prefixes)?;
            }

            GirNode::MetaRef(mref) => {
                if let Some(key) = self.graph.index_key_of(expr) {
                    prefixes.add(key, expr);
                }
                self.extract_prefixes(mref.ref_id, prefixes)?;
            }

            GirNode::EntityLink(link) => {
                if let Some(next) = link.target.or(link.source) {
                    self.extract_prefixes(next, prefixes)?;
                }
            }

            GirNode::LinkPropRefSimple(pref) => {
                self.extract_prefixes(pref.ref_id, prefixes)?;
            }

            GirNode::BinOp(binop) => {
                self.extract_prefixes(binop.left, prefixes)?;
                self.extract_prefixes(binop.right, prefixes)?;
            }

            GirNode::UnaryOp(u) => self.extract_prefixes(u.expr, prefixes)?,

            GirNode::InlineFilter(f) | GirNode::InlinePropFilter(f) => {
                self.extract_prefixes(f.ref_id, prefixes)?;
                self.extract_prefixes(f.expr, prefixes)?;
            }

            GirNode::AtomicRefExpr(r) | GirNode::LinkPropRefExpr(r) => {
                self.extract_prefixes(r.expr, prefixes)?;
            }

            GirNode::FunctionCall(call) => {
                for arg in call.args {
                    self.extract_prefixes(arg, prefixes)?;
                }
            }

            GirNode::TypeCast(c) => self.extract_prefixes(c.expr, prefixes)?,
            GirNode::NoneTest(n) => self.extract_prefixes(n.expr, prefixes)?,

            GirNode::Sequence(s) => {
                for element in s.elements {
                    self.extract_prefixes(element, prefixes)?;
                }
            }
            GirNode::Record(r) => {
                for element in r.elements {
                    self.extract_prefixes(element, prefixes)?;
                }
            }

            GirNode::Constant(_) | GirNode::GraphExpr(_) => {}
        }
        Ok(())
    }

    /// Re-point every atomic reference inside `expr` at the canonical node
    /// recorded in the index for its navigation (a disjunction of nodes if
    /// the index holds several), registering the reference with the
    /// canonical owner's bookkeeping set as it goes.
    pub fn replace_atom_refs(
        &mut self,
        expr: NodeId,
        prefixes: &PathIndex,
    ) -> TransformResult<()> {
        let arefs: Vec<NodeId> = if matches!(
            self.graph.node(expr),
            GirNode::AtomicRefSimple(_) | GirNode::MetaRef(_)
        ) {
            vec![expr]
        } else {
            self.graph.collect_matching(expr, |g, id| {
                matches!(g.node(id), GirNode::AtomicRefSimple(_) | GirNode::MetaRef(_))
            })
        };

        for aref in arefs {
            let is_meta = matches!(self.graph.node(aref), GirNode::MetaRef(_));
            let ref_id = self
                .graph
                .ref_of(aref)
                .ok_or_else(|| TransformError::tree("atomic reference without an owner"))?;

            let ref_keys: Vec<PathKey> = if self.graph.is_combination(ref_id) {
                self.paths_of(ref_id)
                    .into_iter()
                    .filter_map(|member| self.graph.index_key_of(member))
                    .collect()
            } else {
                self.graph.index_key_of(ref_id).into_iter().collect()
            };

            let aref_id_key = self.graph.path_id_of(aref).map(PathKey::Path);

            let mut newrefs: BTreeSet<NodeId> = BTreeSet::new();
            for key in ref_keys {
                let Some(canonical) = prefixes.get(&key) else {
                    continue;
                };

                // Pull the atom into every alternative owner; the
                // bookkeeping may have gone stale while the path merger was
                // developing alternative paths.
                let equivalents: BTreeSet<NodeId> = aref_id_key
                    .as_ref()
                    .and_then(|key| prefixes.get(key).cloned())
                    .unwrap_or_else(|| [aref].into_iter().collect());
                for owner in canonical {
                    if let Some(set) = self.graph.entity_set_mut(*owner) {
                        if is_meta {
                            set.metarefs.extend(equivalents.iter().copied());
                        } else {
                            set.atomrefs.extend(equivalents.iter().copied());
                        }
                    }
                }

                newrefs.extend(canonical.iter().copied());
            }

            if !newrefs.is_empty() {
                let new_ref = if newrefs.len() > 1 {
                    self.graph.new_disjunction(newrefs)
                } else {
                    newrefs.into_iter().next().expect("non-empty")
                };
                match self.graph.node_mut(aref) {
                    GirNode::AtomicRefSimple(r) => r.ref_id = new_ref,
                    GirNode::MetaRef(r) => r.ref_id = new_ref,
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
