//! Role fixups after merging.
//!
//! The generator produces strong paths that must limit every other path in
//! the query, but during merging links are kept in the disjunction slot to
//! accommodate genuinely disjunctive generator expressions. When merging
//! leaves a generator entity set with a solitary optional link and no
//! required ones, that link was not disjunctive after all and moves into
//! the conjunction.

use crate::gir::NodeId;

use super::errors::{TransformError, TransformResult};
use super::{ExtractOpts, Location, Transformer};

impl<'a> Transformer<'a> {
    pub fn postprocess_expr(&mut self, expr: NodeId, loc: Location) -> TransformResult<()> {
        let opts = ExtractOpts::new().reverse(true).resolve_arefs(true);
        let Some(paths) = self.extract_paths(expr, opts, loc)? else {
            return Ok(());
        };
        let members: Vec<NodeId> = if self.graph.is_combination(paths) {
            self.paths_of(paths).into_iter().collect()
        } else {
            vec![paths]
        };
        for member in members {
            self.postprocess_path(member, loc)?;
        }
        Ok(())
    }

    fn postprocess_path(&mut self, expr: NodeId, loc: Location) -> TransformResult<()> {
        if self.graph.is_entity_set(expr) {
            if loc == Location::Generator {
                let (disjunction, conjunction) = {
                    let set = self.graph.entity_set(expr).expect("checked");
                    (set.disjunction, set.conjunction)
                };
                let disj_paths = self.paths_of(disjunction);
                if disj_paths.len() == 1 && self.combination_is_empty(conjunction) {
                    let promoted = self.graph.new_conjunction(disj_paths);
                    let empty = self.graph.new_disjunction(Default::default());
                    if let Some(set) = self.graph.entity_set_mut(expr) {
                        set.conjunction = promoted;
                        set.disjunction = empty;
                    }
                }
            }

            let (conjunction, disjunction) = {
                let set = self.graph.entity_set(expr).expect("checked");
                (set.conjunction, set.disjunction)
            };
            for path in self.paths_of(conjunction) {
                self.postprocess_path(path, loc)?;
            }
            for path in self.paths_of(disjunction) {
                self.postprocess_path(path, loc)?;
            }
            Ok(())
        } else if self.graph.is_combination(expr) {
            for path in self.paths_of(expr) {
                self.postprocess_path(path, loc)?;
            }
            Ok(())
        } else if self.graph.is_entity_link(expr) {
            if let Some(target) = self.graph.entity_link(expr).and_then(|l| l.target) {
                self.postprocess_path(target, loc)?;
            }
            Ok(())
        } else {
            Err(TransformError::tree(format!(
                "unexpected {} during post-processing",
                self.graph.node(expr).kind_name()
            )))
        }
    }
}
