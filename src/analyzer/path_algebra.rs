//! Path combination algebra.
//!
//! The additive (`add_paths`) and multiplicative (`intersect_paths`)
//! composition of path nodes, prefix matching, flattening, and the
//! order-insensitive reduction `unify_paths`. This is where repeated
//! navigations fuse into shared nodes: two occurrences of the same path
//! merge when their canonical identities match, with all back-edges and
//! bookkeeping sets rewired onto the survivor.

use std::collections::BTreeSet;

use crate::gir::{CombinationKind, GirNode, LinearPath, NodeId};
use crate::ops::Op;

use super::errors::{TransformError, TransformResult};
use super::{ExtractOpts, Location, Recurse, Transformer};

/// One operand of a prefix match, normalized to (link, node, identity).
struct MatchSide {
    link: Option<NodeId>,
    node: Option<NodeId>,
    id: Option<LinearPath>,
}

impl<'a> Transformer<'a> {
    // ------------------------------------------------------------------
    // Combination helpers
    // ------------------------------------------------------------------

    pub(crate) fn paths_of(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.graph.combination_paths(id).cloned().unwrap_or_default()
    }

    pub(crate) fn set_paths(&mut self, id: NodeId, paths: BTreeSet<NodeId>) {
        if let Some(slot) = self.graph.combination_paths_mut(id) {
            *slot = paths;
        }
    }

    pub(crate) fn combination_is_empty(&self, id: NodeId) -> bool {
        self.graph
            .combination_paths(id)
            .map(|p| p.is_empty())
            .unwrap_or(true)
    }

    /// Union another path (or a whole combination's members) into `dst`.
    pub(crate) fn combination_update(&mut self, dst: NodeId, other: NodeId) {
        let additions: BTreeSet<NodeId> = if self.graph.is_combination(other) {
            self.paths_of(other)
        } else {
            [other].into_iter().collect()
        };
        if let Some(slot) = self.graph.combination_paths_mut(dst) {
            slot.extend(additions);
        }
    }

    fn first_path(&self, id: NodeId) -> Option<NodeId> {
        self.graph
            .combination_paths(id)
            .and_then(|p| p.iter().next().copied())
    }

    /// Wrap a non-combination path into a singleton disjunction.
    pub(crate) fn get_multipath(&mut self, expr: NodeId) -> NodeId {
        if self.graph.is_combination(expr) {
            expr
        } else {
            self.graph.new_disjunction([expr].into_iter().collect())
        }
    }

    /// A single path stays bare; several become a disjunction.
    pub(crate) fn path_from_set(&mut self, paths: BTreeSet<NodeId>) -> NodeId {
        if paths.len() == 1 {
            paths.into_iter().next().expect("non-empty")
        } else {
            self.graph.new_disjunction(paths)
        }
    }

    /// AND-extend an optional predicate with another expression.
    pub(crate) fn extend_binop(
        &mut self,
        binop: Option<NodeId>,
        expr: NodeId,
        op: Op,
        reversed: bool,
    ) -> NodeId {
        match binop {
            None => expr,
            Some(b) if b == expr => b,
            Some(b) => {
                let (left, right) = if reversed { (expr, b) } else { (b, expr) };
                self.graph.alloc(GirNode::BinOp(crate::gir::BinOp {
                    left,
                    op,
                    right,
                    aggregates: false,
                }))
            }
        }
    }

    /// Tag a path chain, sets and incoming links up to the root, with the
    /// clause that uses it.
    pub(crate) fn add_path_user(&mut self, path: NodeId, tag: &str) {
        let mut cursor = Some(path);
        while let Some(id) = cursor {
            let rlink = match self.graph.entity_set_mut(id) {
                Some(set) => {
                    set.users.insert(tag.to_string());
                    set.rlink
                }
                None => break,
            };
            cursor = match rlink {
                Some(link_id) => {
                    let source = match self.graph.entity_link_mut(link_id) {
                        Some(link) => {
                            link.users.insert(tag.to_string());
                            link.source
                        }
                        None => None,
                    };
                    source
                }
                None => None,
            };
        }
    }

    /// Clone an entity-set/link chain up to its root. Identities, anchors
    /// and user tags are preserved; reference sets start out shared with
    /// the original (they are bookkeeping, not ownership).
    pub fn copy_path(&mut self, path: NodeId) -> TransformResult<NodeId> {
        let (result, mut rlink) = if let Some(set) = self.graph.entity_set(path) {
            let set = set.clone();
            let copy = self.graph.new_entity_set(set.concept, set.id, set.anchor);
            if let Some(copy_set) = self.graph.entity_set_mut(copy) {
                copy_set.users = set.users;
                copy_set.joins = set.joins;
            }
            (Some(copy), set.rlink)
        } else if self.graph.is_entity_link(path) {
            (None, Some(path))
        } else {
            return Err(TransformError::tree(format!(
                "cannot copy {} as a path",
                self.graph.node(path).kind_name()
            )));
        };

        let mut result = result;
        let mut current = result;
        while let Some(rlink_id) = rlink {
            let proto = self
                .graph
                .entity_link(rlink_id)
                .ok_or_else(|| TransformError::tree("path chain holds a non-link rlink"))?
                .clone();
            let link = self.graph.alloc(GirNode::EntityLink(crate::gir::EntityLink {
                source: None,
                target: current,
                link_proto: proto.link_proto,
                filter: proto.filter,
                propfilter: proto.propfilter,
                proprefs: BTreeSet::new(),
                users: proto.users.clone(),
                anchor: proto.anchor,
            }));
            if result.is_none() {
                result = Some(link);
            }

            match proto.source {
                Some(parent_id) => {
                    let parent_proto = self
                        .graph
                        .entity_set(parent_id)
                        .ok_or_else(|| TransformError::tree("link source is not an entity set"))?
                        .clone();
                    let parent = self.graph.new_entity_set(
                        parent_proto.concept,
                        parent_proto.id,
                        parent_proto.anchor,
                    );
                    if let Some(parent_set) = self.graph.entity_set_mut(parent) {
                        parent_set.users = parent_proto.users;
                        parent_set.joins = parent_proto.joins;
                    }
                    let disjunction = self.graph.entity_set(parent).expect("just built").disjunction;
                    self.set_paths(disjunction, [link].into_iter().collect());
                    if let Some(l) = self.graph.entity_link_mut(link) {
                        l.source = Some(parent);
                    }
                    if let Some(c) = current {
                        if let Some(set) = self.graph.entity_set_mut(c) {
                            set.rlink = Some(link);
                        }
                    }
                    current = Some(parent);
                    rlink = parent_proto.rlink;
                }
                None => {
                    rlink = None;
                }
            }
        }
        result.ok_or_else(|| TransformError::tree("empty path chain"))
    }

    // ------------------------------------------------------------------
    // Prefix matching
    // ------------------------------------------------------------------

    fn match_side(&self, id: NodeId) -> Option<MatchSide> {
        if let Some(link) = self.graph.entity_link(id) {
            match link.target {
                Some(target) => Some(MatchSide {
                    link: Some(id),
                    node: Some(target),
                    id: self.graph.entity_set(target).map(|s| s.id.clone()),
                }),
                None => {
                    let source = link.source?;
                    let source_id = self.graph.entity_set(source)?.id.clone();
                    let filter = link.filter.as_ref()?;
                    Some(MatchSide {
                        link: Some(id),
                        node: Some(source),
                        id: Some(source_id.extended(
                            filter.labels.clone(),
                            filter.direction,
                            None,
                        )),
                    })
                }
            }
        } else {
            self.graph.entity_set(id).map(|set| MatchSide {
                link: None,
                node: Some(id),
                id: Some(set.id.clone()),
            })
        }
    }

    /// Decide whether two path operands stand for the same navigation and
    /// may be fused, returning the right operand's node as the reusable
    /// one. A wildcard tail on either side matches any concrete tail of
    /// the otherwise equal path.
    pub(crate) fn match_prefixes(
        &self,
        our: NodeId,
        other: NodeId,
        ignore_filters: bool,
    ) -> Option<NodeId> {
        let ours = self.match_side(our)?;
        let others = self.match_side(other)?;

        let (mut our_id, mut other_id) = (ours.id.clone(), others.id.clone());
        if let (Some(a), Some(b)) = (&our_id, &other_id) {
            if a.ends_wildcard() && !b.ends_wildcard() {
                other_id = Some(b.with_wildcard_tail());
            } else if b.ends_wildcard() && !a.ends_wildcard() {
                our_id = Some(a.with_wildcard_tail());
            }
        }

        let nodes_ok = match (ours.node, others.node) {
            (None, None) => true,
            (Some(our_node), Some(other_node)) => {
                let our_set = self.graph.entity_set(our_node)?;
                let other_set = self.graph.entity_set(other_node)?;
                let ids_equal = match (&our_id, &other_id) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                ids_equal
                    && our_set.anchor == other_set.anchor
                    && (ignore_filters
                        || (our_set.filter.is_none()
                            && other_set.filter.is_none()
                            && self.combination_is_empty(our_set.conjunction)
                            && self.combination_is_empty(other_set.conjunction)
                            && our_set.conceptfilter == other_set.conceptfilter))
            }
            _ => false,
        };

        let links_ok = match (ours.link, others.link) {
            (None, None) => true,
            (Some(l), Some(r)) => {
                self.graph.entity_link(l)?.filter == self.graph.entity_link(r)?.filter
            }
            // A bare set never fuses with a link edge.
            _ => false,
        };

        if nodes_ok && links_ok {
            others.link.or(others.node)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Additive composition
    // ------------------------------------------------------------------

    /// Disjunctive merge of two scalar path operands. On a prefix match the
    /// right operand is absorbed into the left one: back-edges rewired,
    /// reference sets united, filters AND-combined when `merge_filters`.
    /// Without a match the operands stay side by side in a disjunction.
    pub(crate) fn add_sets(
        &mut self,
        left: NodeId,
        right: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        if left == right {
            return Ok(left);
        }
        if self.match_prefixes(left, right, merge_filters).is_none() {
            return Ok(self
                .graph
                .new_disjunction([left, right].into_iter().collect()));
        }
        log::trace!("add_sets: fusing {right} into {left}");

        let (left_link, right_link, left_set, right_set) = if self.graph.is_entity_link(left) {
            let lt = self.graph.entity_link(left).and_then(|l| l.target);
            let rt = self.graph.entity_link(right).and_then(|l| l.target);
            (Some(left), Some(right), lt, rt)
        } else {
            let ll = self.graph.entity_set(left).and_then(|s| s.rlink);
            let rl = self.graph.entity_set(right).and_then(|s| s.rlink);
            (ll, rl, Some(left), Some(right))
        };

        if let (Some(ll), Some(rl)) = (left_link, right_link) {
            self.merge_link_edges(ll, rl, merge_filters)?;
        }

        if let (Some(ls), Some(rs)) = (left_set, right_set) {
            self.graph.fixup_refs(&[rs], ls);

            let rs_data = self
                .graph
                .entity_set(rs)
                .ok_or_else(|| TransformError::tree("merge target is not an entity set"))?
                .clone();

            if merge_filters {
                if let Some(rfilter) = rs_data.filter {
                    let lfilter = self.graph.entity_set(ls).and_then(|s| s.filter);
                    let extended = self.extend_binop(lfilter, rfilter, Op::And, false);
                    if let Some(set) = self.graph.entity_set_mut(ls) {
                        set.filter = Some(extended);
                    }
                }

                // Paths already required on the left must not stay optional
                // on the right; try to pull each of the right's disjunction
                // members into the left conjunction.
                let mut remaining = BTreeSet::new();
                for dpath in self.paths_of(rs_data.disjunction) {
                    if self.graph.is_set_or_link(dpath) {
                        let conj = self
                            .graph
                            .entity_set(ls)
                            .map(|s| s.conjunction)
                            .ok_or_else(|| TransformError::tree("lost merge survivor"))?;
                        let merged = self.intersect_paths(conj, dpath, merge_filters, loc)?;
                        if merged != conj {
                            remaining.insert(dpath);
                        }
                    } else {
                        remaining.insert(dpath);
                    }
                }
                self.set_paths(rs_data.disjunction, remaining);
            }

            let ls_disjunction = self
                .graph
                .entity_set(ls)
                .map(|s| s.disjunction)
                .ok_or_else(|| TransformError::tree("lost merge survivor"))?;
            let new_disjunction =
                self.add_paths(ls_disjunction, rs_data.disjunction, merge_filters, loc)?;

            {
                let rs_view = self.graph.entity_set(rs).cloned();
                let set = self
                    .graph
                    .entity_set_mut(ls)
                    .ok_or_else(|| TransformError::tree("lost merge survivor"))?;
                set.disjunction = new_disjunction;
                if let Some(rs_view) = rs_view {
                    set.atomrefs.extend(rs_view.atomrefs.iter().copied());
                    set.metarefs.extend(rs_view.metarefs.iter().copied());
                    set.users.extend(rs_view.users.iter().cloned());
                    set.joins.extend(rs_view.joins.iter().copied());
                    if merge_filters {
                        set.conceptfilter.extend(rs_view.conceptfilter.iter().cloned());
                    }
                }
                set.joins.remove(&ls);
            }

            if merge_filters {
                let ls_conjunction = self.graph.entity_set(ls).map(|s| s.conjunction).unwrap();
                let new_conjunction =
                    self.intersect_paths(ls_conjunction, rs_data.conjunction, merge_filters, loc)?;
                if let Some(set) = self.graph.entity_set_mut(ls) {
                    set.conjunction = new_conjunction;
                }

                // Greedy merging: paths appearing on both sides migrate from
                // the disjunction into the conjunction.
                let conj = self.graph.entity_set(ls).map(|s| s.conjunction).unwrap();
                let disj = self.graph.entity_set(ls).map(|s| s.disjunction).unwrap();
                let union: BTreeSet<NodeId> =
                    self.paths_of(conj).union(&self.paths_of(disj)).copied().collect();
                self.unify_paths(union, CombinationKind::Conjunction, false, true, loc)?;
                let conj_paths = self.paths_of(self.graph.entity_set(ls).unwrap().conjunction);
                let disj_node = self.graph.entity_set(ls).unwrap().disjunction;
                let disj_paths: BTreeSet<NodeId> = self
                    .paths_of(disj_node)
                    .difference(&conj_paths)
                    .copied()
                    .collect();
                self.set_paths(disj_node, disj_paths);
            } else {
                let ls_conjunction = self.graph.entity_set(ls).map(|s| s.conjunction).unwrap();
                let folded =
                    self.add_paths(ls_conjunction, rs_data.conjunction, merge_filters, loc)?;
                if !self.combination_is_empty(folded) {
                    let disj = self.graph.entity_set(ls).map(|s| s.disjunction).unwrap();
                    self.combination_update(disj, folded);
                }
                let fresh = self.graph.new_conjunction(BTreeSet::new());
                if let Some(set) = self.graph.entity_set_mut(ls) {
                    set.conjunction = fresh;
                }
            }
        }

        if let Some(ls) = left_set {
            Ok(ls)
        } else if let Some(rs) = right_set {
            Ok(rs)
        } else {
            left_link.ok_or_else(|| TransformError::tree("path merge produced nothing"))
        }
    }

    /// Fold the link-level data of `rl` into `ll`.
    fn merge_link_edges(
        &mut self,
        ll: NodeId,
        rl: NodeId,
        merge_propfilter: bool,
    ) -> TransformResult<()> {
        self.graph.fixup_refs(&[rl], ll);
        let rl_data = self
            .graph
            .entity_link(rl)
            .ok_or_else(|| TransformError::tree("merge target is not a link"))?
            .clone();
        if merge_propfilter {
            if let Some(rpf) = rl_data.propfilter {
                let lpf = self.graph.entity_link(ll).and_then(|l| l.propfilter);
                let extended = self.extend_binop(lpf, rpf, Op::And, false);
                if let Some(link) = self.graph.entity_link_mut(ll) {
                    link.propfilter = Some(extended);
                }
            }
        }
        if let Some(link) = self.graph.entity_link_mut(ll) {
            link.proprefs.extend(rl_data.proprefs.iter().copied());
            link.users.extend(rl_data.users.iter().cloned());
            if rl_data.target.is_some() {
                link.target = rl_data.target;
            }
        }
        Ok(())
    }

    fn add_to_disjunction(
        &mut self,
        disjunction: NodeId,
        path: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        for dpath in self.paths_of(disjunction) {
            if self.graph.is_set_or_link(dpath) {
                let merged = self.add_sets(dpath, path, merge_filters, loc)?;
                if merged == dpath {
                    return Ok(disjunction);
                }
            }
        }
        self.combination_update(disjunction, path);
        Ok(disjunction)
    }

    fn add_to_conjunction(
        &mut self,
        conjunction: NodeId,
        path: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        if merge_filters {
            for cpath in self.paths_of(conjunction) {
                if self.graph.is_set_or_link(cpath) {
                    let merged = self.add_sets(cpath, path, merge_filters, loc)?;
                    if merged == cpath {
                        return Ok(conjunction);
                    }
                }
            }
        }
        Ok(self
            .graph
            .new_disjunction([conjunction, path].into_iter().collect()))
    }

    fn add_disjunctions(
        &mut self,
        left: NodeId,
        right: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        let mut paths = self.paths_of(left);
        paths.extend(self.paths_of(right));
        let result = self.graph.new_disjunction(paths);
        if self.paths_of(result).len() > 1 {
            let members = self.paths_of(result);
            self.unify_paths(members, CombinationKind::Disjunction, false, merge_filters, loc)?;
        }
        Ok(result)
    }

    fn add_conjunction_to_disjunction(
        &mut self,
        disjunction: NodeId,
        conjunction: NodeId,
    ) -> TransformResult<NodeId> {
        let d_empty = self.combination_is_empty(disjunction);
        let c_empty = self.combination_is_empty(conjunction);
        Ok(if !d_empty && !c_empty {
            self.graph
                .new_disjunction([disjunction, conjunction].into_iter().collect())
        } else if !d_empty {
            disjunction
        } else if !c_empty {
            self.graph
                .new_disjunction([conjunction].into_iter().collect())
        } else {
            self.graph.new_disjunction(BTreeSet::new())
        })
    }

    fn add_conjunctions(&mut self, left: NodeId, right: NodeId) -> TransformResult<NodeId> {
        let paths: BTreeSet<NodeId> = [left, right]
            .into_iter()
            .filter(|c| !self.combination_is_empty(*c))
            .collect();
        Ok(self.graph.new_disjunction(paths))
    }

    /// Disjunctive composition, dispatching on the operand variants.
    pub(crate) fn add_paths(
        &mut self,
        left: NodeId,
        right: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        use CombinationKind::*;
        let lkind = self.operand_kind(left)?;
        let rkind = self.operand_kind(right)?;
        match (lkind, rkind) {
            (None, None) => self.add_sets(left, right, merge_filters, loc),
            (None, Some(Disjunction)) => self.add_to_disjunction(right, left, merge_filters, loc),
            (None, Some(Conjunction)) => self.add_to_conjunction(right, left, merge_filters, loc),
            (Some(Disjunction), None) => self.add_to_disjunction(left, right, merge_filters, loc),
            (Some(Disjunction), Some(Disjunction)) => {
                self.add_disjunctions(left, right, merge_filters, loc)
            }
            (Some(Disjunction), Some(Conjunction)) => {
                self.add_conjunction_to_disjunction(left, right)
            }
            (Some(Conjunction), None) => self.add_to_conjunction(left, right, merge_filters, loc),
            (Some(Conjunction), Some(Disjunction)) => {
                self.add_conjunction_to_disjunction(right, left)
            }
            (Some(Conjunction), Some(Conjunction)) => self.add_conjunctions(left, right),
        }
    }

    /// `None` means a scalar set/link operand.
    fn operand_kind(&self, id: NodeId) -> TransformResult<Option<CombinationKind>> {
        if self.graph.is_set_or_link(id) {
            Ok(None)
        } else if let Some(kind) = self.graph.combination_kind(id) {
            Ok(Some(kind))
        } else {
            Err(TransformError::tree(format!(
                "unexpected path operand: {}",
                self.graph.node(id).kind_name()
            )))
        }
    }

    // ------------------------------------------------------------------
    // Multiplicative composition
    // ------------------------------------------------------------------

    /// Conjunctive merge of two scalar path operands. Filters always
    /// AND-combine; a singleton disjunction left over from merging may
    /// collapse back into the owning node's conjunction.
    pub(crate) fn intersect_sets(
        &mut self,
        left: NodeId,
        right: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        if left == right {
            return Ok(left);
        }
        if self.match_prefixes(left, right, true).is_none() {
            return Ok(self
                .graph
                .new_conjunction([left, right].into_iter().collect()));
        }
        log::trace!("intersect_sets: fusing {right} into {left}");

        let (left_link, right_link, left_set, right_set) = if self.graph.is_entity_link(left) {
            let lt = self.graph.entity_link(left).and_then(|l| l.target);
            let rt = self.graph.entity_link(right).and_then(|l| l.target);
            (Some(left), Some(right), lt, rt)
        } else {
            let ll = self.graph.entity_set(left).and_then(|s| s.rlink);
            let rl = self.graph.entity_set(right).and_then(|s| s.rlink);
            (ll, rl, Some(left), Some(right))
        };

        if let (Some(ll), Some(rl)) = (left_link, right_link) {
            self.merge_link_edges(ll, rl, true)?;
        }

        if let (Some(ls), Some(rs)) = (left_set, right_set) {
            self.graph.fixup_refs(&[rs], ls);

            let rs_data = self
                .graph
                .entity_set(rs)
                .ok_or_else(|| TransformError::tree("merge target is not an entity set"))?
                .clone();

            if let Some(rfilter) = rs_data.filter {
                let lfilter = self.graph.entity_set(ls).and_then(|s| s.filter);
                let extended = self.extend_binop(lfilter, rfilter, Op::And, false);
                if let Some(set) = self.graph.entity_set_mut(ls) {
                    set.filter = Some(extended);
                }
            }

            let ls_conjunction = self.graph.entity_set(ls).map(|s| s.conjunction).unwrap();
            let new_conjunction =
                self.intersect_paths(ls_conjunction, rs_data.conjunction, merge_filters, loc)?;
            {
                let rs_view = self.graph.entity_set(rs).cloned();
                let set = self
                    .graph
                    .entity_set_mut(ls)
                    .ok_or_else(|| TransformError::tree("lost merge survivor"))?;
                set.conjunction = new_conjunction;
                if let Some(rs_view) = rs_view {
                    set.atomrefs.extend(rs_view.atomrefs.iter().copied());
                    set.metarefs.extend(rs_view.metarefs.iter().copied());
                    set.users.extend(rs_view.users.iter().cloned());
                    set.joins.extend(rs_view.joins.iter().copied());
                    set.conceptfilter.extend(rs_view.conceptfilter.iter().cloned());
                }
                set.joins.remove(&ls);
            }

            let ls_disjunction = self.graph.entity_set(ls).map(|s| s.disjunction).unwrap();
            let disjunction =
                self.intersect_paths(ls_disjunction, rs_data.disjunction, merge_filters, loc)?;

            let empty_disjunction = self.graph.new_disjunction(BTreeSet::new());
            if let Some(set) = self.graph.entity_set_mut(ls) {
                set.disjunction = empty_disjunction;
            }

            if self.graph.is_disjunction(disjunction) {
                if let Some(set) = self.graph.entity_set_mut(ls) {
                    set.disjunction = disjunction;
                }
                if self.paths_of(disjunction).len() == 1 {
                    let first = self.first_path(disjunction).expect("singleton");
                    if self.graph.is_conjunction(first) {
                        let fresh = self.graph.new_disjunction(BTreeSet::new());
                        if let Some(set) = self.graph.entity_set_mut(ls) {
                            set.conjunction = first;
                            set.disjunction = fresh;
                        }
                    }
                }
            } else if !self.combination_is_empty(disjunction) {
                let conj = self.graph.entity_set(ls).map(|s| s.conjunction).unwrap();
                let folded = self.intersect_paths(conj, disjunction, merge_filters, loc)?;
                if let Some(set) = self.graph.entity_set_mut(ls) {
                    set.conjunction = folded;
                }
                let folded = self.graph.entity_set(ls).map(|s| s.conjunction).unwrap();
                self.flatten_path_combination(folded, false)?;
                if self.paths_of(folded).len() == 1 {
                    let first = self.first_path(folded).expect("singleton");
                    if self.graph.is_disjunction(first) {
                        let fresh = self.graph.new_conjunction(BTreeSet::new());
                        if let Some(set) = self.graph.entity_set_mut(ls) {
                            set.disjunction = first;
                            set.conjunction = fresh;
                        }
                    }
                }
            }
        }

        if let Some(ls) = left_set {
            Ok(ls)
        } else if let Some(rs) = right_set {
            Ok(rs)
        } else {
            left_link.ok_or_else(|| TransformError::tree("path merge produced nothing"))
        }
    }

    fn intersect_with_disjunction(
        &mut self,
        disjunction: NodeId,
        path: NodeId,
    ) -> TransformResult<NodeId> {
        Ok(self
            .graph
            .new_conjunction([disjunction, path].into_iter().collect()))
    }

    fn intersect_with_conjunction(
        &mut self,
        conjunction: NodeId,
        path: NodeId,
        loc: Location,
    ) -> TransformResult<NodeId> {
        for cpath in self.paths_of(conjunction) {
            if self.graph.is_set_or_link(cpath) {
                let merged = self.intersect_sets(cpath, path, false, loc)?;
                if merged == cpath {
                    return Ok(conjunction);
                }
            }
        }
        let mut paths = self.paths_of(conjunction);
        paths.insert(path);
        Ok(self.graph.new_conjunction(paths))
    }

    fn intersect_conjunctions(
        &mut self,
        left: NodeId,
        right: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        let mut paths = self.paths_of(left);
        paths.extend(self.paths_of(right));
        let result = self.graph.new_conjunction(paths);
        if self.paths_of(result).len() > 1 {
            self.flatten_path_combination(result, false)?;
            let members = self.paths_of(result);
            self.unify_paths(members, CombinationKind::Conjunction, false, merge_filters, loc)?;
        }
        Ok(result)
    }

    /// Produce a conjunction of two disjunctions by unrolling the cartesian
    /// product and minimizing the unrolled form: `(a|b) & (c|d)` becomes
    /// `ac | ad | bc | bd`, which usually collapses because the pairwise
    /// intersections merge.
    fn intersect_disjunctions(
        &mut self,
        left: NodeId,
        right: NodeId,
        loc: Location,
    ) -> TransformResult<NodeId> {
        let left_paths = self.paths_of(left);
        let right_paths = self.paths_of(right);

        if !left_paths.is_empty() && !right_paths.is_empty() {
            let mut paths = BTreeSet::new();
            for l in &left_paths {
                for r in &right_paths {
                    paths.insert(self.intersect_paths(*l, *r, false, loc)?);
                }
            }
            self.minimize_disjunction(paths)
        } else {
            let paths = if left_paths.is_empty() {
                right_paths
            } else {
                left_paths
            };
            Ok(if paths.len() <= 1 {
                self.graph.new_conjunction(paths)
            } else {
                self.graph.new_disjunction(paths)
            })
        }
    }

    fn intersect_disjunction_with_conjunction(
        &mut self,
        disjunction: NodeId,
        conjunction: NodeId,
    ) -> TransformResult<NodeId> {
        let d_empty = self.combination_is_empty(disjunction);
        let c_empty = self.combination_is_empty(conjunction);
        Ok(if !d_empty && !c_empty {
            self.graph
                .new_disjunction([disjunction, conjunction].into_iter().collect())
        } else if !c_empty {
            conjunction
        } else if !d_empty {
            self.graph
                .new_conjunction([disjunction].into_iter().collect())
        } else {
            self.graph.new_conjunction(BTreeSet::new())
        })
    }

    /// Conjunctive composition, dispatching on the operand variants.
    pub(crate) fn intersect_paths(
        &mut self,
        left: NodeId,
        right: NodeId,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        use CombinationKind::*;
        let lkind = self.operand_kind(left)?;
        let rkind = self.operand_kind(right)?;
        match (lkind, rkind) {
            (None, None) => self.intersect_sets(left, right, merge_filters, loc),
            (None, Some(Disjunction)) => self.intersect_with_disjunction(right, left),
            (None, Some(Conjunction)) => self.intersect_with_conjunction(right, left, loc),
            (Some(Disjunction), None) => self.intersect_with_disjunction(left, right),
            (Some(Disjunction), Some(Disjunction)) => {
                self.intersect_disjunctions(left, right, loc)
            }
            (Some(Disjunction), Some(Conjunction)) => {
                self.intersect_disjunction_with_conjunction(left, right)
            }
            (Some(Conjunction), None) => self.intersect_with_conjunction(left, right, loc),
            (Some(Conjunction), Some(Disjunction)) => {
                self.intersect_disjunction_with_conjunction(right, left)
            }
            (Some(Conjunction), Some(Conjunction)) => {
                self.intersect_conjunctions(left, right, merge_filters, loc)
            }
        }
    }

    // ------------------------------------------------------------------
    // Flattening and unification
    // ------------------------------------------------------------------

    /// Strip same-kind nesting: a disjunction of disjunctions becomes one
    /// disjunction (and dually). With `recursive`, nested combinations of
    /// either kind are flattened all the way down first.
    pub fn flatten_path_combination(
        &mut self,
        expr: NodeId,
        recursive: bool,
    ) -> TransformResult<NodeId> {
        let Some(kind) = self.graph.combination_kind(expr) else {
            return Ok(expr);
        };
        let mut flattened = BTreeSet::new();
        for path in self.paths_of(expr) {
            match self.graph.combination_kind(path) {
                Some(child_kind) => {
                    let child = if recursive {
                        self.flatten_path_combination(path, true)?
                    } else {
                        path
                    };
                    if child_kind == kind {
                        flattened.extend(self.paths_of(child));
                    } else if recursive {
                        flattened.insert(child);
                    } else {
                        flattened.insert(path);
                    }
                }
                None => {
                    flattened.insert(path);
                }
            }
        }
        self.set_paths(expr, flattened);
        Ok(expr)
    }

    /// Flatten, optionally deep-merge every member, then unify the member
    /// set under the combination's own mode.
    pub(crate) fn flatten_and_unify_path_combination(
        &mut self,
        expr: NodeId,
        deep: bool,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<NodeId> {
        let kind = self.graph.combination_kind(expr).ok_or_else(|| {
            TransformError::tree(format!(
                "expected a path combination, found {}",
                self.graph.node(expr).kind_name()
            ))
        })?;
        self.flatten_path_combination(expr, false)?;

        if deep {
            let mut merged = BTreeSet::new();
            for path in self.paths_of(expr) {
                merged.insert(self.merge_paths(path, loc)?);
            }
            self.set_paths(expr, merged);
        }

        let members = self.paths_of(expr);
        self.unify_paths(members, kind, true, merge_filters, loc)?;
        Ok(expr)
    }

    /// Reduce a set of paths pairwise, additively (`Disjunction`) or
    /// multiplicatively (`Conjunction`). The result is independent of the
    /// order the set is drained in.
    pub fn unify_paths(
        &mut self,
        paths: BTreeSet<NodeId>,
        mode: CombinationKind,
        reverse: bool,
        merge_filters: bool,
        loc: Location,
    ) -> TransformResult<Option<NodeId>> {
        let opts = ExtractOpts::new()
            .reverse(reverse)
            .resolve_arefs(true)
            .recurse(Recurse::No);
        let mut queue: Vec<NodeId> = paths.into_iter().collect();
        queue.reverse();

        let mut result = None;
        while result.is_none() {
            let Some(next) = queue.pop() else {
                return Ok(None);
            };
            result = self.extract_paths(next, opts, loc)?;
        }

        while let Some(next) = queue.pop() {
            let Some(path) = self.extract_paths(next, opts, loc)? else {
                continue;
            };
            let acc = result.expect("accumulator set above");
            result = Some(match mode {
                CombinationKind::Disjunction => self.add_paths(acc, path, merge_filters, loc)?,
                CombinationKind::Conjunction => {
                    self.intersect_paths(acc, path, merge_filters, loc)?
                }
            });
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Path extraction
    // ------------------------------------------------------------------

    /// Walk an expression down to the path nodes it stands on. With
    /// `reverse`, every entity set is walked back to its navigation root;
    /// with `resolve_arefs`, atomic references resolve to their owning
    /// sets. Subqueries are opaque unless `recurse` says otherwise.
    /// Constants have no paths.
    pub fn extract_paths(
        &mut self,
        path: NodeId,
        opts: ExtractOpts,
        loc: Location,
    ) -> TransformResult<Option<NodeId>> {
        match self.graph.node(path).clone() {
            GirNode::GraphExpr(graph_expr) => {
                if opts.recurse == Recurse::No {
                    return Ok(None);
                }
                let child_opts = if opts.recurse == Recurse::Once {
                    opts.recurse(Recurse::No)
                } else {
                    opts
                };
                let mut paths = BTreeSet::new();
                if let Some(generator) = graph_expr.generator {
                    if let Some(p) = self.extract_paths(generator, child_opts, loc)? {
                        paths.insert(p);
                    }
                }
                for item in &graph_expr.selector {
                    if let Some(p) = self.extract_paths(item.expr, child_opts, loc)? {
                        paths.insert(p);
                    }
                }
                for id in &graph_expr.grouper {
                    if let Some(p) = self.extract_paths(*id, child_opts, loc)? {
                        paths.insert(p);
                    }
                }
                for item in &graph_expr.sorter {
                    if let Some(p) = self.extract_paths(item.expr, child_opts, loc)? {
                        paths.insert(p);
                    }
                }
                if paths.len() == 1 {
                    Ok(paths.into_iter().next())
                } else {
                    let result = self.graph.new_disjunction(paths);
                    Ok(Some(self.flatten_path_combination(result, false)?))
                }
            }

            GirNode::EntitySet(_)
            | GirNode::InlineFilter(_)
            | GirNode::AtomicRefSimple(_)
            | GirNode::MetaRef(_)
            | GirNode::AtomicRefExpr(_) => {
                let mut result = path;
                if !self.graph.is_entity_set(path) && (opts.resolve_arefs || opts.reverse) {
                    match self.graph.ref_of(path) {
                        Some(ref_id) => result = ref_id,
                        None => {
                            // An expression ref that never acquired an owner
                            // contributes the paths of its expression.
                            if let GirNode::AtomicRefExpr(r) = self.graph.node(path).clone() {
                                return self.extract_paths(r.expr, opts, loc);
                            }
                            return Ok(Some(path));
                        }
                    }
                }
                if opts.reverse && self.graph.is_entity_set(result) {
                    while let Some(rlink) = self.graph.entity_set(result).and_then(|s| s.rlink) {
                        match self.graph.entity_link(rlink).and_then(|l| l.source) {
                            Some(source) => result = source,
                            None => break,
                        }
                    }
                }
                Ok(Some(result))
            }

            GirNode::InlinePropFilter(f) => self.extract_paths(f.ref_id, opts, loc),

            GirNode::LinkPropRefSimple(r) => {
                if opts.resolve_arefs || opts.reverse {
                    self.extract_paths(r.ref_id, opts, loc)
                } else {
                    Ok(Some(path))
                }
            }
            GirNode::LinkPropRefExpr(r) => {
                if opts.resolve_arefs || opts.reverse {
                    match r.ref_id {
                        Some(ref_id) => self.extract_paths(ref_id, opts, loc),
                        None => self.extract_paths(r.expr, opts, loc),
                    }
                } else {
                    Ok(Some(path))
                }
            }

            GirNode::EntityLink(link) => {
                if opts.reverse {
                    match link.source {
                        Some(source) => {
                            let mut result = source;
                            while let Some(rlink) =
                                self.graph.entity_set(result).and_then(|s| s.rlink)
                            {
                                match self.graph.entity_link(rlink).and_then(|l| l.source) {
                                    Some(s) => result = s,
                                    None => break,
                                }
                            }
                            Ok(Some(result))
                        }
                        None => Ok(Some(path)),
                    }
                } else {
                    Ok(Some(path))
                }
            }

            GirNode::Conjunction(ps) | GirNode::Disjunction(ps) => {
                let kind = self.graph.combination_kind(path).expect("combination");
                let mut result = BTreeSet::new();
                for p in ps.paths {
                    if let Some(normalized) = self.extract_paths(p, opts, loc)? {
                        result.insert(normalized);
                    }
                }
                if result.len() == 1 {
                    Ok(result.into_iter().next())
                } else {
                    let combined = self.graph.new_combination(kind, result);
                    Ok(Some(self.flatten_path_combination(combined, false)?))
                }
            }

            GirNode::BinOp(binop) => {
                let kind = if self.is_weak_op(binop.op, loc) {
                    CombinationKind::Disjunction
                } else {
                    CombinationKind::Conjunction
                };
                let mut paths = BTreeSet::new();
                for operand in [binop.left, binop.right] {
                    if let Some(normalized) = self.extract_paths(operand, opts, loc)? {
                        paths.insert(normalized);
                    }
                }
                if paths.len() == 1 {
                    Ok(paths.into_iter().next())
                } else if paths.is_empty() {
                    Ok(None)
                } else {
                    let combined = self.graph.new_combination(kind, paths);
                    Ok(Some(self.flatten_path_combination(combined, false)?))
                }
            }

            GirNode::UnaryOp(u) => self.extract_paths(u.expr, opts, loc),
            GirNode::TypeCast(c) => self.extract_paths(c.expr, opts, loc),
            GirNode::NoneTest(n) => self.extract_paths(n.expr, opts, loc),

            GirNode::FunctionCall(call) => {
                let mut paths = BTreeSet::new();
                for arg in call.args {
                    if let Some(normalized) = self.extract_paths(arg, opts, loc)? {
                        paths.insert(normalized);
                    }
                }
                if paths.len() == 1 {
                    Ok(paths.into_iter().next())
                } else if paths.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(self.graph.new_conjunction(paths)))
                }
            }

            GirNode::Sequence(s) => self.extract_element_paths(s.elements, opts, loc),
            GirNode::Record(r) => self.extract_element_paths(r.elements, opts, loc),

            GirNode::Constant(_) => Ok(None),
        }
    }

    fn extract_element_paths(
        &mut self,
        elements: Vec<NodeId>,
        opts: ExtractOpts,
        loc: Location,
    ) -> TransformResult<Option<NodeId>> {
        let mut paths = BTreeSet::new();
        for element in elements {
            if let Some(normalized) = self.extract_paths(element, opts, loc)? {
                paths.insert(normalized);
            }
        }
        if paths.len() == 1 {
            Ok(paths.into_iter().next())
        } else if paths.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.graph.new_disjunction(paths)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::concept_catalog::{FullName, Schema};
    use crate::gir::{EntityLink, GirNode, LinkFilter};
    use crate::ops::Direction;

    fn transformer(schema: &Schema) -> Transformer<'_> {
        Transformer::new(schema, BTreeMap::new(), BTreeMap::new())
    }

    fn user() -> FullName {
        FullName::new("test", "User")
    }

    fn friend_labels() -> std::collections::BTreeSet<FullName> {
        [FullName::new("test", "friend")].into_iter().collect()
    }

    /// A root set plus an outgoing `friend` link. With `concrete_target`
    /// the link points at a built target set, otherwise it is left with a
    /// wildcard (null) target.
    fn friend_link(t: &mut Transformer<'_>, concrete_target: bool) -> (NodeId, NodeId) {
        let root = t
            .graph
            .new_entity_set(user(), LinearPath::from_origin(user()), None);
        let link = t.graph.alloc(GirNode::EntityLink(EntityLink {
            source: Some(root),
            target: None,
            link_proto: FullName::new("test", "friend"),
            filter: Some(LinkFilter {
                labels: friend_labels(),
                direction: Direction::Outbound,
            }),
            propfilter: None,
            proprefs: Default::default(),
            users: Default::default(),
            anchor: None,
        }));
        if concrete_target {
            let id = LinearPath::from_origin(user()).extended(
                friend_labels(),
                Direction::Outbound,
                Some(user()),
            );
            let target = t.graph.new_entity_set(user(), id, None);
            if let Some(l) = t.graph.entity_link_mut(link) {
                l.target = Some(target);
            }
            if let Some(s) = t.graph.entity_set_mut(target) {
                s.rlink = Some(link);
            }
        }
        let disjunction = t.graph.entity_set(root).unwrap().disjunction;
        t.set_paths(disjunction, [link].into_iter().collect());
        (root, link)
    }

    #[test]
    fn wildcard_tail_matches_concrete_tail() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let (_, wild) = friend_link(&mut t, false);
        let (_, concrete) = friend_link(&mut t, true);
        assert!(t.match_prefixes(wild, concrete, false).is_some());
        assert!(t.match_prefixes(concrete, wild, false).is_some());
    }

    #[test]
    fn differing_links_do_not_match() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let (_, a) = friend_link(&mut t, true);
        let (root_b, b) = friend_link(&mut t, true);
        // Same shape matches; a different label does not.
        assert!(t.match_prefixes(a, b, false).is_some());
        if let Some(l) = t.graph.entity_link_mut(b) {
            l.filter = Some(LinkFilter {
                labels: [FullName::new("test", "enemy")].into_iter().collect(),
                direction: Direction::Outbound,
            });
        }
        assert!(t.match_prefixes(a, b, false).is_none());
        let _ = root_b;
    }

    #[test]
    fn add_sets_fuses_equal_roots() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let a = t
            .graph
            .new_entity_set(user(), LinearPath::from_origin(user()), None);
        let b = t
            .graph
            .new_entity_set(user(), LinearPath::from_origin(user()), None);
        let merged = t.add_sets(a, b, true, Location::Generator).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn add_sets_keeps_distinct_roots_apart() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let a = t
            .graph
            .new_entity_set(user(), LinearPath::from_origin(user()), None);
        let other = FullName::new("test", "Post");
        let b = t
            .graph
            .new_entity_set(other.clone(), LinearPath::from_origin(other), None);
        let merged = t.add_sets(a, b, true, Location::Generator).unwrap();
        assert!(t.graph.is_disjunction(merged));
        assert_eq!(t.paths_of(merged).len(), 2);
    }

    #[test]
    fn flattening_strips_same_kind_nesting() {
        let schema = Schema::new("test");
        let mut t = transformer(&schema);
        let a = t
            .graph
            .new_entity_set(user(), LinearPath::from_origin(user()), None);
        let post = FullName::new("test", "Post");
        let b = t
            .graph
            .new_entity_set(post.clone(), LinearPath::from_origin(post.clone()), None);
        let c_name = FullName::new("test", "Comment");
        let c = t
            .graph
            .new_entity_set(c_name.clone(), LinearPath::from_origin(c_name), None);

        let inner = t.graph.new_disjunction([a, b].into_iter().collect());
        let outer = t.graph.new_disjunction([inner, c].into_iter().collect());
        t.flatten_path_combination(outer, false).unwrap();
        assert_eq!(t.paths_of(outer).len(), 3);
        assert!(t.paths_of(outer).contains(&a));
        assert!(t.paths_of(outer).contains(&c));
    }

    #[test]
    fn unify_is_unaffected_by_construction_order() {
        let schema = Schema::new("test");

        // Unification drains its input in node order, so building the
        // navigated path before or after the bare root changes which
        // operand is merged into which; the outcome must not.
        let digest_for = |chain_first: bool| {
            let mut t = transformer(&schema);
            let (chain_root, bare_root) = if chain_first {
                let (chain_root, _) = friend_link(&mut t, true);
                let bare =
                    t.graph
                        .new_entity_set(user(), LinearPath::from_origin(user()), None);
                (chain_root, bare)
            } else {
                let bare =
                    t.graph
                        .new_entity_set(user(), LinearPath::from_origin(user()), None);
                let (chain_root, _) = friend_link(&mut t, true);
                (chain_root, bare)
            };
            let unified = t
                .unify_paths(
                    [chain_root, bare_root].into_iter().collect(),
                    CombinationKind::Disjunction,
                    true,
                    true,
                    Location::Generator,
                )
                .unwrap()
                .unwrap();
            t.graph.digest(unified)
        };

        assert_eq!(digest_for(true), digest_for(false));
    }
}
