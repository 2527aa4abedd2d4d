//! Boolean minimization of path disjunctions.
//!
//! Unrolling a conjunction of disjunctions concentrates redundancy:
//! `(a|b) & (c|d)` becomes `ac | ad | bc | bd`, and after pairwise path
//! merging many of the product terms coincide or absorb each other. This
//! module encodes each term as a bitmask over the distinct link variables,
//! runs Quine-McCluskey minimization, and rebuilds the surviving terms as
//! conjunctions.

use std::collections::{BTreeMap, BTreeSet};

use crate::gir::NodeId;

use super::errors::TransformResult;
use super::Transformer;

/// A partially reduced product term: `mask` selects the significant bit
/// positions, `bits` their required values. Don't-care positions have their
/// mask bit cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Implicant {
    pub bits: u128,
    pub mask: u128,
}

impl Implicant {
    fn covers(&self, minterm: u128) -> bool {
        minterm & self.mask == self.bits
    }
}

/// Quine-McCluskey over minterm masks: combine pairs of implicants that
/// agree everywhere but one position, collect the prime implicants, then
/// pick a cover (essential primes first, greedy for the remainder).
pub fn minimize(terms: &[u128], width: usize) -> Vec<Implicant> {
    if terms.is_empty() {
        return Vec::new();
    }
    let full_mask: u128 = if width >= 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };

    let mut current: BTreeSet<Implicant> = terms
        .iter()
        .map(|t| Implicant {
            bits: *t & full_mask,
            mask: full_mask,
        })
        .collect();
    let mut primes: BTreeSet<Implicant> = BTreeSet::new();

    while !current.is_empty() {
        let items: Vec<Implicant> = current.iter().copied().collect();
        let mut combined: BTreeSet<Implicant> = BTreeSet::new();
        let mut next: BTreeSet<Implicant> = BTreeSet::new();

        for (i, a) in items.iter().enumerate() {
            for b in items.iter().skip(i + 1) {
                if a.mask != b.mask {
                    continue;
                }
                let diff = a.bits ^ b.bits;
                if diff.count_ones() == 1 {
                    next.insert(Implicant {
                        bits: a.bits & !diff,
                        mask: a.mask & !diff,
                    });
                    combined.insert(*a);
                    combined.insert(*b);
                }
            }
        }

        for item in items {
            if !combined.contains(&item) {
                primes.insert(item);
            }
        }
        current = next;
    }

    // Cover selection over the original minterms.
    let minterms: BTreeSet<u128> = terms.iter().map(|t| t & full_mask).collect();
    let mut chosen: Vec<Implicant> = Vec::new();
    let mut uncovered = minterms.clone();

    for minterm in &minterms {
        let covering: Vec<Implicant> = primes.iter().copied().filter(|p| p.covers(*minterm)).collect();
        if covering.len() == 1 && !chosen.contains(&covering[0]) {
            let essential = covering[0];
            uncovered.retain(|m| !essential.covers(*m));
            chosen.push(essential);
        }
    }

    while !uncovered.is_empty() {
        let best = primes
            .iter()
            .copied()
            .filter(|p| !chosen.contains(p))
            .max_by_key(|p| {
                (
                    uncovered.iter().filter(|m| p.covers(**m)).count(),
                    std::cmp::Reverse(*p),
                )
            });
        let Some(best) = best else { break };
        let before = uncovered.len();
        uncovered.retain(|m| !best.covers(*m));
        if uncovered.len() == before {
            break;
        }
        chosen.push(best);
    }

    chosen.sort();
    chosen
}

impl<'a> Transformer<'a> {
    /// Encode a set of product terms as minterm masks over an ordered
    /// variable list: conjunction members become one variable each, any
    /// other path counts as a single variable.
    pub(crate) fn miniterms_from_conjunctions(
        &self,
        paths: &BTreeSet<NodeId>,
    ) -> (Vec<NodeId>, Vec<u128>) {
        let mut variables: Vec<NodeId> = Vec::new();
        let mut positions: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut terms = Vec::new();

        let mut index_of = |variables: &mut Vec<NodeId>,
                            positions: &mut BTreeMap<NodeId, usize>,
                            id: NodeId| {
            *positions.entry(id).or_insert_with(|| {
                variables.push(id);
                variables.len() - 1
            })
        };

        for path in paths {
            let mut term: u128 = 0;
            if self.graph.is_conjunction(*path) {
                for member in self.paths_of(*path) {
                    let index = index_of(&mut variables, &mut positions, member);
                    term |= 1u128 << index;
                }
            } else {
                let index = index_of(&mut variables, &mut positions, *path);
                term |= 1u128 << index;
            }
            terms.push(term);
        }
        (variables, terms)
    }

    /// Rebuild paths from minimized implicants: terms of two or more
    /// positive literals become conjunctions, singletons stay bare.
    pub(crate) fn conjunctions_from_implicants(
        &mut self,
        implicants: &[Implicant],
        variables: &[NodeId],
    ) -> BTreeSet<NodeId> {
        let mut paths = BTreeSet::new();
        for implicant in implicants {
            let members: BTreeSet<NodeId> = variables
                .iter()
                .enumerate()
                .filter(|(i, _)| {
                    let bit = 1u128 << *i;
                    implicant.mask & bit != 0 && implicant.bits & bit != 0
                })
                .map(|(_, id)| *id)
                .collect();
            match members.len() {
                0 => {
                    log::warn!("dropping empty product term during minimization");
                }
                1 => {
                    paths.insert(members.into_iter().next().expect("singleton"));
                }
                _ => {
                    paths.insert(self.graph.new_conjunction(members));
                }
            }
        }
        paths
    }

    /// Minimize a disjunction of product terms and wrap the survivors.
    pub(crate) fn minimize_disjunction(
        &mut self,
        paths: BTreeSet<NodeId>,
    ) -> TransformResult<NodeId> {
        let (variables, terms) = self.miniterms_from_conjunctions(&paths);
        if variables.len() > 128 {
            log::warn!(
                "disjunction over {} link variables exceeds the minimizer width, keeping it as is",
                variables.len()
            );
            return Ok(self.graph.new_disjunction(paths));
        }
        let minimized = minimize(&terms, variables.len());
        let new_paths = self.conjunctions_from_implicants(&minimized, &variables);
        Ok(self.graph.new_disjunction(new_paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Monotone evaluation: a term fires when all its significant positive
    /// positions are present in the assignment.
    fn eval_terms(terms: &[u128], assignment: u128) -> bool {
        terms.iter().any(|t| t & assignment == *t)
    }

    fn eval_implicants(implicants: &[Implicant], assignment: u128) -> bool {
        implicants
            .iter()
            .any(|imp| imp.bits & imp.mask & assignment == imp.bits & imp.mask)
    }

    #[test]
    fn product_expansion_collapses() {
        // ac | ad | bc | bd over variables a=1, b=2, c=4, d=8
        let terms = [0b0101, 0b1001, 0b0110, 0b1010];
        let minimized = minimize(&terms, 4);
        assert!(minimized.len() <= terms.len());
        for assignment in 0..16u128 {
            assert_eq!(
                eval_terms(&terms, assignment),
                eval_implicants(&minimized, assignment),
                "truth mismatch at {assignment:#06b}"
            );
        }
    }

    #[test]
    fn absorption_drops_supersets() {
        // a | ab == a
        let terms = [0b01, 0b11];
        let minimized = minimize(&terms, 2);
        assert_eq!(minimized.len(), 1);
        assert_eq!(minimized[0].bits, 0b01);
    }

    #[test]
    fn single_term_survives_untouched() {
        let terms = [0b101];
        let minimized = minimize(&terms, 3);
        assert_eq!(minimized.len(), 1);
        assert_eq!(minimized[0].bits, 0b101);
        assert_eq!(minimized[0].mask, 0b111);
    }

    #[test]
    fn empty_input_minimizes_to_nothing() {
        assert!(minimize(&[], 0).is_empty());
    }
}
