//! Canonical path identity.
//!
//! A [`LinearPath`] names a navigation from a root concept through a
//! sequence of link steps. It is the hash key the normalizer uses to decide
//! whether two graph nodes stand for the same navigation and may be fused.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::concept_catalog::FullName;
use crate::ops::Direction;

/// One link traversal step. `labels` is a set so a step can cover several
/// polymorphic link prototypes at once; `target` is `None` for a wildcard
/// tail ("any concept reachable over these labels"), which only ever occurs
/// on the final step during prefix matching.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinearPathStep {
    pub labels: BTreeSet<FullName>,
    pub direction: Direction,
    pub target: Option<FullName>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinearPath {
    origin: FullName,
    steps: Vec<LinearPathStep>,
}

impl LinearPath {
    pub fn from_origin(origin: FullName) -> LinearPath {
        LinearPath {
            origin,
            steps: Vec::new(),
        }
    }

    pub fn origin(&self) -> &FullName {
        &self.origin
    }

    pub fn steps(&self) -> &[LinearPathStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append one step.
    pub fn add(
        &mut self,
        labels: BTreeSet<FullName>,
        direction: Direction,
        target: Option<FullName>,
    ) {
        self.steps.push(LinearPathStep {
            labels,
            direction,
            target,
        });
    }

    /// Copy with one more step; the common way to extend a parent identity.
    pub fn extended(
        &self,
        labels: BTreeSet<FullName>,
        direction: Direction,
        target: Option<FullName>,
    ) -> LinearPath {
        let mut next = self.clone();
        next.add(labels, direction, target);
        next
    }

    /// The concept the path ends at: the last step's target, or the origin
    /// for a bare root path.
    pub fn last_target(&self) -> Option<&FullName> {
        match self.steps.last() {
            Some(step) => step.target.as_ref(),
            None => Some(&self.origin),
        }
    }

    /// True when the final step has a wildcard target.
    pub fn ends_wildcard(&self) -> bool {
        matches!(self.steps.last(), Some(step) if step.target.is_none())
    }

    /// Copy with the final step's target erased. A bare root path has no
    /// step to erase and is returned unchanged.
    pub fn with_wildcard_tail(&self) -> LinearPath {
        let mut out = self.clone();
        if let Some(step) = out.steps.last_mut() {
            step.target = None;
        }
        out
    }
}

impl fmt::Display for LinearPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.origin)?;
        for step in &self.steps {
            let labels: Vec<String> = step.labels.iter().map(|l| l.to_string()).collect();
            write!(f, ".{}[{}]", step.direction, labels.join("|"))?;
            match &step.target {
                Some(target) => write!(f, "({target})")?,
                None => write!(f, "(*)")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(name: &str) -> BTreeSet<FullName> {
        [FullName::new("test", name)].into_iter().collect()
    }

    fn user_friend() -> LinearPath {
        let mut path = LinearPath::from_origin(FullName::new("test", "User"));
        path.add(
            labels("friend"),
            Direction::Outbound,
            Some(FullName::new("test", "User")),
        );
        path
    }

    #[test]
    fn identity_is_structural() {
        assert_eq!(user_friend(), user_friend());
        let mut other = user_friend();
        other.add(labels("name"), Direction::Outbound, None);
        assert_ne!(user_friend(), other);
    }

    #[test]
    fn wildcard_tail_erases_only_the_last_target() {
        let path = user_friend();
        let wild = path.with_wildcard_tail();
        assert!(wild.ends_wildcard());
        assert_eq!(wild.origin(), path.origin());
        assert_eq!(path.with_wildcard_tail(), wild);
    }

    #[test]
    fn root_path_last_target_is_the_origin() {
        let root = LinearPath::from_origin(FullName::new("test", "User"));
        assert_eq!(root.last_target(), Some(&FullName::new("test", "User")));
        assert!(!root.ends_wildcard());
    }
}
