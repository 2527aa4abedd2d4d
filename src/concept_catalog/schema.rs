//! In-memory schema catalog.
//!
//! The analyzer treats the catalog as a read-only collaborator: it resolves
//! surface names to prototypes, answers subtype questions, enumerates
//! pointers through the inheritance lattice, and lists the searchable links
//! of a concept. One `Schema` instance may serve any number of concurrent
//! transformations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::errors::SchemaError;
use super::names::{resolve_name, FullName, ID_POINTER, UUID_ATOM};
use super::schema_types::{AtomDef, ConceptDef, LinkDef, PointerTarget, SchemaObject};

lazy_static::lazy_static! {
    /// The implicit identity pointer every concept carries. It is not stored
    /// per concept; `get_attr` synthesizes it on demand.
    static ref ID_LINK: LinkDef = LinkDef {
        name: ID_POINTER.clone(),
        source: FullName::std("Object"),
        target: PointerTarget::Atom(UUID_ATOM.clone()),
        search: None,
        properties: BTreeMap::new(),
    };

    static ref BUILTIN_ATOMS: Vec<AtomDef> = ["str", "int", "float", "bool", "uuid", "decimal"]
        .iter()
        .map(|n| AtomDef { name: FullName::std(*n), base: None })
        .collect();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    default_module: String,
    concepts: BTreeMap<FullName, ConceptDef>,
    links: BTreeMap<FullName, LinkDef>,
    atoms: BTreeMap<FullName, AtomDef>,
}

impl Schema {
    pub fn new(default_module: impl Into<String>) -> Self {
        let mut schema = Schema {
            default_module: default_module.into(),
            concepts: BTreeMap::new(),
            links: BTreeMap::new(),
            atoms: BTreeMap::new(),
        };
        for atom in BUILTIN_ATOMS.iter() {
            schema.atoms.insert(atom.name.clone(), atom.clone());
        }
        schema
    }

    /// Load a catalog from its JSON document form.
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        let loaded: Schema = serde_json::from_str(document)?;
        let mut schema = Schema::new(loaded.default_module.clone());
        schema.concepts = loaded.concepts;
        schema.links = loaded.links;
        for (name, atom) in loaded.atoms {
            schema.atoms.insert(name, atom);
        }
        Ok(schema)
    }

    pub fn default_module(&self) -> &str {
        &self.default_module
    }

    pub fn add_concept(&mut self, concept: ConceptDef) -> &mut Self {
        self.concepts.insert(concept.name.clone(), concept);
        self
    }

    pub fn add_link(&mut self, link: LinkDef) -> &mut Self {
        if let Some(concept) = self.concepts.get_mut(&link.source) {
            concept.own_pointers.insert(link.name.clone());
        }
        self.links.insert(link.name.clone(), link);
        self
    }

    pub fn add_atom(&mut self, atom: AtomDef) -> &mut Self {
        self.atoms.insert(atom.name.clone(), atom);
        self
    }

    /// Resolve a raw surface name to a fully qualified one, honoring the
    /// per-query module aliases.
    pub fn resolve(
        &self,
        raw: &str,
        aliases: &BTreeMap<String, String>,
    ) -> Result<FullName, SchemaError> {
        let name = resolve_name(raw, &self.default_module, aliases)?;
        if self.contains(&name) {
            return Ok(name);
        }
        // Unqualified builtins resolve into std when the default module has
        // no object of that name.
        if name.module == self.default_module && !raw.contains("::") {
            let std_name = FullName::std(raw);
            if self.contains(&std_name) {
                return Ok(std_name);
            }
        }
        Ok(name)
    }

    fn contains(&self, name: &FullName) -> bool {
        self.concepts.contains_key(name)
            || self.links.contains_key(name)
            || self.atoms.contains_key(name)
            || *name == *ID_POINTER
    }

    pub fn get(&self, name: &FullName) -> Result<SchemaObject<'_>, SchemaError> {
        if let Some(c) = self.concepts.get(name) {
            return Ok(SchemaObject::Concept(c));
        }
        if let Some(l) = self.links.get(name) {
            return Ok(SchemaObject::Link(l));
        }
        if name == &*ID_POINTER {
            return Ok(SchemaObject::Link(&ID_LINK));
        }
        if let Some(a) = self.atoms.get(name) {
            return Ok(SchemaObject::Atom(a));
        }
        Err(SchemaError::NotFound {
            kind: "object",
            name: name.to_string(),
        })
    }

    pub fn get_concept(&self, name: &FullName) -> Result<&ConceptDef, SchemaError> {
        self.concepts.get(name).ok_or_else(|| SchemaError::NotFound {
            kind: "concept",
            name: name.to_string(),
        })
    }

    pub fn get_link(&self, name: &FullName) -> Result<&LinkDef, SchemaError> {
        if name == &*ID_POINTER {
            return Ok(&ID_LINK);
        }
        self.links.get(name).ok_or_else(|| SchemaError::NotFound {
            kind: "link",
            name: name.to_string(),
        })
    }

    pub fn get_atom(&self, name: &FullName) -> Result<&AtomDef, SchemaError> {
        self.atoms.get(name).ok_or_else(|| SchemaError::NotFound {
            kind: "atom",
            name: name.to_string(),
        })
    }

    /// True when `sub` is `sup` or transitively derives from it.
    pub fn issubclass(&self, sub: &FullName, sup: &FullName) -> bool {
        if sub == sup {
            return true;
        }
        let Ok(concept) = self.get_concept(sub) else {
            return false;
        };
        concept.bases.iter().any(|base| self.issubclass(base, sup))
    }

    /// All strict descendants of `concept`.
    pub fn descendants(&self, concept: &FullName) -> BTreeSet<FullName> {
        self.concepts
            .keys()
            .filter(|name| *name != concept && self.issubclass(name, concept))
            .cloned()
            .collect()
    }

    /// Descendants of `concept` satisfying `predicate`.
    pub fn filter_children<P>(&self, concept: &FullName, predicate: P) -> BTreeSet<FullName>
    where
        P: Fn(&FullName) -> bool,
    {
        self.descendants(concept)
            .into_iter()
            .filter(|c| predicate(c))
            .collect()
    }

    /// Every pointer applicable to `concept`, own and inherited, keyed by
    /// link name. A pointer redeclared on a subclass shadows the base one.
    pub fn pointers(&self, concept: &FullName) -> BTreeMap<FullName, &LinkDef> {
        let mut out = BTreeMap::new();
        self.collect_pointers(concept, &mut out);
        out
    }

    fn collect_pointers<'a>(&'a self, concept: &FullName, out: &mut BTreeMap<FullName, &'a LinkDef>) {
        let Ok(def) = self.get_concept(concept) else {
            return;
        };
        for base in &def.bases {
            self.collect_pointers(base, out);
        }
        for pointer in &def.own_pointers {
            if let Some(link) = self.links.get(pointer) {
                out.insert(pointer.clone(), link);
            }
        }
    }

    /// Look up one pointer of `concept`, through the inheritance lattice.
    /// Every concept implicitly has the builtin identity pointer.
    pub fn get_attr(&self, concept: &FullName, pointer: &FullName) -> Option<&LinkDef> {
        if pointer == &*ID_POINTER {
            return Some(&ID_LINK);
        }
        if let Some(link) = self.links.get(pointer) {
            if self.issubclass(concept, &link.source) {
                return Some(link);
            }
        }
        self.pointers(concept).get(pointer).copied()
    }

    /// Links of `concept` participating in full-text search, ordered by
    /// descending weight, then name.
    pub fn get_searchable_links(&self, concept: &FullName) -> Vec<&LinkDef> {
        let mut links: Vec<&LinkDef> = self
            .pointers(concept)
            .into_values()
            .filter(|l| l.search.is_some())
            .collect();
        links.sort_by(|a, b| {
            let wa = a.search.map(|s| s.weight).unwrap_or(0);
            let wb = b.search.map(|s| s.weight).unwrap_or(0);
            wb.cmp(&wa).then_with(|| a.name.cmp(&b.name))
        });
        links
    }

    /// The ancestor of `concept` that declares `pointer`: the nearest one,
    /// or with `farthest` the topmost declaring ancestor.
    pub fn get_pointer_origin(
        &self,
        concept: &FullName,
        pointer: &FullName,
        farthest: bool,
    ) -> Option<FullName> {
        let mut found = None;
        let mut frontier = vec![concept.clone()];
        while let Some(current) = frontier.pop() {
            let Ok(def) = self.get_concept(&current) else {
                continue;
            };
            if def.own_pointers.contains(pointer) {
                if !farthest {
                    return Some(current);
                }
                found = Some(current.clone());
            }
            frontier.extend(def.bases.iter().cloned());
        }
        found
    }

    /// Nearest common ancestor of a set of concepts. Atoms only unify with
    /// themselves.
    pub fn nearest_common_ancestor(
        &self,
        names: &[FullName],
    ) -> Result<FullName, SchemaError> {
        let Some((first, rest)) = names.split_first() else {
            return Err(SchemaError::NotFound {
                kind: "concept",
                name: "<empty ancestor set>".to_string(),
            });
        };
        let mut candidates = self.ancestor_chain(first);
        for name in rest {
            let chain = self.ancestor_chain(name);
            candidates.retain(|c| chain.contains(c));
        }
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| SchemaError::NoCommonAncestor {
                left: first.to_string(),
                right: names.last().map(|n| n.to_string()).unwrap_or_default(),
            })
    }

    /// Self plus ancestors, nearest first (breadth-first over bases).
    fn ancestor_chain(&self, name: &FullName) -> Vec<FullName> {
        let mut chain = vec![name.clone()];
        let mut cursor = 0;
        while cursor < chain.len() {
            let current = chain[cursor].clone();
            cursor += 1;
            if let Ok(def) = self.get_concept(&current) {
                for base in &def.bases {
                    if !chain.contains(base) {
                        chain.push(base.clone());
                    }
                }
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept_catalog::schema_types::SearchSpec;

    fn sample_schema() -> Schema {
        let mut schema = Schema::new("test");
        schema.add_concept(ConceptDef {
            name: FullName::new("test", "Named"),
            bases: BTreeSet::new(),
            own_pointers: BTreeSet::new(),
        });
        schema.add_concept(ConceptDef {
            name: FullName::new("test", "User"),
            bases: [FullName::new("test", "Named")].into_iter().collect(),
            own_pointers: BTreeSet::new(),
        });
        schema.add_concept(ConceptDef {
            name: FullName::new("test", "Admin"),
            bases: [FullName::new("test", "User")].into_iter().collect(),
            own_pointers: BTreeSet::new(),
        });
        schema.add_link(LinkDef {
            name: FullName::new("test", "name"),
            source: FullName::new("test", "Named"),
            target: PointerTarget::Atom(FullName::std("str")),
            search: Some(SearchSpec { weight: 10 }),
            properties: BTreeMap::new(),
        });
        schema
    }

    #[test]
    fn subtype_lattice_is_transitive() {
        let schema = sample_schema();
        let named = FullName::new("test", "Named");
        let admin = FullName::new("test", "Admin");
        assert!(schema.issubclass(&admin, &named));
        assert!(!schema.issubclass(&named, &admin));
    }

    #[test]
    fn pointers_are_inherited() {
        let schema = sample_schema();
        let admin = FullName::new("test", "Admin");
        let name_ptr = FullName::new("test", "name");
        assert!(schema.get_attr(&admin, &name_ptr).is_some());
        assert!(schema.get_attr(&admin, &ID_POINTER).is_some());
    }

    #[test]
    fn pointer_origin_walks_to_declaring_base() {
        let schema = sample_schema();
        let admin = FullName::new("test", "Admin");
        let name_ptr = FullName::new("test", "name");
        let origin = schema.get_pointer_origin(&admin, &name_ptr, true).unwrap();
        assert_eq!(origin, FullName::new("test", "Named"));
    }

    #[test]
    fn searchable_links_come_back_weight_ordered() {
        let schema = sample_schema();
        let user = FullName::new("test", "User");
        let links = schema.get_searchable_links(&user);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, FullName::new("test", "name"));
    }

    #[test]
    fn catalog_round_trips_through_json() {
        let schema = sample_schema();
        let document = serde_json::to_string(&schema).expect("serialize");
        let loaded = Schema::from_json(&document).expect("load");
        assert!(loaded.get_concept(&FullName::new("test", "User")).is_ok());
        assert!(loaded.get_link(&FullName::new("test", "name")).is_ok());
        assert!(loaded.get_atom(&FullName::std("str")).is_ok());
    }

    #[test]
    fn filter_children_excludes_named_concept() {
        let schema = sample_schema();
        let user = FullName::new("test", "User");
        let admin = FullName::new("test", "Admin");
        let kept = schema.filter_children(&user, |c| *c != admin);
        assert!(kept.is_empty());
        let all = schema.filter_children(&user, |_| true);
        assert_eq!(all.len(), 1);
    }
}
