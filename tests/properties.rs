//! Quantified invariants over normalized graphs: idempotence, flatness,
//! reference-set coherence, the generator role rule, and determinism.

mod common;

use std::collections::BTreeMap;

use common::{entity_sets_of, graph_expr, n, schema, tx};
use conceptql::gir::{GirExprTree, GirNode, NodeId};
use conceptql::ops::Op;
use conceptql::surface_ast::{Expr, PathNode, SelectQuery};
use conceptql::{get_node_references, normalize_refs, renormalize, transform};
use test_case::test_case;

fn user_path() -> PathNode {
    PathNode::root("User")
}

fn sample_queries() -> Vec<SelectQuery> {
    let age_gt = Expr::binop(user_path().step("age").into_expr(), Op::Gt, Expr::int(18));
    let age_lt = Expr::binop(user_path().step("age").into_expr(), Op::Lt, Expr::int(5));
    vec![
        // plain filtered projection
        SelectQuery::new()
            .select(user_path().step("name").into_expr())
            .where_(age_gt.clone()),
        // disjunctive filter over one node
        SelectQuery::new()
            .select(user_path().into_expr())
            .where_(Expr::binop(age_gt.clone(), Op::Or, age_lt.clone())),
        // conjunction over two distinct paths
        SelectQuery::new().select(user_path().into_expr()).where_(Expr::binop(
            Expr::binop(
                user_path().step("friend").step("name").into_expr(),
                Op::Eq,
                Expr::string("ada"),
            ),
            Op::And,
            age_gt.clone(),
        )),
        // shared navigation across selectors
        SelectQuery::new()
            .select(user_path().into_expr())
            .select(user_path().step("friend").step("name").into_expr()),
        // sorting over a navigated atom
        SelectQuery::new()
            .select(user_path().step("name").into_expr())
            .where_(age_gt)
            .order_by(user_path().step("age").into_expr(), true),
    ]
}

#[test]
fn normalization_is_idempotent() -> anyhow::Result<()> {
    let schema = schema();
    for (i, query) in sample_queries().iter().enumerate() {
        let mut tree = tx(&schema, query);
        let before = tree.graph.digest(tree.root);
        renormalize(&mut tree, &schema)?;
        let after = tree.graph.digest(tree.root);
        assert_eq!(before, after, "query #{i} changed under renormalization");
    }
    Ok(())
}

#[test]
fn transformation_is_deterministic() {
    let schema = schema();
    for query in sample_queries() {
        let a = tx(&schema, &query);
        let b = tx(&schema, &query);
        assert_eq!(a.graph.digest(a.root), b.graph.digest(b.root));
    }
}

/// No disjunction directly contains a disjunction, nor a conjunction a
/// conjunction, anywhere reachable from the root.
fn assert_flat(tree: &GirExprTree) {
    for id in tree.graph.reachable(tree.root) {
        let Some(paths) = tree.graph.combination_paths(id) else {
            continue;
        };
        for child in paths {
            if tree.graph.is_combination(*child) {
                assert_ne!(
                    tree.graph.node(id).kind_name(),
                    tree.graph.node(*child).kind_name(),
                    "same-kind combination nesting at {id}"
                );
            }
        }
    }
}

#[test]
fn combinations_stay_flat() {
    let schema = schema();
    for query in sample_queries() {
        assert_flat(&tx(&schema, &query));
    }

    // A three-way OR exercises flattening of nested disjunctions.
    let cmp = |v: i64| {
        Expr::binop(user_path().step("age").into_expr(), Op::Eq, Expr::int(v))
    };
    let query = SelectQuery::new().select(user_path().into_expr()).where_(Expr::binop(
        Expr::binop(cmp(1), Op::Or, cmp(2)),
        Op::Or,
        cmp(3),
    ));
    assert_flat(&tx(&schema, &query));
}

#[test]
fn reference_sets_mirror_forward_pointers() {
    let schema = schema();
    for query in sample_queries() {
        let tree = tx(&schema, &query);
        for id in tree.graph.reachable(tree.root) {
            match tree.graph.node(id) {
                GirNode::AtomicRefSimple(aref) => {
                    if let Some(owner) = tree.graph.entity_set(aref.ref_id) {
                        assert!(
                            owner.atomrefs.contains(&id),
                            "atomic ref {id} missing from its owner's atomrefs"
                        );
                    }
                }
                GirNode::MetaRef(mref) => {
                    if let Some(owner) = tree.graph.entity_set(mref.ref_id) {
                        assert!(owner.metarefs.contains(&id));
                    }
                }
                GirNode::LinkPropRefSimple(pref) => {
                    if let Some(owner) = tree.graph.entity_link(pref.ref_id) {
                        assert!(owner.proprefs.contains(&id));
                    }
                }
                GirNode::EntityLink(link) => {
                    if let Some(target) = link.target {
                        let target_set = tree.graph.entity_set(target).expect("link target");
                        assert_eq!(
                            target_set.rlink,
                            Some(id),
                            "link target must point back over rlink"
                        );
                    }
                    if let Some(source) = link.source {
                        let source_set = tree.graph.entity_set(source).expect("link source");
                        let in_conj = tree
                            .graph
                            .combination_paths(source_set.conjunction)
                            .map(|p| p.contains(&id))
                            .unwrap_or(false);
                        let in_disj = tree
                            .graph
                            .combination_paths(source_set.disjunction)
                            .map(|p| p.contains(&id))
                            .unwrap_or(false);
                        assert!(
                            in_conj || in_disj,
                            "link {id} must hang off its source's combinations"
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

#[test]
fn generator_promotes_solitary_optional_links() {
    // WHERE User.friend.name = "ada": the friend link is required.
    let schema = schema();
    let query = SelectQuery::new().select(user_path().into_expr()).where_(Expr::binop(
        user_path().step("friend").step("name").into_expr(),
        Op::Eq,
        Expr::string("ada"),
    ));
    let tree = tx(&schema, &query);

    let roots: Vec<_> = entity_sets_of(&tree, "User")
        .into_iter()
        .filter(|id| tree.graph.entity_set(*id).map(|s| s.id.is_empty()) == Some(true))
        .collect();
    assert_eq!(roots.len(), 1);
    let root_set = tree.graph.entity_set(roots[0]).unwrap();

    let conj = tree
        .graph
        .combination_paths(root_set.conjunction)
        .cloned()
        .unwrap_or_default();
    let disj = tree
        .graph
        .combination_paths(root_set.disjunction)
        .cloned()
        .unwrap_or_default();
    assert_eq!(conj.len(), 1, "the friend link moved into the conjunction");
    assert!(disj.is_empty(), "the disjunction was emptied");
    assert!(tree.graph.is_entity_link(*conj.iter().next().unwrap()));
}

/// The three clause expressions the permutation property is checked over:
/// a bare entity reference, a navigated atom, and a local atom.
fn permutation_clauses() -> Vec<Expr> {
    vec![
        user_path().into_expr(),
        user_path().step("friend").step("name").into_expr(),
        user_path().step("age").into_expr(),
    ]
}

fn root_digest_for(order: &[usize]) -> String {
    let schema = schema();
    let clauses = permutation_clauses();
    let mut query = SelectQuery::new();
    for &index in order {
        query = query.select(clauses[index].clone());
    }
    let tree = tx(&schema, &query);

    let roots: Vec<NodeId> = entity_sets_of(&tree, "User")
        .into_iter()
        .filter(|id| tree.graph.entity_set(*id).map(|s| s.id.is_empty()) == Some(true))
        .collect();
    assert_eq!(roots.len(), 1, "every ordering shares one root User set");
    tree.graph.digest(roots[0])
}

#[test_case(&[0, 2, 1]; "swap trailing pair")]
#[test_case(&[1, 0, 2]; "swap leading pair")]
#[test_case(&[1, 2, 0]; "rotate left")]
#[test_case(&[2, 0, 1]; "rotate right")]
#[test_case(&[2, 1, 0]; "full reversal")]
fn clause_permutations_share_one_path_graph(order: &[usize]) {
    assert_eq!(root_digest_for(order), root_digest_for(&[0, 1, 2]));
}

#[test]
fn name_normalization_qualifies_every_reference() -> anyhow::Result<()> {
    let schema = schema();
    let query = SelectQuery::new()
        .select(user_path().step("name").into_expr())
        .where_(Expr::binop(
            user_path().step("age").into_expr(),
            Op::Gt,
            Expr::int(18),
        ));
    let normalized = normalize_refs(&query, &schema, &BTreeMap::new())?;
    let json = serde_json::to_string(&normalized)?;
    assert!(json.contains("test::User"));
    assert!(json.contains("test::name"));
    assert!(json.contains("test::age"));
    Ok(())
}

#[test]
fn node_references_cover_concepts_and_links() -> anyhow::Result<()> {
    let schema = schema();
    let query = SelectQuery::new()
        .select(user_path().step("friend").step("name").into_expr())
        .where_(Expr::binop(
            user_path().step("age").into_expr(),
            Op::Gt,
            Expr::int(18),
        ));
    let refs = get_node_references(&query, &schema, &BTreeMap::new())?;
    assert!(refs.contains(&n("User")));
    assert!(refs.contains(&n("friend")));
    assert!(refs.contains(&n("name")));
    assert!(refs.contains(&n("age")));
    Ok(())
}

#[test]
fn anchors_resolve_caller_supplied_bindings() {
    let schema = schema();
    let mut anchors = BTreeMap::new();
    anchors.insert("u".to_string(), n("User"));
    let query = SelectQuery::new()
        .select(PathNode::root("u").step("name").into_expr())
        .where_(Expr::binop(
            PathNode::root("u").step("age").into_expr(),
            Op::Gt,
            Expr::int(30),
        ));
    let tree = transform(&query, &schema, &anchors, &BTreeMap::new()).expect("transform");
    let ge = graph_expr(&tree);

    // Both clauses resolve the anchor to one shared User set.
    assert_eq!(entity_sets_of(&tree, "User").len(), 1);
    let set_id = entity_sets_of(&tree, "User")[0];
    let set = tree.graph.entity_set(set_id).unwrap();
    assert_eq!(set.anchor.as_deref(), Some("u"));
    assert!(ge.generator.is_some());
}
