//! End-to-end transformation scenarios: surface query in, normalized graph
//! shape out.

mod common;

use std::collections::BTreeMap;

use common::{entity_sets_of, graph_expr, n, schema, tx};
use conceptql::analyzer::typing::{get_selector_types, SelectorTyping};
use conceptql::gir::GirNode;
use conceptql::ops::Op;
use conceptql::surface_ast::{Expr, FunctionCallNode, PathNode, SelectQuery, SequenceNode};
use conceptql::{transform, FullName, TransformError};

fn user_path() -> PathNode {
    PathNode::root("User")
}

#[test]
fn filtered_selection_shares_one_entity_set() {
    // SELECT User.name WHERE User.age > 18
    let schema = schema();
    let query = SelectQuery::new()
        .select(user_path().step("name").into_expr())
        .where_(Expr::binop(
            user_path().step("age").into_expr(),
            Op::Gt,
            Expr::int(18),
        ));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    // The generator collapsed to an inline filter over the single User set.
    let generator = ge.generator.expect("generator");
    let GirNode::InlineFilter(inline) = tree.graph.node(generator) else {
        panic!("generator should be an inline filter");
    };
    let owner = tree.graph.entity_set(inline.ref_id).expect("owner set");
    assert_eq!(owner.concept, n("User"));
    assert!(owner.filter.is_some());

    // One User node serves both the filter and the projection.
    assert_eq!(entity_sets_of(&tree, "User").len(), 1);

    // The selector's atomic ref is registered with its owner.
    let GirNode::AtomicRefSimple(aref) = tree.graph.node(ge.selector[0].expr) else {
        panic!("selector should be an atomic ref");
    };
    assert_eq!(aref.ref_id, inline.ref_id);
    assert!(owner.atomrefs.contains(&ge.selector[0].expr));
}

#[test]
fn disjunctive_filters_fold_into_one_node() {
    // SELECT User WHERE User.age > 18 OR User.age < 5
    let schema = schema();
    let age_gt = Expr::binop(user_path().step("age").into_expr(), Op::Gt, Expr::int(18));
    let age_lt = Expr::binop(user_path().step("age").into_expr(), Op::Lt, Expr::int(5));
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .where_(Expr::binop(age_gt, Op::Or, age_lt));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    assert_eq!(entity_sets_of(&tree, "User").len(), 1, "no duplicate User nodes");

    let generator = ge.generator.expect("generator");
    let GirNode::InlineFilter(inline) = tree.graph.node(generator) else {
        panic!("generator should be an inline filter");
    };
    let owner = tree.graph.entity_set(inline.ref_id).expect("owner set");
    let filter = owner.filter.expect("combined filter");
    let digest = tree.graph.digest(filter);
    assert!(digest.contains("OR"), "filter should be the OR of both predicates: {digest}");
    assert!(digest.contains('>') && digest.contains('<'), "{digest}");
}

#[test]
fn type_check_keeps_identity_and_narrows() {
    // SELECT User WHERE User IS Admin
    let schema = schema();
    let is_admin = Expr::binop(
        user_path().into_expr(),
        Op::Is,
        PathNode::root("Admin").into_expr(),
    );
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .where_(is_admin);
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);
    let generator = ge.generator.expect("generator");
    let set = tree.graph.entity_set(generator).expect("entity set kept");
    assert_eq!(set.concept, n("User"));
    assert!(set.conceptfilter.is_empty());

    // SELECT User WHERE User IS NOT Admin
    let is_not_admin = Expr::binop(
        user_path().into_expr(),
        Op::IsNot,
        PathNode::root("Admin").into_expr(),
    );
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .where_(is_not_admin);
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);
    let generator = ge.generator.expect("generator");
    let set = tree.graph.entity_set(generator).expect("entity set kept");
    assert!(set.conceptfilter.contains(&n("Moderator")));
    assert!(!set.conceptfilter.contains(&n("Admin")));
}

#[test]
fn constant_id_membership_becomes_an_inline_filter() {
    // SELECT User WHERE User.id IN (1, 2, 3)
    let schema = schema();
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .where_(Expr::binop(
            user_path().step("id").into_expr(),
            Op::In,
            Expr::int_list([1, 2, 3]),
        ));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let generator = ge.generator.expect("generator");
    let GirNode::InlineFilter(inline) = tree.graph.node(generator) else {
        panic!("generator should be an inline filter");
    };
    let owner = tree.graph.entity_set(inline.ref_id).expect("owner set");
    let filter = owner.filter.expect("id filter");
    let digest = tree.graph.digest(filter);
    assert!(digest.contains("std::id"), "{digest}");
    assert!(digest.contains("IN"), "{digest}");
}

#[test]
fn repeated_navigation_shares_the_friend_node() {
    // SELECT User, User.friend.name
    let schema = schema();
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .select(user_path().step("friend").step("name").into_expr());
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let users: Vec<_> = entity_sets_of(&tree, "User")
        .into_iter()
        .filter(|id| tree.graph.entity_set(*id).map(|s| s.id.is_empty()) == Some(true))
        .collect();
    assert_eq!(users.len(), 1, "one root User set");
    let root = users[0];
    assert_eq!(ge.selector[0].expr, root, "bare selector is the shared root");

    let friends: Vec<_> = entity_sets_of(&tree, "User")
        .into_iter()
        .filter(|id| tree.graph.entity_set(*id).map(|s| s.id.len()) == Some(1))
        .collect();
    assert_eq!(friends.len(), 1, "one shared friend set");
    let friend = friends[0];

    // The friend is reached from the root over its incoming link.
    let rlink = tree.graph.entity_set(friend).unwrap().rlink.expect("rlink");
    assert_eq!(tree.graph.entity_link(rlink).unwrap().source, Some(root));

    // The name ref points at the shared friend node by identity.
    let GirNode::AtomicRefSimple(aref) = tree.graph.node(ge.selector[1].expr) else {
        panic!("second selector should be an atomic ref");
    };
    assert_eq!(aref.ref_id, friend);
    assert!(tree
        .graph
        .entity_set(friend)
        .unwrap()
        .atomrefs
        .contains(&ge.selector[1].expr));
}

#[test]
fn aggregates_stay_out_of_inline_filters() {
    // SELECT User WHERE agg::count(User.posts) > 10
    let schema = schema();
    let count = Expr::FunctionCall(FunctionCallNode {
        module: Some("agg".to_string()),
        name: "count".to_string(),
        args: vec![user_path().step("posts").into_expr()],
    });
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .where_(Expr::binop(count, Op::Gt, Expr::int(10)));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let generator = ge.generator.expect("generator");
    let GirNode::BinOp(binop) = tree.graph.node(generator) else {
        panic!("aggregate comparison must stay a plain binary op");
    };
    assert!(binop.aggregates, "comparison of aggregate and constant is aggregated");
    let GirNode::FunctionCall(call) = tree.graph.node(binop.left) else {
        panic!("left side should be the aggregate call");
    };
    assert!(call.aggregates);

    // No inline filter was distributed anywhere in the generator.
    assert!(tree
        .graph
        .reachable(generator)
        .into_iter()
        .all(|id| !matches!(tree.graph.node(id), GirNode::InlineFilter(_))));
}

#[test]
fn aggregate_mixes_are_rejected() {
    // SELECT (User.name, agg::count(User.posts))
    let schema = schema();
    let count = Expr::FunctionCall(FunctionCallNode {
        module: Some("agg".to_string()),
        name: "count".to_string(),
        args: vec![user_path().step("posts").into_expr()],
    });
    let query = SelectQuery::new().select(Expr::Sequence(SequenceNode {
        elements: vec![user_path().step("name").into_expr(), count],
    }));
    let err = transform(&query, &schema, &BTreeMap::new(), &BTreeMap::new()).unwrap_err();
    assert_eq!(err, TransformError::AggregateMix);
}

#[test]
fn grouped_prefixes_mix_freely_with_aggregates() {
    // GROUP BY User.name: the grouped atom may sit next to an aggregate.
    let schema = schema();
    let count = Expr::FunctionCall(FunctionCallNode {
        module: Some("agg".to_string()),
        name: "count".to_string(),
        args: vec![user_path().step("posts").into_expr()],
    });
    let query = SelectQuery::new()
        .group_by(user_path().step("name").into_expr())
        .select(Expr::Sequence(SequenceNode {
            elements: vec![user_path().step("name").into_expr(), count],
        }));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let GirNode::Sequence(seq) = tree.graph.node(ge.selector[0].expr) else {
        panic!("selector should stay a sequence");
    };
    assert!(seq.aggregates, "a tuple of grouped atom and aggregate is aggregated");
}

#[test]
fn search_without_configuration_is_an_error() {
    // SELECT Thing WHERE Thing SEARCH "query"
    let schema = schema();
    let query = SelectQuery::new()
        .select(PathNode::root("Thing").into_expr())
        .where_(Expr::binop(
            PathNode::root("Thing").into_expr(),
            Op::Search,
            Expr::string("query"),
        ));
    let err = transform(&query, &schema, &BTreeMap::new(), &BTreeMap::new()).unwrap_err();
    match err {
        TransformError::SearchConfiguration { concept, hint, .. } => {
            assert!(concept.contains("Thing"), "error names the concept: {concept}");
            assert!(hint.contains("Thing"));
        }
        other => panic!("expected a search configuration error, got {other}"),
    }
}

#[test]
fn search_functions_expand_to_searchable_atoms() {
    // SELECT search::rank(Post, "query")
    let schema = schema();
    let rank = Expr::FunctionCall(FunctionCallNode {
        module: Some("search".to_string()),
        name: "rank".to_string(),
        args: vec![PathNode::root("Post").into_expr(), Expr::string("query")],
    });
    let query = SelectQuery::new().select(rank);
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let GirNode::FunctionCall(call) = tree.graph.node(ge.selector[0].expr) else {
        panic!("selector should be the rewritten call");
    };
    let GirNode::Sequence(columns) = tree.graph.node(call.args[0]) else {
        panic!("first argument should be the searchable column tuple");
    };
    assert_eq!(columns.elements.len(), 1);
    let GirNode::AtomicRefSimple(aref) = tree.graph.node(columns.elements[0]) else {
        panic!("searchable column should be an atomic ref");
    };
    assert_eq!(aref.name, n("title"));
}

#[test]
fn boolean_operators_are_not_inlined_past_their_boundary() {
    // SELECT User WHERE (User.age > 18) AND true
    let schema = schema();
    let age = Expr::binop(user_path().step("age").into_expr(), Op::Gt, Expr::int(18));
    let query = SelectQuery::new().select(user_path().into_expr()).where_(Expr::binop(
        age,
        Op::And,
        Expr::Constant(conceptql::surface_ast::ConstantNode {
            value: conceptql::surface_ast::LiteralValue::Bool(true),
        }),
    ));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let generator = ge.generator.expect("generator");
    let GirNode::BinOp(binop) = tree.graph.node(generator) else {
        panic!("boolean mix with a constant must stay a binary op");
    };
    assert!(matches!(tree.graph.node(binop.left), GirNode::InlineFilter(_)));
    assert!(tree.graph.is_constant(binop.right));
}

#[test]
fn link_properties_filter_on_the_link() {
    // SELECT User WHERE User.follows@since = "2020"
    let schema = schema();
    let mut since = PathNode::root("User").step("follows");
    since
        .steps
        .push(conceptql::surface_ast::PathStep::LinkProp {
            name: "since".to_string(),
        });
    let query = SelectQuery::new().select(user_path().into_expr()).where_(Expr::binop(
        since.into_expr(),
        Op::Eq,
        Expr::string("2020"),
    ));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let generator = ge.generator.expect("generator");
    let GirNode::InlinePropFilter(inline) = tree.graph.node(generator) else {
        panic!("generator should be an inline property filter");
    };
    let link = tree.graph.entity_link(inline.ref_id).expect("owning link");
    assert_eq!(link.link_proto, n("follows"));
    assert!(link.propfilter.is_some());
}

#[test]
fn selector_types_come_from_the_schema() {
    let schema = schema();
    let query = SelectQuery::new()
        .select_as("who", user_path().step("name").into_expr())
        .select_as("limit", Expr::int(10))
        .where_(Expr::binop(
            user_path().step("age").into_expr(),
            Op::Ge,
            Expr::int(21),
        ));
    let tree = tx(&schema, &query);
    let types = get_selector_types(&tree.graph, tree.root, &schema);
    assert_eq!(
        types[0],
        SelectorTyping {
            name: "who".to_string(),
            type_: Some(FullName::std("str")),
            is_constant: false,
        }
    );
    assert_eq!(types[1].name, "limit");
    assert_eq!(types[1].type_, Some(FullName::std("int")));
    assert!(types[1].is_constant);
}

#[test]
fn non_local_atom_expressions_are_rejected() {
    use conceptql::analyzer::check_local_atomic_expr;

    let schema = schema();
    let atomic = SelectQuery::new().select(user_path().step("name").into_expr());
    let tree = tx(&schema, &atomic);
    let ge = graph_expr(&tree);
    assert!(check_local_atomic_expr(&tree.graph, ge.selector[0].expr).is_ok());

    let entity = SelectQuery::new().select(user_path().into_expr());
    let tree = tx(&schema, &entity);
    let ge = graph_expr(&tree);
    let err = check_local_atomic_expr(&tree.graph, ge.selector[0].expr).unwrap_err();
    assert!(matches!(err, conceptql::TransformError::Reference { .. }));
}

#[test]
fn entity_refs_convert_to_id_refs_and_records() {
    let schema = schema();
    let query = SelectQuery::new().select(user_path().into_expr());
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);
    let set = ge.selector[0].expr;

    let mut t = conceptql::Transformer::resume(&schema, tree.graph);

    let idref = t.entityref_to_idref(set, false).expect("id ref");
    let GirNode::AtomicRefSimple(aref) = t.graph.node(idref) else {
        panic!("expected the builtin id ref");
    };
    assert_eq!(aref.name.to_string(), "std::id");
    assert!(t.graph.entity_set(set).unwrap().atomrefs.contains(&idref));

    let record = t.entityref_to_idref(set, true).expect("record");
    let GirNode::Record(rec) = t.graph.node(record).clone() else {
        panic!("expected a record of atomic pointers");
    };
    assert_eq!(rec.concept, n("User"));
    // The name and age atomic pointers plus the id meta ref.
    assert!(rec.elements.len() >= 3);
    let last = *rec.elements.last().unwrap();
    assert!(matches!(t.graph.node(last), GirNode::MetaRef(_)));
    assert!(t.graph.entity_set(set).unwrap().metarefs.contains(&last));
}

#[test]
fn copied_paths_are_structurally_equal_but_distinct() {
    let schema = schema();
    let query = SelectQuery::new().select(user_path().step("friend").step("name").into_expr());
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);
    let GirNode::AtomicRefSimple(aref) = tree.graph.node(ge.selector[0].expr).clone() else {
        panic!("selector should be an atomic ref");
    };

    let mut t = conceptql::Transformer::resume(&schema, tree.graph);
    let copy = t.copy_path(aref.ref_id).expect("copy");
    assert_ne!(copy, aref.ref_id);
    assert_eq!(t.graph.digest(copy), t.graph.digest(aref.ref_id));
}

#[test]
fn deep_extraction_reaches_into_subqueries() {
    use conceptql::analyzer::{ExtractOpts, Recurse};
    use conceptql::Location;

    let schema = schema();
    let inner = SelectQuery::new().select(PathNode::root("Post").step("title").into_expr());
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .select(Expr::Select(Box::new(inner)));
    let tree = tx(&schema, &query);

    let mut t = conceptql::Transformer::resume(&schema, tree.graph);
    let shallow = t
        .extract_paths(tree.root, ExtractOpts::new().reverse(true), Location::Selector)
        .expect("extract");
    let deep = t
        .extract_paths(
            tree.root,
            ExtractOpts::new().reverse(true).recurse(Recurse::Deep),
            Location::Selector,
        )
        .expect("extract")
        .expect("paths");

    // Without recursion the top-level query is opaque from the outside.
    assert!(shallow.is_none());
    let members: Vec<_> = if t.graph.is_combination(deep) {
        t.graph.combination_paths(deep).unwrap().iter().copied().collect()
    } else {
        vec![deep]
    };
    let concepts: Vec<String> = members
        .iter()
        .filter_map(|m| t.graph.entity_set(*m).map(|s| s.concept.to_string()))
        .collect();
    assert!(concepts.contains(&"test::User".to_string()));
    assert!(concepts.contains(&"test::Post".to_string()));
}

#[test]
fn subqueries_stay_opaque() {
    // SELECT User WHERE User.age > 18, with a nested select as a selector.
    let schema = schema();
    let inner = SelectQuery::new().select(PathNode::root("Post").step("title").into_expr());
    let query = SelectQuery::new()
        .select(user_path().into_expr())
        .select(Expr::Select(Box::new(inner)))
        .where_(Expr::binop(
            user_path().step("age").into_expr(),
            Op::Gt,
            Expr::int(18),
        ));
    let tree = tx(&schema, &query);
    let ge = graph_expr(&tree);

    let GirNode::GraphExpr(sub) = tree.graph.node(ge.selector[1].expr) else {
        panic!("nested select should stay a graph expression");
    };
    assert_eq!(sub.selector.len(), 1);

    // The subquery's Post set is not fused with anything outside.
    assert_eq!(entity_sets_of(&tree, "User").len(), 1);
}
