//! # Surface tree
//!
//! The node shapes the analyzer consumes from the parser. The parser itself
//! lives elsewhere; this module only defines the tree and a couple of
//! convenience constructors used heavily by tests.
//!
//! A query is a [`SelectQuery`]: an optional generator predicate (the WHERE
//! clause), a projection list, grouping expressions, and sort expressions.
//! Navigation is expressed with [`PathNode`]s: a root step naming a concept
//! or an anchor, followed by link traversals, link-property accesses, and
//! meta-attribute accesses.

use serde::{Deserialize, Serialize};

use crate::ops::{Direction, Op, UnaryOperator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Path(PathNode),
    BinOp(BinOpNode),
    UnaryOp(UnaryOpNode),
    Constant(ConstantNode),
    FunctionCall(FunctionCallNode),
    Sequence(SequenceNode),
    Record(RecordNode),
    TypeCast(TypeCastNode),
    NoneTest(NoneTestNode),
    /// A nested subquery; opaque to the enclosing query's path algebra.
    Select(Box<SelectQuery>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub where_clause: Option<Expr>,
    pub selector: Vec<SelectorItem>,
    pub grouper: Vec<Expr>,
    pub sorter: Vec<SortItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorItem {
    pub name: Option<String>,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortItem {
    pub expr: Expr,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathNode {
    pub steps: Vec<PathStep>,
    /// Binding introduced with `AS`, attached to the node the path ends at.
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathStep {
    /// First step: a concept name or a caller-supplied anchor.
    Root { name: String },
    /// A link traversal.
    Link {
        name: String,
        direction: Direction,
    },
    /// A property of the link the path arrived through (`@prop`).
    LinkProp { name: String },
    /// A meta attribute of the node (`User@id`, `User@type`).
    Meta { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinOpNode {
    pub left: Box<Expr>,
    pub op: Op,
    pub right: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnaryOpNode {
    pub op: UnaryOperator,
    pub expr: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantNode {
    pub value: LiteralValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<LiteralValue>),
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallNode {
    pub module: Option<String>,
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceNode {
    pub elements: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordNode {
    pub concept: String,
    pub elements: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCastNode {
    pub expr: Box<Expr>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoneTestNode {
    pub expr: Box<Expr>,
}

impl Expr {
    pub fn binop(left: Expr, op: Op, right: Expr) -> Expr {
        Expr::BinOp(BinOpNode {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    pub fn int(value: i64) -> Expr {
        Expr::Constant(ConstantNode {
            value: LiteralValue::Int(value),
        })
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Expr::Constant(ConstantNode {
            value: LiteralValue::Str(value.into()),
        })
    }

    pub fn int_list(values: impl IntoIterator<Item = i64>) -> Expr {
        Expr::Constant(ConstantNode {
            value: LiteralValue::List(values.into_iter().map(LiteralValue::Int).collect()),
        })
    }
}

impl PathNode {
    /// A bare concept reference: `User`.
    pub fn root(name: impl Into<String>) -> PathNode {
        PathNode {
            steps: vec![PathStep::Root { name: name.into() }],
            anchor: None,
        }
    }

    /// Append an outbound link traversal.
    pub fn step(mut self, link: impl Into<String>) -> PathNode {
        self.steps.push(PathStep::Link {
            name: link.into(),
            direction: Direction::Outbound,
        });
        self
    }

    pub fn step_inbound(mut self, link: impl Into<String>) -> PathNode {
        self.steps.push(PathStep::Link {
            name: link.into(),
            direction: Direction::Inbound,
        });
        self
    }

    pub fn with_anchor(mut self, anchor: impl Into<String>) -> PathNode {
        self.anchor = Some(anchor.into());
        self
    }

    pub fn into_expr(self) -> Expr {
        Expr::Path(self)
    }
}

impl SelectQuery {
    pub fn new() -> SelectQuery {
        SelectQuery {
            where_clause: None,
            selector: Vec::new(),
            grouper: Vec::new(),
            sorter: Vec::new(),
        }
    }

    pub fn select(mut self, expr: Expr) -> SelectQuery {
        self.selector.push(SelectorItem { name: None, expr });
        self
    }

    pub fn select_as(mut self, name: impl Into<String>, expr: Expr) -> SelectQuery {
        self.selector.push(SelectorItem {
            name: Some(name.into()),
            expr,
        });
        self
    }

    pub fn where_(mut self, expr: Expr) -> SelectQuery {
        self.where_clause = Some(expr);
        self
    }

    pub fn group_by(mut self, expr: Expr) -> SelectQuery {
        self.grouper.push(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, ascending: bool) -> SelectQuery {
        self.sorter.push(SortItem { expr, ascending });
        self
    }
}

impl Default for SelectQuery {
    fn default() -> Self {
        SelectQuery::new()
    }
}
