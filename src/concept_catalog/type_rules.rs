//! Operator and function result-type table.
//!
//! Used for typing constant-folded expressions and selector items. The
//! rules are deliberately small: comparisons and boolean connectives yield
//! `std::bool`, arithmetic follows numeric promotion, and everything else
//! falls back to "unknown" (`None`), which callers treat as untyped.

use super::names::{FullName, BOOL_ATOM, FLOAT_ATOM, INT_ATOM, STR_ATOM};
use crate::ops::Op;

fn is_numeric(atom: &FullName) -> bool {
    *atom == *INT_ATOM || *atom == *FLOAT_ATOM || *atom == FullName::std("decimal")
}

/// Result type of `left op right`. `None` means the combination has no
/// defined scalar result.
pub fn result_type(op: Op, left: Option<&FullName>, right: Option<&FullName>) -> Option<FullName> {
    if op.is_boolean()
        || op.is_comparison()
        || op.is_membership()
        || op.is_type_check()
        || op == Op::Search
    {
        return Some(BOOL_ATOM.clone());
    }

    let (left, right) = (left?, right?);

    if op.is_arithmetic() {
        if *left == *STR_ATOM && *right == *STR_ATOM && op == Op::Add {
            return Some(STR_ATOM.clone());
        }
        if is_numeric(left) && is_numeric(right) {
            if *left == *FLOAT_ATOM || *right == *FLOAT_ATOM {
                return Some(FLOAT_ATOM.clone());
            }
            if left == right {
                return Some(left.clone());
            }
            // int op decimal and friends widen to the non-int operand
            return Some(if *left == *INT_ATOM { right.clone() } else { left.clone() });
        }
        return None;
    }

    if left == right {
        return Some(left.clone());
    }
    None
}

/// Result type of a builtin function, from its argument types.
pub fn function_result_type(
    module: Option<&str>,
    name: &str,
    args: &[Option<FullName>],
) -> Option<FullName> {
    match (module, name) {
        (Some("agg"), "count") => Some(INT_ATOM.clone()),
        (Some("agg"), "sum") | (Some("agg"), "min") | (Some("agg"), "max")
        | (Some("agg"), "avg") => args.first().cloned().flatten(),
        (Some("search"), "rank") => Some(FLOAT_ATOM.clone()),
        (Some("search"), "headline") => Some(STR_ATOM.clone()),
        (None, "lower") | (None, "upper") => Some(STR_ATOM.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_are_boolean() {
        assert_eq!(
            result_type(Op::Lt, Some(&INT_ATOM), Some(&INT_ATOM)),
            Some(BOOL_ATOM.clone())
        );
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        assert_eq!(
            result_type(Op::Add, Some(&INT_ATOM), Some(&FLOAT_ATOM)),
            Some(FLOAT_ATOM.clone())
        );
        assert_eq!(
            result_type(Op::Add, Some(&INT_ATOM), Some(&INT_ATOM)),
            Some(INT_ATOM.clone())
        );
    }

    #[test]
    fn count_is_integer_typed() {
        assert_eq!(
            function_result_type(Some("agg"), "count", &[None]),
            Some(INT_ATOM.clone())
        );
    }
}
