//! OR-of-equalities normalisation.
//!
//! `(a=1 AND b>0) OR (a=1 AND c<0)` -> `a=1 AND (b>0 OR c<0)`
//! `(col=v1) OR (col=v2) OR ... OR (col=vn)` -> `col IN (v1,...,vn)`

use super::{expr_key, split_and};
use sqlparser::ast::{BinaryOperator, Expr};
use std::collections::BTreeMap;

fn split_or(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let mut out = split_or(left);
            out.extend(split_or(right));
            out
        }
        Expr::Nested(inner) => split_or(inner),
        other => vec![other.clone()],
    }
}

fn and_of(mut conjuncts: Vec<Expr>) -> Expr {
    if conjuncts.len() == 1 {
        return conjuncts.remove(0);
    }
    conjuncts
        .into_iter()
        .reduce(|acc, e| Expr::BinaryOp {
            left: Box::new(acc),
            op: BinaryOperator::And,
            right: Box::new(e),
        })
        .expect("at least one conjunct")
}

fn or_of(mut disjuncts: Vec<Expr>) -> Expr {
    if disjuncts.len() == 1 {
        return disjuncts.remove(0);
    }
    disjuncts
        .into_iter()
        .reduce(|acc, e| Expr::BinaryOp {
            left: Box::new(acc),
            op: BinaryOperator::Or,
            right: Box::new(e),
        })
        .expect("at least one disjunct")
}

/// Extracts `(column, value)` if `expr` is `column = literal`.
fn as_col_eq_literal(expr: &Expr) -> Option<(String, Expr)> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if is_column(left) && is_literal(right) {
                Some((column_key(left), (**right).clone()))
            } else if is_column(right) && is_literal(left) {
                Some((column_key(right), (**left).clone()))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn as_col_in_list(expr: &Expr) -> Option<(String, Vec<Expr>)> {
    match expr {
        Expr::InList {
            expr: inner,
            list,
            negated: false,
        } if is_column(inner) => Some((column_key(inner), list.clone())),
        _ => None,
    }
}

fn is_column(expr: &Expr) -> bool {
    matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_))
}

fn is_literal(expr: &Expr) -> bool {
    matches!(expr, Expr::Value(_))
}

fn column_key(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(i) => i.value.clone(),
        Expr::CompoundIdentifier(idents) => idents
            .iter()
            .map(|i| i.value.as_str())
            .collect::<Vec<_>>()
            .join("."),
        _ => unreachable!(),
    }
}

/// Normalises a top-level OR expression into a flat list of conjuncts.
pub fn normalize_or(expr: &Expr) -> Vec<Expr> {
    let disjuncts = split_or(expr);
    if disjuncts.len() <= 1 {
        return vec![expr.clone()];
    }

    let disjunct_maps: Vec<BTreeMap<u64, Expr>> = disjuncts
        .iter()
        .map(|d| {
            split_and(d)
                .into_iter()
                .map(|c| (expr_key(&c), c))
                .collect()
        })
        .collect();

    let mut hoisted_keys: Vec<u64> = disjunct_maps[0].keys().copied().collect();
    hoisted_keys.retain(|k| disjunct_maps.iter().all(|m| m.contains_key(k)));

    let hoisted: Vec<Expr> = hoisted_keys
        .iter()
        .map(|k| disjunct_maps[0][k].clone())
        .collect();

    let remainders: Vec<Vec<Expr>> = disjunct_maps
        .iter()
        .map(|m| {
            m.iter()
                .filter(|(k, _)| !hoisted_keys.contains(k))
                .map(|(_, e)| e.clone())
                .collect()
        })
        .collect();

    if remainders.iter().any(|r| r.is_empty()) {
        // A disjunct became empty after hoisting: the whole OR collapses.
        return if hoisted.is_empty() {
            vec![expr.clone()]
        } else {
            hoisted
        };
    }

    let remainder_exprs: Vec<Expr> = remainders.into_iter().map(and_of).collect();

    let merged = merge_same_column_in(&remainder_exprs).unwrap_or_else(|| or_of(remainder_exprs));

    let mut out = hoisted;
    out.push(merged);
    out
}

/// If every remaining disjunct is `col = v` or `col IN (...)` over the same
/// column, merges them into a single `col IN (v1, v2, ...)`.
fn merge_same_column_in(disjuncts: &[Expr]) -> Option<Expr> {
    let mut column: Option<String> = None;
    let mut base_col_expr: Option<Expr> = None;
    let mut values = Vec::new();

    for d in disjuncts {
        if let Some((col, val)) = as_col_eq_literal(d) {
            match &column {
                None => column = Some(col),
                Some(c) if *c == col => {}
                _ => return None,
            }
            if base_col_expr.is_none() {
                base_col_expr = Some(extract_column_expr(d));
            }
            values.push(val);
        } else if let Some((col, list)) = as_col_in_list(d) {
            match &column {
                None => column = Some(col),
                Some(c) if *c == col => {}
                _ => return None,
            }
            if base_col_expr.is_none() {
                if let Expr::InList { expr, .. } = d {
                    base_col_expr = Some((**expr).clone());
                }
            }
            values.extend(list);
        } else {
            return None;
        }
    }

    let col_expr = base_col_expr?;
    if values.is_empty() {
        return None;
    }
    Some(Expr::InList {
        expr: Box::new(col_expr),
        list: values,
        negated: false,
    })
}

fn extract_column_expr(eq_expr: &Expr) -> Expr {
    match eq_expr {
        Expr::BinaryOp { left, right, .. } => {
            if is_column(left) {
                (**left).clone()
            } else {
                (**right).clone()
            }
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn parse_expr(sql: &str) -> Expr {
        Parser::new(&GenericDialect {})
            .try_with_sql(sql)
            .unwrap()
            .parse_expr()
            .unwrap()
    }

    #[test]
    fn merges_equalities_over_the_same_column_into_in_list() {
        let expr = parse_expr("col = 1 OR col = 2 OR col = 3");
        let out = normalize_or(&expr);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Expr::InList { list, negated, .. } => {
                assert!(!negated);
                assert_eq!(list.len(), 3);
            }
            other => panic!("expected InList, got {:?}", other),
        }
    }

    #[test]
    fn hoists_common_conjuncts_out_of_every_disjunct() {
        let expr = parse_expr("(a = 1 AND b > 0) OR (a = 1 AND c < 0)");
        let out = normalize_or(&expr);
        // The common `a = 1` is hoisted; the remainder stays OR'd.
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|e| e.to_string() == "a = 1"));
    }

    #[test]
    fn collapses_whole_or_when_hoisting_empties_a_disjunct() {
        let expr = parse_expr("a = 1 OR (a = 1 AND b > 0)");
        let out = normalize_or(&expr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_string(), "a = 1");
    }

    #[test]
    fn leaves_unrelated_disjuncts_as_an_or() {
        let expr = parse_expr("a = 1 OR b = 2");
        let out = normalize_or(&expr);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Expr::BinaryOp { op, .. } => assert_eq!(*op, BinaryOperator::Or),
            other => panic!("expected an OR, got {:?}", other),
        }
    }
}
