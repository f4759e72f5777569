//! Expression analyser: AND/OR normalisation and predicate classification.
//!
//! The planner is handed an already-parsed [`sqlparser::ast::Expr`]; this
//! module never tokenizes or parses SQL text itself.

mod or_normalize;

pub use or_normalize::normalize_or;

use crate::error::{PlannerError, Result};
use crate::value::Literal;
use sqlparser::ast::{BinaryOperator, Expr, Ident};
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A (possibly qualified) column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn qualified(&self) -> String {
        match &self.table {
            Some(t) => format!("{}.{}", t, self.name),
            None => self.name.clone(),
        }
    }
}

/// A predicate together with everything the rest of the planner needs to
/// know about it without re-walking the AST.
#[derive(Debug, Clone)]
pub struct ExprInfo {
    pub expr: Expr,
    pub refer_tables: BTreeSet<String>,
    pub cols: Vec<ColumnRef>,
    pub vals: Vec<Literal>,
}

/// Which pushdown bucket a conjunct falls into.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    NoTables,
    SingleTable(String),
    EquiJoin { left: ColumnRef, right: ColumnRef },
    OtherMultiTable,
    NullCheck { column: ColumnRef, negated: bool },
}

/// Splits a top-level AND chain into a flat list of conjuncts, descending
/// through parentheses. A non-AND expression yields a single-element list.
pub fn split_and(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_and(left);
            out.extend(split_and(right));
            out
        }
        Expr::Nested(inner) => split_and(inner),
        other => vec![other.clone()],
    }
}

/// Recursively splits an expression into the full flat conjunct list,
/// normalising any OR chains it encounters first.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    split_and(expr)
        .into_iter()
        .flat_map(|conjunct| match &conjunct {
            Expr::BinaryOp {
                op: BinaryOperator::Or,
                ..
            } => normalize_or(&conjunct),
            Expr::Nested(inner) if matches!(inner.as_ref(), Expr::BinaryOp { op: BinaryOperator::Or, .. }) => {
                normalize_or(inner)
            }
            _ => vec![conjunct],
        })
        .collect()
}

/// Structural hash of an expression (operator tag + recursively hashed
/// children), used to key the OR-normaliser's disjunct maps. Never derived
/// from the pretty-printed SQL text (see DESIGN.md).
pub fn expr_key(expr: &Expr) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_expr(expr, &mut hasher);
    hasher.finish()
}

fn hash_ident(ident: &Ident, hasher: &mut DefaultHasher) {
    ident.value.hash(hasher);
}

fn hash_expr(expr: &Expr, hasher: &mut DefaultHasher) {
    match expr {
        Expr::Identifier(ident) => {
            0u8.hash(hasher);
            hash_ident(ident, hasher);
        }
        Expr::CompoundIdentifier(idents) => {
            1u8.hash(hasher);
            for ident in idents {
                hash_ident(ident, hasher);
            }
        }
        Expr::BinaryOp { left, op, right } => {
            2u8.hash(hasher);
            format!("{:?}", op).hash(hasher);
            hash_expr(left, hasher);
            hash_expr(right, hasher);
        }
        Expr::UnaryOp { op, expr } => {
            3u8.hash(hasher);
            format!("{:?}", op).hash(hasher);
            hash_expr(expr, hasher);
        }
        Expr::Nested(inner) => {
            4u8.hash(hasher);
            hash_expr(inner, hasher);
        }
        Expr::Value(v) => {
            5u8.hash(hasher);
            if let Some(lit) = Literal::from_ast_spanned(v) {
                lit.to_string().hash(hasher);
            } else {
                format!("{:?}", v).hash(hasher);
            }
        }
        Expr::IsNull(inner) => {
            6u8.hash(hasher);
            hash_expr(inner, hasher);
        }
        Expr::IsNotNull(inner) => {
            7u8.hash(hasher);
            hash_expr(inner, hasher);
        }
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            8u8.hash(hasher);
            negated.hash(hasher);
            hash_expr(inner, hasher);
            for item in list {
                hash_expr(item, hasher);
            }
        }
        Expr::Function(func) => {
            9u8.hash(hasher);
            func.name.to_string().hash(hasher);
        }
        other => {
            10u8.hash(hasher);
            format!("{:?}", other).hash(hasher);
        }
    }
}

/// Resolves every column reference in `expr` against `known_aliases`,
/// recording literals and referenced tables. Bare (unqualified) columns
/// resolve only when exactly one alias is in scope; more than one is
/// "unsupported: ambiguous.column" and zero is a catalog error.
pub fn analyze(expr: &Expr, known_aliases: &BTreeSet<String>) -> Result<ExprInfo> {
    let mut cols = Vec::new();
    let mut vals = Vec::new();
    let mut refer_tables = BTreeSet::new();
    walk(expr, known_aliases, &mut cols, &mut vals, &mut refer_tables)?;
    Ok(ExprInfo {
        expr: expr.clone(),
        refer_tables,
        cols,
        vals,
    })
}

fn resolve_bare(name: &str, known_aliases: &BTreeSet<String>) -> Result<Option<String>> {
    if known_aliases.len() == 1 {
        Ok(known_aliases.iter().next().cloned())
    } else if known_aliases.is_empty() {
        Ok(None)
    } else {
        Err(PlannerError::unsupported(format!(
            "ambiguous.column.'{}'",
            name
        )))
    }
}

fn walk(
    expr: &Expr,
    known_aliases: &BTreeSet<String>,
    cols: &mut Vec<ColumnRef>,
    vals: &mut Vec<Literal>,
    refer_tables: &mut BTreeSet<String>,
) -> Result<()> {
    match expr {
        Expr::Identifier(ident) => {
            let table = resolve_bare(&ident.value, known_aliases)?;
            if let Some(t) = &table {
                refer_tables.insert(t.clone());
            }
            cols.push(ColumnRef {
                table,
                name: ident.value.clone(),
            });
        }
        Expr::CompoundIdentifier(idents) => {
            if idents.len() != 2 {
                return Err(PlannerError::unsupported(format!(
                    "column.reference.'{}'",
                    idents
                        .iter()
                        .map(|i| i.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".")
                )));
            }
            let table = idents[0].value.clone();
            if !known_aliases.contains(&table) {
                return Err(PlannerError::unsupported(format!(
                    "unknown.column.'{}'.in.clause",
                    idents
                        .iter()
                        .map(|i| i.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".")
                )));
            }
            refer_tables.insert(table.clone());
            cols.push(ColumnRef {
                table: Some(table),
                name: idents[1].value.clone(),
            });
        }
        Expr::Value(v) => {
            if let Some(lit) = Literal::from_ast_spanned(v) {
                vals.push(lit);
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            walk(left, known_aliases, cols, vals, refer_tables)?;
            walk(right, known_aliases, cols, vals, refer_tables)?;
        }
        Expr::UnaryOp { expr, .. } => walk(expr, known_aliases, cols, vals, refer_tables)?,
        Expr::Nested(inner) => walk(inner, known_aliases, cols, vals, refer_tables)?,
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            walk(inner, known_aliases, cols, vals, refer_tables)?
        }
        Expr::InList { expr, list, .. } => {
            walk(expr, known_aliases, cols, vals, refer_tables)?;
            for item in list {
                walk(item, known_aliases, cols, vals, refer_tables)?;
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk(expr, known_aliases, cols, vals, refer_tables)?;
            walk(low, known_aliases, cols, vals, refer_tables)?;
            walk(high, known_aliases, cols, vals, refer_tables)?;
        }
        Expr::Like {
            expr, pattern, ..
        }
        | Expr::ILike {
            expr, pattern, ..
        } => {
            walk(expr, known_aliases, cols, vals, refer_tables)?;
            walk(pattern, known_aliases, cols, vals, refer_tables)?;
        }
        Expr::Function(func) => {
            use sqlparser::ast::{FunctionArg, FunctionArgExpr, FunctionArguments};
            if let FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    let inner = match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(e),
                        FunctionArg::Named { arg: FunctionArgExpr::Expr(e), .. } => Some(e),
                        _ => None,
                    };
                    if let Some(e) = inner {
                        walk(e, known_aliases, cols, vals, refer_tables)?;
                    }
                }
            }
        }
        Expr::Subquery(_) | Expr::Exists { .. } => {
            return Err(PlannerError::unsupported("subquery.in.select"));
        }
        _ => {}
    }
    Ok(())
}

/// Classifies an already-`analyze`d conjunct into exactly one pushdown bucket.
pub fn classify(info: &ExprInfo) -> Classification {
    if info.refer_tables.is_empty() {
        return Classification::NoTables;
    }
    if info.refer_tables.len() == 1 {
        if let Some(col_null) = as_null_check(&info.expr) {
            return Classification::NullCheck {
                column: col_null.0,
                negated: col_null.1,
            };
        }
        return Classification::SingleTable(info.refer_tables.iter().next().cloned().unwrap());
    }
    if let Some((l, r)) = as_equi_join(&info.expr) {
        if l.table != r.table {
            return Classification::EquiJoin { left: l, right: r };
        }
    }
    if let Some(col_null) = as_null_check(&info.expr) {
        return Classification::NullCheck {
            column: col_null.0,
            negated: col_null.1,
        };
    }
    Classification::OtherMultiTable
}

fn as_column(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(i) => Some(ColumnRef {
            table: None,
            name: i.value.clone(),
        }),
        Expr::CompoundIdentifier(idents) if idents.len() == 2 => Some(ColumnRef {
            table: Some(idents[0].value.clone()),
            name: idents[1].value.clone(),
        }),
        _ => None,
    }
}

fn as_equi_join(expr: &Expr) -> Option<(ColumnRef, ColumnRef)> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let l = as_column(left)?;
            let r = as_column(right)?;
            Some((l, r))
        }
        _ => None,
    }
}

fn as_null_check(expr: &Expr) -> Option<(ColumnRef, bool)> {
    match expr {
        Expr::IsNull(inner) => as_column(inner).map(|c| (c, false)),
        Expr::IsNotNull(inner) => as_column(inner).map(|c| (c, true)),
        _ => None,
    }
}

/// Replaces every occurrence of the exact column `from` with `to`, leaving
/// every other subexpression untouched. Used to translate a single-table
/// predicate onto a join partner's differently-named shard-key column
/// (`A.id = 1` over `A.id = B.a` becomes `B.a = 1`, not `B.id = 1`).
pub fn substitute_column(expr: &Expr, from: &ColumnRef, to: &ColumnRef) -> Expr {
    let to_expr = |c: &ColumnRef| match &c.table {
        Some(t) => Expr::CompoundIdentifier(vec![Ident::new(t.clone()), Ident::new(c.name.clone())]),
        None => Expr::Identifier(Ident::new(c.name.clone())),
    };
    match expr {
        Expr::Identifier(ident) if from.table.is_none() && ident.value == from.name => to_expr(to),
        Expr::CompoundIdentifier(idents)
            if idents.len() == 2
                && from.table.as_deref() == Some(idents[0].value.as_str())
                && idents[1].value == from.name =>
        {
            to_expr(to)
        }
        Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
            left: Box::new(substitute_column(left, from, to)),
            op: op.clone(),
            right: Box::new(substitute_column(right, from, to)),
        },
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(substitute_column(expr, from, to)),
        },
        Expr::Nested(inner) => Expr::Nested(Box::new(substitute_column(inner, from, to))),
        Expr::IsNull(inner) => Expr::IsNull(Box::new(substitute_column(inner, from, to))),
        Expr::IsNotNull(inner) => Expr::IsNotNull(Box::new(substitute_column(inner, from, to))),
        Expr::InList { expr, list, negated } => Expr::InList {
            expr: Box::new(substitute_column(expr, from, to)),
            list: list.iter().map(|e| substitute_column(e, from, to)).collect(),
            negated: *negated,
        },
        other => other.clone(),
    }
}

/// Requalifies every bare/qualified reference to `from` in `expr` to `to`,
/// cloning rather than mutating in place.
pub fn requalify(expr: &Expr, from: &str, to: &str) -> Expr {
    match expr {
        Expr::Identifier(ident) => Expr::CompoundIdentifier(vec![
            Ident::new(to.to_string()),
            ident.clone(),
        ]),
        Expr::CompoundIdentifier(idents) if idents.len() == 2 && idents[0].value == from => {
            Expr::CompoundIdentifier(vec![Ident::new(to.to_string()), idents[1].clone()])
        }
        Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
            left: Box::new(requalify(left, from, to)),
            op: op.clone(),
            right: Box::new(requalify(right, from, to)),
        },
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(requalify(expr, from, to)),
        },
        Expr::Nested(inner) => Expr::Nested(Box::new(requalify(inner, from, to))),
        Expr::IsNull(inner) => Expr::IsNull(Box::new(requalify(inner, from, to))),
        Expr::IsNotNull(inner) => Expr::IsNotNull(Box::new(requalify(inner, from, to))),
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(requalify(expr, from, to)),
            list: list.iter().map(|e| requalify(e, from, to)).collect(),
            negated: *negated,
        },
        other => other.clone(),
    }
}

/// Renames every bare/qualified reference to the column `from` to `to`,
/// preserving whatever qualifier (if any) was already on it. Unlike
/// [`requalify`] (which swaps the table qualifier and keeps the column
/// name), this swaps the column name and keeps the qualifier — for
/// translating a column whose name differs between two schemas that are
/// otherwise mapped field-for-field.
pub fn rename_column(expr: &Expr, from: &str, to: &str) -> Expr {
    match expr {
        Expr::Identifier(ident) if ident.value == from => Expr::Identifier(Ident::new(to.to_string())),
        Expr::CompoundIdentifier(idents) if idents.len() == 2 && idents[1].value == from => {
            Expr::CompoundIdentifier(vec![idents[0].clone(), Ident::new(to.to_string())])
        }
        Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
            left: Box::new(rename_column(left, from, to)),
            op: op.clone(),
            right: Box::new(rename_column(right, from, to)),
        },
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(rename_column(expr, from, to)),
        },
        Expr::Nested(inner) => Expr::Nested(Box::new(rename_column(inner, from, to))),
        Expr::IsNull(inner) => Expr::IsNull(Box::new(rename_column(inner, from, to))),
        Expr::IsNotNull(inner) => Expr::IsNotNull(Box::new(rename_column(inner, from, to))),
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(rename_column(expr, from, to)),
            list: list.iter().map(|e| rename_column(e, from, to)).collect(),
            negated: *negated,
        },
        other => other.clone(),
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

    fn aliases(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_single_table_predicate() {
        let expr = parse_expr("A.x = 1");
        let info = analyze(&expr, &aliases(&["A", "B"])).unwrap();
        assert_eq!(classify(&info), Classification::SingleTable("A".to_string()));
    }

    #[test]
    fn classifies_equi_join_across_two_tables() {
        let expr = parse_expr("A.id = B.id");
        let info = analyze(&expr, &aliases(&["A", "B"])).unwrap();
        match classify(&info) {
            Classification::EquiJoin { left, right } => {
                assert_eq!(left.table.as_deref(), Some("A"));
                assert_eq!(right.table.as_deref(), Some("B"));
            }
            other => panic!("expected EquiJoin, got {:?}", other),
        }
    }

    #[test]
    fn classifies_non_equi_cross_table_predicate_as_other() {
        let expr = parse_expr("A.b + B.b > 0");
        let info = analyze(&expr, &aliases(&["A", "B"])).unwrap();
        assert_eq!(classify(&info), Classification::OtherMultiTable);
    }

    #[test]
    fn classifies_right_side_null_check() {
        let expr = parse_expr("B.x IS NULL");
        let info = analyze(&expr, &aliases(&["A", "B"])).unwrap();
        match classify(&info) {
            Classification::NullCheck { column, negated } => {
                assert_eq!(column.table.as_deref(), Some("B"));
                assert!(!negated);
            }
            other => panic!("expected NullCheck, got {:?}", other),
        }
    }

    #[test]
    fn rejects_ambiguous_bare_column() {
        let expr = parse_expr("x = 1");
        let err = analyze(&expr, &aliases(&["A", "B"])).unwrap_err();
        assert!(err.to_string().contains("ambiguous.column"));
    }

    #[test]
    fn rejects_unknown_table_qualifier() {
        let expr = parse_expr("C.x = 1");
        let err = analyze(&expr, &aliases(&["A", "B"])).unwrap_err();
        assert!(err.to_string().contains("unknown.column"));
    }

    #[test]
    fn substitute_column_renames_table_and_field_together() {
        let expr = parse_expr("A.id = 1");
        let from = ColumnRef { table: Some("A".to_string()), name: "id".to_string() };
        let to = ColumnRef { table: Some("B".to_string()), name: "a".to_string() };
        let rewritten = substitute_column(&expr, &from, &to);
        assert_eq!(rewritten.to_string(), "B.a = 1");
    }

    #[test]
    fn requalify_rewrites_bare_and_qualified_columns() {
        let expr = parse_expr("x = 1 AND A.y = 2");
        let rewritten = requalify(&expr, "A", "B");
        assert_eq!(rewritten.to_string(), "B.x = 1 AND B.y = 2");
    }

    #[test]
    fn structural_hash_ignores_formatting_differences() {
        let a = parse_expr("a = 1");
        let b = parse_expr("a=1");
        assert_eq!(expr_key(&a), expr_key(&b));
    }

    #[test]
    fn split_conjuncts_normalises_or_within_an_and_chain() {
        let expr = parse_expr("A.id = B.id AND (A.x = 1 OR A.x = 2)");
        let info = analyze(&expr, &aliases(&["A", "B"])).unwrap();
        let _ = info;
        let parts = split_conjuncts(&expr);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().any(|p| matches!(p, Expr::InList { .. })));
    }
}
