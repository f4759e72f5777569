//! Projection-list items (`selectTuple`) and aggregate
//! function classification.

use crate::expr::{analyze, ColumnRef, ExprInfo};
use crate::error::Result;
use sqlparser::ast::{Expr, FunctionArg, FunctionArgExpr, FunctionArguments};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl AggFunc {
    pub fn from_name(name: &str) -> Option<AggFunc> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(AggFunc::Sum),
            "count" => Some(AggFunc::Count),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "avg" => Some(AggFunc::Avg),
            _ => None,
        }
    }

    pub fn lowercase(self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Count => "count",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Avg => "avg",
        }
    }
}

/// One projection-list entry.
#[derive(Debug, Clone)]
pub struct SelectTuple {
    pub expr: Expr,
    pub alias: Option<String>,
    /// Printable output name: alias if present, else the rendered expression.
    pub field: String,
    pub info: ExprInfo,
    pub agg_func: Option<AggFunc>,
    /// Whether `expr` is a bare column reference (vs. a computed expression).
    pub is_col: bool,
    /// Original spelling of the aggregate function name, e.g. `AVG` vs `avg`.
    pub agg_original_name: Option<String>,
    pub distinct: bool,
}

impl SelectTuple {
    pub fn new(expr: Expr, alias: Option<String>, known_aliases: &BTreeSet<String>) -> Result<Self> {
        let info = analyze(&expr, known_aliases)?;
        let is_col = matches!(expr, Expr::Identifier(_) | Expr::CompoundIdentifier(_));
        let (agg_func, agg_original_name, distinct) = detect_aggregate(&expr);
        let field = alias.clone().unwrap_or_else(|| render_field_name(&expr));
        Ok(SelectTuple {
            expr,
            alias,
            field,
            info,
            agg_func,
            is_col,
            agg_original_name,
            distinct,
        })
    }

    pub fn refer_tables(&self) -> &BTreeSet<String> {
        &self.info.refer_tables
    }

    pub fn column_ref(&self) -> Option<ColumnRef> {
        self.info.cols.first().cloned().filter(|_| self.is_col)
    }
}

fn detect_aggregate(expr: &Expr) -> (Option<AggFunc>, Option<String>, bool) {
    if let Expr::Function(func) = expr {
        let name = func.name.to_string();
        if let Some(agg) = AggFunc::from_name(&name) {
            let distinct = matches!(
                &func.args,
                FunctionArguments::List(list) if list.duplicate_treatment == Some(sqlparser::ast::DuplicateTreatment::Distinct)
            );
            return (Some(agg), Some(name), distinct);
        }
    }
    (None, None, false)
}

fn render_field_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(i) => i.value.clone(),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Extracts the single scalar argument of an aggregate function call, e.g.
/// the `x` in `AVG(x)`. Returns `None` for `COUNT(*)`.
pub fn aggregate_arg(expr: &Expr) -> Option<Expr> {
    if let Expr::Function(func) = expr {
        if let FunctionArguments::List(list) = &func.args {
            if let Some(FunctionArg::Unnamed(FunctionArgExpr::Expr(e))) = list.args.first() {
                return Some(e.clone());
            }
        }
    }
    None
}
