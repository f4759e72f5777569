//! Aggregate splitter: expands `AVG(x)` into
//! `SUM(x)/COUNT(x)` in the pushed query and records the recombination
//! recipe the executor's merge step consumes.

use crate::error::{PlannerError, Result};
use crate::plan::PlanNode;
use crate::select::{aggregate_arg, AggFunc, SelectTuple};
use serde::Serialize;
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, ObjectName, ObjectNamePart,
};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize)]
pub struct NormalAggregator {
    pub func: String,
    pub field: String,
    pub index: usize,
    pub distinct: bool,
    /// Present only for a split `AVG`: the paired `COUNT` column's index.
    pub count_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupAggregator {
    pub field: String,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregatePlan {
    pub normal: Vec<NormalAggregator>,
    pub group: Vec<GroupAggregator>,
    /// The select list re-rendered with AVG positions substituted by
    /// `sum(e) as \`avg(e)\`` / `count(e)`, for diagnostics.
    pub rewritten: String,
}

/// Pushes the SELECT list into `tree`, splitting non-distinct `AVG` calls
/// into `SUM`/`COUNT` pairs as each tuple is pushed: `AVG` never survives
/// in a pushed query.
pub fn push_select_list(
    tree: &mut PlanNode,
    tuples: Vec<SelectTuple>,
    known_aliases: &BTreeSet<String>,
) -> Result<AggregatePlan> {
    let mut normal = Vec::new();
    let mut rewritten_parts = Vec::new();

    for tuple in tuples {
        match tuple.agg_func {
            Some(AggFunc::Avg) if !tuple.distinct => {
                let arg = aggregate_arg(&tuple.expr).ok_or_else(|| {
                    PlannerError::unsupported("avg.without.argument")
                })?;
                let avg_alias = tuple.alias.clone().unwrap_or_else(|| format!("avg({})", arg));
                rewritten_parts.push(format!("sum({}) as `{}`, count({})", arg, avg_alias, arg));

                let sum_tuple = make_call_tuple("sum", arg.clone(), Some(avg_alias.clone()), known_aliases)?;
                let count_tuple = make_call_tuple("count", arg.clone(), None, known_aliases)?;
                let sum_idx = tree.push_select_expr(sum_tuple)?;
                let count_idx = tree.push_select_expr(count_tuple)?;
                normal.push(NormalAggregator {
                    func: preserve_case(&tuple),
                    field: avg_alias,
                    index: sum_idx,
                    distinct: false,
                    count_index: Some(count_idx),
                });
            }
            Some(agg) => {
                let field = tuple.field.clone();
                let distinct = tuple.distinct;
                rewritten_parts.push(render_tuple(&tuple));
                let idx = tree.push_select_expr(tuple)?;
                normal.push(NormalAggregator {
                    func: agg.lowercase().to_string(),
                    field,
                    index: idx,
                    distinct,
                    count_index: None,
                });
            }
            None => {
                rewritten_parts.push(render_tuple(&tuple));
                tree.push_select_expr(tuple)?;
            }
        }
    }

    Ok(AggregatePlan {
        normal,
        group: Vec::new(),
        rewritten: rewritten_parts.join(", "),
    })
}

fn preserve_case(tuple: &SelectTuple) -> String {
    tuple
        .agg_original_name
        .clone()
        .unwrap_or_else(|| "avg".to_string())
}

fn render_tuple(tuple: &SelectTuple) -> String {
    match &tuple.alias {
        Some(alias) => format!("{} as `{}`", tuple.expr, alias),
        None => tuple.expr.to_string(),
    }
}

fn make_call_tuple(
    func: &str,
    arg: Expr,
    alias: Option<String>,
    known_aliases: &BTreeSet<String>,
) -> Result<SelectTuple> {
    let call = Expr::Function(Function {
        name: ObjectName(vec![ObjectNamePart::Identifier(Ident::new(func))]),
        parameters: FunctionArguments::None,
        args: FunctionArguments::List(sqlparser::ast::FunctionArgumentList {
            duplicate_treatment: None,
            args: vec![FunctionArg::Unnamed(FunctionArgExpr::Expr(arg))],
            clauses: vec![],
        }),
        filter: None,
        null_treatment: None,
        over: None,
        within_group: vec![],
        uses_odbc_syntax: false,
    });
    SelectTuple::new(call, alias, known_aliases)
}

/// Validates that every GROUP BY term resolves to a select-list entry
/// (bare name, alias, or qualified reference).
pub fn validate_group_by(
    group_by: &[String],
    projections: &[SelectTuple],
    known_aliases: &BTreeSet<String>,
) -> Result<Vec<GroupAggregator>> {
    let mut out = Vec::new();
    for term in group_by {
        let (qualifier, bare) = match term.split_once('.') {
            Some((t, c)) => (Some(t.to_string()), c.to_string()),
            None => (None, term.clone()),
        };
        if let Some(t) = &qualifier {
            if !known_aliases.contains(t) {
                return Err(PlannerError::unsupported(format!(
                    "unknow.table.in.group.by.field[{}]",
                    term
                )));
            }
        }
        let position = projections.iter().position(|p| {
            p.alias.as_deref() == Some(term.as_str())
                || p.field == bare
                || (p.is_col
                    && p.column_ref()
                        .map(|c| c.name == bare && (qualifier.is_none() || c.table == qualifier))
                        .unwrap_or(false))
        });
        match position {
            Some(idx) => out.push(GroupAggregator {
                field: term.clone(),
                index: idx,
            }),
            None => {
                return Err(PlannerError::unsupported(format!(
                    "group.by.field[{}].should.be.in.select.list",
                    term
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanNode, RouteNode};
    use crate::router::{Backend, PartitionType, Segment, TableDescriptor};
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;
    use std::collections::BTreeSet;

    fn parse_select_item(sql: &str) -> SelectTuple {
        let expr = Parser::new(&GenericDialect {})
            .try_with_sql(sql)
            .unwrap()
            .parse_expr()
            .unwrap();
        SelectTuple::new(expr, None, &BTreeSet::from(["a".to_string()])).unwrap()
    }

    fn single_route() -> PlanNode {
        let desc = TableDescriptor {
            database: "d".into(),
            name: "a".into(),
            shard_type: PartitionType::Single,
            shard_key: None,
            backends: vec![Backend {
                name: "b0".into(),
                address: "b0:3306".into(),
            }],
            segments: vec![Segment {
                backend: "b0".into(),
                index: 0,
            }],
        };
        PlanNode::Route(Box::new(RouteNode::single_table(
            "d".into(),
            "a".into(),
            desc,
            "`a`".into(),
        )))
    }

    #[test]
    fn splits_non_distinct_avg_into_sum_and_count() {
        let mut tree = single_route();
        let tuple = parse_select_item("avg(a.x)");
        let plan = push_select_list(&mut tree, vec![tuple], &BTreeSet::from(["a".to_string()])).unwrap();

        assert_eq!(plan.normal.len(), 1);
        assert!(plan.normal[0].count_index.is_some());
        if let PlanNode::Route(r) = &tree {
            assert_eq!(r.projections.len(), 2);
            assert!(!r.projections.iter().any(|p| p.expr.to_string().to_lowercase().starts_with("avg")));
        } else {
            panic!("expected Route");
        }
    }

    #[test]
    fn preserves_distinct_avg_verbatim() {
        let mut tree = single_route();
        let expr = Parser::new(&GenericDialect {})
            .try_with_sql("avg(distinct a.x)")
            .unwrap()
            .parse_expr()
            .unwrap();
        let tuple = SelectTuple::new(expr, None, &BTreeSet::from(["a".to_string()])).unwrap();
        let plan = push_select_list(&mut tree, vec![tuple], &BTreeSet::from(["a".to_string()])).unwrap();

        assert_eq!(plan.normal.len(), 1);
        assert!(plan.normal[0].distinct);
        assert!(plan.normal[0].count_index.is_none());
        if let PlanNode::Route(r) = &tree {
            assert_eq!(r.projections.len(), 1);
            assert!(r.projections[0].expr.to_string().to_lowercase().contains("avg"));
        } else {
            panic!("expected Route");
        }
    }

    #[test]
    fn group_by_must_resolve_to_a_select_list_entry() {
        let tuples = vec![parse_select_item("a.x")];
        let err = validate_group_by(&["y".to_string()], &tuples, &BTreeSet::from(["a".to_string()]))
            .unwrap_err();
        assert!(err.to_string().contains("should.be.in.select.list"));
    }
}
