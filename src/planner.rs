//! Top-level orchestrator: enforces the phase ordering every plan must go
//! through and is the single public entry point.
//!
//! Table-scan → filter push → select-list push (aggregate split) →
//! GROUP BY validation → HAVING push → ORDER BY / LIMIT attach →
//! `calc_route` (once) → `build_query` (last, then immutable).

use crate::aggregate::{self, AggregatePlan};
use crate::config::PlannerConfig;
use crate::error::{PlannerError, Result};
use crate::expr::{analyze, split_conjuncts};
use crate::plan::{LimitClause, OrderTerm, PlanNode, UnionNode, UnionType};
use crate::router::ShardRouter;
use crate::scanner;
use crate::select::SelectTuple;
use sqlparser::ast::{Expr, Query, Select, SelectItem, SetExpr, SetOperator, SetQuantifier};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// One resolved `ORDER BY` term: which select-list position to sort on, and
/// in which direction. Resolution (name/alias/qualified-name lookup against
/// the projection list) happens before this type exists.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub table: Option<String>,
    pub column: String,
    pub asc: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitRequest {
    pub offset: i64,
    pub count: i64,
}

/// Finished output of a plan: the (possibly fused) tree plus the root-level
/// child plans the executor runs after gathering rows.
#[derive(Debug)]
pub struct PlanOutput {
    pub tree: PlanNode,
    pub aggregate: Option<AggregatePlan>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<LimitClause>,
}

/// One planned `SELECT` branch, before the whole-query ORDER BY / LIMIT /
/// route-fusion steps are applied.
struct BranchPlan {
    tree: PlanNode,
    aggregate: AggregatePlan,
    projections: Vec<SelectTuple>,
}

/// One planned `SetExpr` (a bare `SELECT` or a `UNION` of them). `aggregate`
/// is `None` for a `UNION` node: the per-branch aggregate recipes are each
/// already folded into their own branch's tree, and a union of two
/// aggregate results has no single recombination recipe of its own.
struct SetExprPlan {
    tree: PlanNode,
    aggregate: Option<AggregatePlan>,
    projections: Vec<SelectTuple>,
}

pub struct Planner {
    router: Arc<dyn ShardRouter>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(router: Arc<dyn ShardRouter>, config: PlannerConfig) -> Self {
        Planner { router, config }
    }

    #[instrument(skip(self, select), fields(database = %database))]
    pub fn plan_select(
        &self,
        database: &str,
        select: &Select,
        order_by: &[OrderRequest],
        limit: Option<LimitRequest>,
    ) -> Result<PlanOutput> {
        let database = self.resolve_database(database);
        let branch = self.plan_select_branch(database, select)?;
        self.finish(branch.tree, Some(branch.aggregate), &branch.projections, order_by, limit)
    }

    /// Entry point for a full `Query`: a plain `SELECT` or a `UNION` chain of
    /// them. `order_by`/`limit` are the top-level clauses, resolved against
    /// the leftmost branch's output columns per UNION semantics.
    #[instrument(skip(self, query), fields(database = %database))]
    pub fn plan_query(
        &self,
        database: &str,
        query: &Query,
        order_by: &[OrderRequest],
        limit: Option<LimitRequest>,
    ) -> Result<PlanOutput> {
        let database = self.resolve_database(database);
        let set = self.plan_set_expr(database, &query.body)?;
        self.finish(set.tree, set.aggregate, &set.projections, order_by, limit)
    }

    fn resolve_database<'a>(&'a self, database: &'a str) -> &'a str {
        if database.is_empty() {
            &self.config.default_database
        } else {
            database
        }
    }

    /// Plans one `SELECT`/`UNION` branch, without the top-level ORDER BY /
    /// LIMIT / route-fusion / query-emission steps shared by whole queries.
    fn plan_set_expr(&self, database: &str, set_expr: &SetExpr) -> Result<SetExprPlan> {
        match set_expr {
            SetExpr::Select(select) => {
                let branch = self.plan_select_branch(database, select)?;
                Ok(SetExprPlan {
                    tree: branch.tree,
                    aggregate: Some(branch.aggregate),
                    projections: branch.projections,
                })
            }
            SetExpr::Query(query) => self.plan_set_expr(database, &query.body),
            SetExpr::SetOperation {
                op,
                set_quantifier,
                left,
                right,
            } => {
                if !matches!(op, SetOperator::Union) {
                    return Err(PlannerError::unsupported(format!("set.operator.'{}'", op)));
                }
                let left = self.plan_set_expr(database, left)?;
                let right = self.plan_set_expr(database, right)?;
                if left.projections.len() != right.projections.len() {
                    return Err(PlannerError::malformed("union.branches.column.count.mismatch"));
                }
                let left_col_map: Vec<String> =
                    left.projections.iter().map(|t| t.field.clone()).collect();
                let right_col_map: Vec<String> =
                    right.projections.iter().map(|t| t.field.clone()).collect();
                let union_type = match set_quantifier {
                    SetQuantifier::All => UnionType::UnionAll,
                    _ => UnionType::Union,
                };
                let node = PlanNode::Union(Box::new(UnionNode::new(
                    left.tree,
                    right.tree,
                    union_type,
                    left_col_map,
                    right_col_map,
                )));
                Ok(SetExprPlan {
                    tree: node,
                    aggregate: None,
                    projections: left.projections,
                })
            }
            other => Err(PlannerError::unsupported(format!("set.expr.kind.'{}'", other))),
        }
    }

    /// Plans one `SELECT`'s tree up through HAVING: scan, filter pushdown,
    /// select-list/aggregate split, GROUP BY, HAVING. ORDER BY / LIMIT /
    /// route-fusion / emission are applied once at the whole-query level by
    /// [`Self::finish`], since a UNION's top-level clauses bind to the union
    /// result, not to an individual branch.
    fn plan_select_branch(&self, database: &str, select: &Select) -> Result<BranchPlan> {
        debug!("scanning from-clause");
        let scanner::ScanResult { mut tree, aliases } =
            scanner::scan_from(database, &select.from, self.router.as_ref())?;

        if let Some(selection) = &select.selection {
            for conjunct in split_conjuncts(selection) {
                let info = analyze(&conjunct, &aliases)?;
                tree.push_filter(&info)?;
            }
        }

        let tuples = self.build_select_list(&select.projection, &aliases)?;
        let group_by = render_group_by(&select.group_by, &aliases)?;
        let group_aggregators = aggregate::validate_group_by(&group_by, &tuples, &aliases)?;

        let projections = tuples.clone();
        let mut agg_plan = aggregate::push_select_list(&mut tree, tuples, &aliases)?;
        agg_plan.group = group_aggregators;
        if !group_by.is_empty() {
            push_group_by(&mut tree, &group_by)?;
        }

        if let Some(having) = &select.having {
            for conjunct in split_conjuncts(having) {
                let info = analyze(&conjunct, &aliases)?;
                tree.push_having(&info)?;
            }
        }

        Ok(BranchPlan {
            tree,
            aggregate: agg_plan,
            projections,
        })
    }

    /// Shared tail for both [`Self::plan_select`] and [`Self::plan_query`]:
    /// resolve and attach ORDER BY / LIMIT, fuse mergeable routes once, then
    /// stamp final per-shard SQL.
    fn finish(
        &self,
        mut tree: PlanNode,
        aggregate: Option<AggregatePlan>,
        projections: &[SelectTuple],
        order_by: &[OrderRequest],
        limit: Option<LimitRequest>,
    ) -> Result<PlanOutput> {
        let order_terms = resolve_order_terms(order_by, projections)?;
        if !order_terms.is_empty() {
            tree.push_order_by(order_terms.clone());
        }
        let limit_clause = limit.map(|l| LimitClause {
            offset: l.offset,
            count: l.count,
        });
        if let Some(limit_clause) = limit_clause {
            tree.push_limit(limit_clause);
        }

        debug!("fusing mergeable routes");
        let mut tree = tree.calc_route();

        info!("stamping final per-shard SQL");
        let schemas = self.router.schemas();
        tree.build_query(self.router.as_ref(), &schemas, self.config.max_route_fanout)?;

        Ok(PlanOutput {
            tree,
            aggregate,
            order_by: order_terms,
            limit: limit_clause,
        })
    }

    /// Renders a finished plan as JSON, honoring `config.include_rewritten_select`.
    pub fn emit(&self, output: &PlanOutput) -> Result<String> {
        crate::emit::emit_output(&output.tree, output.aggregate.as_ref(), &self.config)
    }

    fn build_select_list(
        &self,
        items: &[SelectItem],
        aliases: &BTreeSet<String>,
    ) -> Result<Vec<SelectTuple>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    out.push(SelectTuple::new(expr.clone(), None, aliases)?);
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    out.push(SelectTuple::new(expr.clone(), Some(alias.value.clone()), aliases)?);
                }
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                    return Err(PlannerError::unsupported("wildcard.select.list"));
                }
            }
        }
        Ok(out)
    }
}

fn render_group_by(
    group_by: &sqlparser::ast::GroupByExpr,
    _aliases: &BTreeSet<String>,
) -> Result<Vec<String>> {
    match group_by {
        sqlparser::ast::GroupByExpr::All(_) => {
            Err(PlannerError::unsupported("group.by.all"))
        }
        sqlparser::ast::GroupByExpr::Expressions(exprs, _) => {
            let mut out = Vec::with_capacity(exprs.len());
            for expr in exprs {
                out.push(render_group_term(expr)?);
            }
            Ok(out)
        }
    }
}

fn render_group_term(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Identifier(i) => Ok(i.value.clone()),
        Expr::CompoundIdentifier(idents) if idents.len() == 2 => {
            Ok(format!("{}.{}", idents[0].value, idents[1].value))
        }
        other => Err(PlannerError::unsupported(format!(
            "group.by.expression.'{}'",
            other
        ))),
    }
}

fn push_group_by(tree: &mut PlanNode, group_by: &[String]) -> Result<()> {
    // GROUP BY rides along with whichever Route(s) the select list already
    // landed on; a Join whose strategy survives without fusing a shared
    // group-by column is out of scope here.
    if let PlanNode::Route(r) = tree {
        r.group_by = group_by.to_vec();
        Ok(())
    } else {
        Err(PlannerError::unsupported("group.by.in.cross-shard.join"))
    }
}

fn resolve_order_terms(
    requests: &[OrderRequest],
    projections: &[SelectTuple],
) -> Result<Vec<OrderTerm>> {
    let mut out = Vec::with_capacity(requests.len());
    for req in requests {
        let matched = projections.iter().find(|p| {
            if let Some(table) = &req.table {
                p.column_ref()
                    .map(|c| c.table.as_deref() == Some(table.as_str()) && c.name == req.column)
                    .unwrap_or(false)
            } else {
                p.alias.as_deref() == Some(req.column.as_str())
                    || p.field == req.column
                    || p.column_ref().map(|c| c.name == req.column).unwrap_or(false)
            }
        });
        match matched {
            Some(tuple) => out.push(OrderTerm {
                field: tuple.field.clone(),
                asc: req.asc,
            }),
            None => {
                return Err(PlannerError::unsupported(format!(
                    "unknown.column.in.order.clause[{}]",
                    req.column
                )))
            }
        }
    }
    Ok(out)
}
