//! Table scanner: builds the initial plan tree bottom-up from a FROM clause
//! before any predicate or projection is pushed.

use crate::error::{PlannerError, Result};
use crate::expr::{classify, split_conjuncts, Classification, ExprInfo};
use crate::plan::{JoinNode, PlanNode, RouteNode};
use crate::router::{Schemas, ShardRouter};
use sqlparser::ast::{
    Join, JoinConstraint, JoinOperator, ObjectName, TableFactor, TableWithJoins,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Tables discovered while scanning, keyed by alias, used to seed the
/// known-aliases set every later `analyze` call validates against.
pub struct ScanResult {
    pub tree: PlanNode,
    pub aliases: BTreeSet<String>,
}

pub fn scan_from(
    database: &str,
    from: &[TableWithJoins],
    router: &dyn ShardRouter,
) -> Result<ScanResult> {
    let mut items = from.iter();
    let first = items
        .next()
        .ok_or_else(|| PlannerError::malformed("missing.from.clause"))?;
    let mut tree = scan_table_with_joins(database, first, router)?;
    let mut aliases = BTreeSet::new();
    collect_aliases(&tree, &mut aliases);

    for item in items {
        let next = scan_table_with_joins(database, item, router)?;
        collect_aliases(&next, &mut aliases);
        // A comma in the FROM list is a Cartesian product: no ON clause.
        tree = PlanNode::Join(Box::new(JoinNode::new(tree, next, false, Vec::new(), Default::default())));
    }

    Ok(ScanResult { tree, aliases })
}

fn collect_aliases(node: &PlanNode, out: &mut BTreeSet<String>) {
    match node {
        PlanNode::Route(r) => out.extend(r.tables.iter().cloned()),
        PlanNode::Join(j) => {
            collect_aliases(&j.left, out);
            collect_aliases(&j.right, out);
        }
        PlanNode::Union(u) => {
            collect_aliases(&u.left, out);
            collect_aliases(&u.right, out);
        }
    }
}

fn scan_table_with_joins(
    database: &str,
    twj: &TableWithJoins,
    router: &dyn ShardRouter,
) -> Result<PlanNode> {
    let mut left = scan_table_factor(database, &twj.relation, router)?;
    for join in &twj.joins {
        left = scan_join(database, left, join, router)?;
    }
    Ok(left)
}

fn scan_table_factor(
    database: &str,
    factor: &TableFactor,
    router: &dyn ShardRouter,
) -> Result<PlanNode> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table_name = object_name_to_string(name);
            let alias_name = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| table_name.clone());
            let desc = router
                .table_config(database, &table_name)
                .map_err(|_| crate::router::not_found(database, &table_name))?;
            let from_sql = if alias_name == table_name {
                format!("`{}`", table_name)
            } else {
                format!("`{}` AS `{}`", table_name, alias_name)
            };
            debug!(table = %table_name, alias = %alias_name, shard_type = ?desc.shard_type, "scanned table");
            Ok(PlanNode::Route(Box::new(RouteNode::single_table(
                database.to_string(),
                alias_name,
                desc,
                from_sql,
            ))))
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            let mut node = scan_table_with_joins(database, table_with_joins, router)?;
            if let PlanNode::Route(r) = &mut node {
                r.has_paren = true;
            }
            Ok(node)
        }
        TableFactor::Derived { .. } => Err(PlannerError::unsupported("subquery.in.from")),
        _ => Err(PlannerError::unsupported("from.clause.item")),
    }
}

fn scan_join(
    database: &str,
    left: PlanNode,
    join: &Join,
    router: &dyn ShardRouter,
) -> Result<PlanNode> {
    let right = scan_table_factor(database, &join.relation, router)?;
    let (is_left_join, constraint, swap) = match &join.join_operator {
        JoinOperator::Inner(c) => (false, Some(c), false),
        JoinOperator::LeftOuter(c) => (true, Some(c), false),
        // RIGHT JOIN B has no run-time meaning once sides are swapped; the
        // scanner rewrites it to a LEFT JOIN with operands exchanged.
        JoinOperator::RightOuter(c) => (true, Some(c), true),
        JoinOperator::CrossJoin(_) => (false, None, false),
        _ => return Err(PlannerError::unsupported("join.type")),
    };

    let (left, right) = if swap { (right, left) } else { (left, right) };

    let mut join_aliases = BTreeSet::new();
    collect_aliases(&left, &mut join_aliases);
    collect_aliases(&right, &mut join_aliases);

    let mut join_on = Vec::new();
    let mut other_on = Vec::new();
    let mut other_conjuncts = Vec::new();
    if let Some(JoinConstraint::On(expr)) = constraint {
        for conjunct in split_conjuncts(expr) {
            let info = crate::expr::analyze(&conjunct, &join_aliases)?;
            match classify(&info) {
                Classification::EquiJoin { left: l, right: r } => {
                    join_on.push((l, r, info));
                }
                _ => {
                    other_on.push(info.clone());
                    other_conjuncts.push(info);
                }
            }
        }
    } else if let Some(JoinConstraint::Using(_)) = constraint {
        return Err(PlannerError::unsupported("using.clause.in.join"));
    } else if let Some(JoinConstraint::Natural) = constraint {
        return Err(PlannerError::unsupported("natural.join"));
    }

    let mut node = JoinNode::new(left, right, is_left_join, Vec::new(), Some(other_join_on(other_on)));
    for (l, r, _info) in &join_on {
        node.push_filter(&equi_join_info(l.clone(), r.clone()))?;
    }
    // Non-equi-join ON-clause conjuncts (single-table constraints, constant
    // predicates, cross-table comparisons) go through the same pushdown path
    // as WHERE conjuncts, after the equi-join keys they may propagate along.
    for info in &other_conjuncts {
        node.push_filter(info)?;
    }
    Ok(PlanNode::Join(Box::new(node)))
}

fn equi_join_info(left: crate::expr::ColumnRef, right: crate::expr::ColumnRef) -> ExprInfo {
    use sqlparser::ast::{BinaryOperator, Expr, Ident};
    let mut refer_tables = BTreeSet::new();
    if let Some(t) = &left.table {
        refer_tables.insert(t.clone());
    }
    if let Some(t) = &right.table {
        refer_tables.insert(t.clone());
    }
    let to_expr = |c: &crate::expr::ColumnRef| match &c.table {
        Some(t) => Expr::CompoundIdentifier(vec![Ident::new(t.clone()), Ident::new(c.name.clone())]),
        None => Expr::Identifier(Ident::new(c.name.clone())),
    };
    let expr = Expr::BinaryOp {
        left: Box::new(to_expr(&left)),
        op: BinaryOperator::Eq,
        right: Box::new(to_expr(&right)),
    };
    ExprInfo {
        expr,
        refer_tables,
        cols: vec![left, right],
        vals: Vec::new(),
    }
}

fn other_join_on(infos: Vec<ExprInfo>) -> crate::plan::OtherJoinOn {
    crate::plan::OtherJoinOn {
        others: infos.into_iter().map(|i| i.expr).collect(),
    }
}

fn object_name_to_string(name: &ObjectName) -> String {
    name.to_string()
}

/// Looks up every global table in `schemas` for `database`, used by the
/// planner to decide whether a query touching only global tables may route
/// to any single backend.
pub fn only_global_tables(tree: &PlanNode, schemas: &Arc<Schemas>, database: &str) -> bool {
    let globals: BTreeSet<String> = schemas
        .global_tables(database)
        .into_iter()
        .map(|t| t.name.clone())
        .collect();
    fn walk(node: &PlanNode, globals: &BTreeSet<String>) -> bool {
        match node {
            PlanNode::Route(r) => r
                .descriptors
                .iter()
                .all(|d| globals.contains(&d.name) || d.is_global()),
            PlanNode::Join(j) => walk(&j.left, globals) && walk(&j.right, globals),
            PlanNode::Union(u) => walk(&u.left, globals) && walk(&u.right, globals),
        }
    }
    walk(tree, &globals)
}
