use super::{route::column_ref_matches, LimitClause, OrderTerm, PlanNode};
use crate::error::{PlannerError, Result};
use crate::expr::{analyze, classify, substitute_column, ColumnRef, Classification, ExprInfo};
use crate::router::{Schemas, ShardRouter};
use crate::select::SelectTuple;
use sqlparser::ast::{BinaryOperator, Expr};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    Cartesian,
    SortMerge,
    NestLoop,
}

/// An equi-join pair straddling the two children, taken from the ON clause
/// or from a WHERE predicate.
#[derive(Debug, Clone)]
pub struct EquiPair {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone)]
pub struct JoinKey {
    pub field: String,
    pub table: String,
    pub index_in_child_fields: usize,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub left_index: usize,
    pub right_index: usize,
    pub op: BinaryOperator,
    pub exchange: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OtherJoinOn {
    pub others: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct JoinNode {
    pub left: PlanNode,
    pub right: PlanNode,
    pub is_left_join: bool,
    pub strategy: JoinStrategy,
    pub join_on: Vec<EquiPair>,
    pub left_keys: Vec<JoinKey>,
    pub right_keys: Vec<JoinKey>,
    pub cmp_filter: Vec<Comparison>,
    pub other_filter: Vec<Expr>,
    pub no_table_filter: Vec<Expr>,
    pub other_join_on: Option<OtherJoinOn>,
    pub right_null: Vec<Expr>,
    /// Projection shuffle: negative `-(i+1)` reads left row column `i`,
    /// positive `+(i+1)` reads right.
    pub cols: Vec<i64>,
    pub left_tmp_cols: Vec<String>,
    pub right_tmp_cols: Vec<String>,
    pub vars: HashMap<String, String>,
    pub has_right_filter: bool,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<LimitClause>,
}

impl JoinNode {
    pub fn new(
        left: PlanNode,
        right: PlanNode,
        is_left_join: bool,
        join_on: Vec<EquiPair>,
        other_join_on: Option<OtherJoinOn>,
    ) -> Self {
        let strategy = if join_on.is_empty() {
            JoinStrategy::Cartesian
        } else {
            JoinStrategy::SortMerge
        };
        JoinNode {
            left,
            right,
            is_left_join,
            strategy,
            join_on,
            left_keys: Vec::new(),
            right_keys: Vec::new(),
            cmp_filter: Vec::new(),
            other_filter: Vec::new(),
            no_table_filter: Vec::new(),
            other_join_on,
            right_null: Vec::new(),
            cols: Vec::new(),
            left_tmp_cols: Vec::new(),
            right_tmp_cols: Vec::new(),
            vars: HashMap::new(),
            has_right_filter: false,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Forces the Nested-Loop strategy once, and propagates it to any child
    /// that is itself a Join, so siblings never silently remain SortMerge
    /// so sibling joins never silently remain in SortMerge.
    pub fn set_nest_loop(&mut self) {
        self.strategy = JoinStrategy::NestLoop;
        if let PlanNode::Join(j) = &mut self.left {
            j.set_nest_loop();
        }
        if let PlanNode::Join(j) = &mut self.right {
            j.set_nest_loop();
        }
    }

    fn owning_side(&self, table: &str) -> Side {
        if self.left.owns_table(table) {
            Side::Left
        } else {
            Side::Right
        }
    }

    pub fn push_filter(&mut self, info: &ExprInfo) -> Result<()> {
        match classify(info) {
            Classification::NoTables => {
                self.no_table_filter.push(info.expr.clone());
            }
            Classification::SingleTable(table) => {
                self.push_single_table_filter(&table, info)?;
            }
            Classification::NullCheck { column, negated } => {
                let table = column
                    .table
                    .clone()
                    .ok_or_else(|| PlannerError::internal("null check without owning table"))?;
                if self.is_left_join && !negated && matches!(self.owning_side(&table), Side::Right)
                {
                    self.right_null.push(info.expr.clone());
                    self.has_right_filter = true;
                } else {
                    self.push_single_table_filter(&table, info)?;
                }
            }
            Classification::EquiJoin { left, right } => {
                self.record_equi(&left, &right);
            }
            Classification::OtherMultiTable => {
                self.other_filter.push(info.expr.clone());
                if self.references_right(info) {
                    self.has_right_filter = true;
                }
                self.set_nest_loop();
            }
        }
        Ok(())
    }

    fn references_right(&self, info: &ExprInfo) -> bool {
        info.refer_tables.iter().any(|t| self.right.owns_table(t))
    }

    fn push_single_table_filter(&mut self, table: &str, info: &ExprInfo) -> Result<()> {
        match self.owning_side(table) {
            Side::Left => self.left.push_filter(info)?,
            Side::Right => {
                self.right.push_filter(info)?;
                if self.is_left_join {
                    self.has_right_filter = true;
                }
            }
        }
        // Key filter propagation: duplicate onto the other side when the
        // predicate's column matches a known join key.
        for pair in self.join_on.clone() {
            let (owned, other) = if column_ref_matches(&pair.left, table) {
                (&pair.left, &pair.right)
            } else if column_ref_matches(&pair.right, table) {
                (&pair.right, &pair.left)
            } else {
                continue;
            };
            if predicate_column_matches(&info.expr, owned) {
                let other_table = other.table.clone().unwrap_or_default();
                let twin_expr = substitute_column(&info.expr, owned, other);
                let twin = analyze(&twin_expr, &BTreeSet::from([other_table.clone()]))?;
                match self.owning_side(&other_table) {
                    Side::Left => self.left.push_filter(&twin)?,
                    Side::Right => self.right.push_filter(&twin)?,
                }
            }
        }
        Ok(())
    }

    fn record_equi(&mut self, left: &ColumnRef, right: &ColumnRef) {
        let (l, r) = if left.table.as_ref().map(|t| self.left.owns_table(t)).unwrap_or(false) {
            (left.clone(), right.clone())
        } else {
            (right.clone(), left.clone())
        };
        if !self.join_on.iter().any(|p| p.left == l && p.right == r) {
            self.join_on.push(EquiPair {
                left: l,
                right: r,
            });
        }
        if self.strategy == JoinStrategy::Cartesian {
            self.strategy = JoinStrategy::SortMerge;
        }
    }

    pub fn push_select_expr(&mut self, tuple: SelectTuple) -> Result<usize> {
        let refer = tuple.refer_tables().clone();
        let in_left = refer.iter().all(|t| self.left.owns_table(t));
        let in_right = refer.iter().all(|t| self.right.owns_table(t));
        if refer.is_empty() || in_left {
            let idx = self.left.push_select_expr(tuple)?;
            self.cols.push(-((idx as i64) + 1));
            Ok(self.cols.len() - 1)
        } else if in_right {
            let idx = self.right.push_select_expr(tuple)?;
            self.cols.push((idx as i64) + 1);
            Ok(self.cols.len() - 1)
        } else {
            // Spans both children: not pushable as a single-shard column.
            // Force Nested-Loop and materialise a placeholder on the right
            // side; the executor fills it in once rows are gathered.
            self.set_nest_loop();
            let alias = tuple.alias.clone().unwrap_or_else(|| tuple.field.clone());
            self.right_tmp_cols.push(alias.clone());
            let placeholder = SelectTuple::new(
                Expr::Value(crate::value::null_value_with_span()),
                Some(alias),
                &BTreeSet::new(),
            )?;
            let idx = self.right.push_select_expr(placeholder)?;
            self.cols.push((idx as i64) + 1);
            Ok(self.cols.len() - 1)
        }
    }

    pub fn push_having(&mut self, info: &ExprInfo) -> Result<()> {
        match classify(info) {
            Classification::SingleTable(table) | Classification::NullCheck { column: ColumnRef { table: Some(table), .. }, .. } => {
                match self.owning_side(&table) {
                    Side::Left => self.left.push_having(info),
                    Side::Right => self.right.push_having(info),
                }
            }
            _ => Err(PlannerError::unsupported(format!(
                "havings.'{}'.in.cross-shard.join",
                info.expr
            ))),
        }
    }

    fn finalize_keys(&mut self) -> Result<()> {
        if self.strategy != JoinStrategy::SortMerge || self.join_on.is_empty() {
            return Ok(());
        }
        for pair in self.join_on.clone() {
            let left_table = pair.left.table.clone().unwrap_or_default();
            let right_table = pair.right.table.clone().unwrap_or_default();
            let left_idx = ensure_projected(&mut self.left, &pair.left)?;
            let right_idx = ensure_projected(&mut self.right, &pair.right)?;
            self.left_keys.push(JoinKey {
                field: pair.left.name.clone(),
                table: left_table,
                index_in_child_fields: left_idx,
            });
            self.right_keys.push(JoinKey {
                field: pair.right.name.clone(),
                table: right_table,
                index_in_child_fields: right_idx,
            });
        }
        let left_terms: Vec<OrderTerm> = self
            .left_keys
            .iter()
            .map(|k| OrderTerm {
                field: k.field.clone(),
                asc: true,
            })
            .collect();
        let right_terms: Vec<OrderTerm> = self
            .right_keys
            .iter()
            .map(|k| OrderTerm {
                field: k.field.clone(),
                asc: true,
            })
            .collect();
        self.left.push_order_by(left_terms);
        self.right.push_order_by(right_terms);
        Ok(())
    }

    fn bind_other_filters(&mut self) -> Result<()> {
        if self.other_filter.is_empty() {
            return Ok(());
        }
        let left_tables = collect_tables(&self.left);
        let right_tables = collect_tables(&self.right);
        for expr in self.other_filter.clone() {
            match split_cross_predicate(&expr, &left_tables, &right_tables) {
                Some((left_expr, op, right_expr, exchange)) => {
                    let left_index = ensure_projected_expr(&mut self.left, &left_expr, &left_tables)?;
                    let right_index = ensure_projected_expr(&mut self.right, &right_expr, &right_tables)?;
                    self.cmp_filter.push(Comparison {
                        left_index,
                        right_index,
                        op,
                        exchange,
                    });
                }
                None => {
                    return Err(PlannerError::unsupported(format!(
                        "clause.'{}'.in.cross-shard.join",
                        expr
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn build_query(
        &mut self,
        router: &dyn ShardRouter,
        schemas: &Arc<Schemas>,
        max_fanout: usize,
    ) -> Result<()> {
        if self.strategy == JoinStrategy::NestLoop {
            self.bind_other_filters()?;
        } else {
            self.finalize_keys()?;
        }
        self.left.build_query(router, schemas, max_fanout)?;
        self.right.build_query(router, schemas, max_fanout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RouteNode;
    use crate::router::{Backend, PartitionType, Segment, TableDescriptor};
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn route(alias: &str) -> PlanNode {
        let desc = TableDescriptor {
            database: "d".into(),
            name: alias.into(),
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
            alias.into(),
            desc,
            format!("`{}`", alias),
        )))
    }

    fn cross_join(left_alias: &str, right_alias: &str, other_filter: &str) -> JoinNode {
        let mut join = JoinNode::new(route(left_alias), route(right_alias), false, Vec::new(), None);
        join.set_nest_loop();
        let expr = Parser::new(&GenericDialect {})
            .try_with_sql(other_filter)
            .unwrap()
            .parse_expr()
            .unwrap();
        join.other_filter.push(expr);
        join
    }

    fn projected_column(node: &PlanNode, idx: usize) -> String {
        match node {
            PlanNode::Route(r) => r.projections[idx].expr.to_string(),
            _ => panic!("expected a Route"),
        }
    }

    #[test]
    fn bind_other_filters_projects_each_side_and_keeps_the_real_operator() {
        let mut join = cross_join("a", "b", "a.x > b.y");
        join.bind_other_filters().unwrap();

        assert_eq!(join.cmp_filter.len(), 1);
        let cmp = &join.cmp_filter[0];
        assert_eq!(cmp.op, BinaryOperator::Gt);
        assert!(!cmp.exchange);
        assert_eq!(projected_column(&join.left, cmp.left_index), "a.x");
        assert_eq!(projected_column(&join.right, cmp.right_index), "b.y");
    }

    #[test]
    fn bind_other_filters_records_exchange_when_operands_are_reversed() {
        let mut join = cross_join("a", "b", "b.y < a.x");
        join.bind_other_filters().unwrap();

        assert_eq!(join.cmp_filter.len(), 1);
        let cmp = &join.cmp_filter[0];
        assert_eq!(cmp.op, BinaryOperator::Lt);
        assert!(cmp.exchange);
        assert_eq!(projected_column(&join.left, cmp.left_index), "a.x");
        assert_eq!(projected_column(&join.right, cmp.right_index), "b.y");
    }

    #[test]
    fn ensure_projected_does_not_reuse_a_same_named_column_from_a_different_table() {
        let mut node = route("a");
        let a_x = Expr::CompoundIdentifier(vec![
            sqlparser::ast::Ident::new("a"),
            sqlparser::ast::Ident::new("x"),
        ]);
        let known = BTreeSet::from(["a".to_string()]);
        let tuple = SelectTuple::new(a_x, None, &known).unwrap();
        let a_idx = node.push_select_expr(tuple).unwrap();

        let b_x = ColumnRef {
            table: Some("b".into()),
            name: "x".into(),
        };
        let b_idx = ensure_projected(&mut node, &b_x).unwrap();

        assert_ne!(a_idx, b_idx);
        assert_eq!(projected_column(&node, b_idx), "b.x");
    }

    #[test]
    fn record_equi_keeps_two_join_keys_that_share_a_column() {
        let mut join = JoinNode::new(route("A"), route("B"), false, Vec::new(), None);
        let a_id = ColumnRef {
            table: Some("A".into()),
            name: "id".into(),
        };
        join.record_equi(&a_id, &ColumnRef { table: Some("B".into()), name: "x".into() });
        join.record_equi(&a_id, &ColumnRef { table: Some("B".into()), name: "y".into() });

        assert_eq!(join.join_on.len(), 2);
        assert_eq!(join.join_on[0].right.name, "x");
        assert_eq!(join.join_on[1].right.name, "y");
    }

    #[test]
    fn bind_other_filters_rejects_cross_side_arithmetic() {
        let mut join = cross_join("a", "b", "a.x + b.y > 0");
        let err = join.bind_other_filters().unwrap_err();
        assert!(err.to_string().contains("cross-shard.join"));
    }
}

enum Side {
    Left,
    Right,
}

fn predicate_column_matches(expr: &Expr, col: &ColumnRef) -> bool {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => expr_is_column(left, col) || expr_is_column(right, col),
        _ => false,
    }
}

fn expr_is_column(expr: &Expr, col: &ColumnRef) -> bool {
    match expr {
        Expr::Identifier(i) => i.value == col.name,
        Expr::CompoundIdentifier(idents) if idents.len() == 2 => {
            Some(idents[0].value.as_str()) == col.table.as_deref() && idents[1].value == col.name
        }
        _ => false,
    }
}

fn collect_tables(node: &PlanNode) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_tables_inner(node, &mut out);
    out
}

fn collect_tables_inner(node: &PlanNode, out: &mut BTreeSet<String>) {
    match node {
        PlanNode::Route(r) => out.extend(r.tables.iter().cloned()),
        PlanNode::Join(j) => {
            collect_tables_inner(&j.left, out);
            collect_tables_inner(&j.right, out);
        }
        PlanNode::Union(u) => {
            collect_tables_inner(&u.left, out);
            collect_tables_inner(&u.right, out);
        }
    }
}

/// Splits a cross-side comparison into `(left_operand, op, right_operand,
/// exchanged)` when each top-level operand refers exclusively to one side.
/// Returns `None` when no clean split exists.
fn split_cross_predicate(
    expr: &Expr,
    left_tables: &BTreeSet<String>,
    right_tables: &BTreeSet<String>,
) -> Option<(Expr, BinaryOperator, Expr, bool)> {
    if let Expr::BinaryOp { left, op, right } = expr {
        if matches!(
            op,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
        ) {
            let l_tables = analyze(left, &left_tables.union(right_tables).cloned().collect())
                .ok()?
                .refer_tables;
            let r_tables = analyze(right, &left_tables.union(right_tables).cloned().collect())
                .ok()?
                .refer_tables;
            if l_tables.is_subset(left_tables) && r_tables.is_subset(right_tables) {
                return Some(((**left).clone(), op.clone(), (**right).clone(), false));
            }
            if l_tables.is_subset(right_tables) && r_tables.is_subset(left_tables) {
                return Some(((**right).clone(), op.clone(), (**left).clone(), true));
            }
        }
    }
    None
}

/// Finds-or-inserts an arbitrary cross-shard comparison operand in a child's
/// projection list, returning its index. Unlike [`ensure_projected`], the
/// operand need not be a bare column (`A.x + 1` is just as valid).
fn ensure_projected_expr(node: &mut PlanNode, expr: &Expr, tables: &BTreeSet<String>) -> Result<usize> {
    if let PlanNode::Route(r) = node {
        if let Some(idx) = r.projections.iter().position(|t| &t.expr == expr) {
            return Ok(idx);
        }
    }
    let tuple = SelectTuple::new(expr.clone(), None, tables)?;
    node.push_select_expr(tuple)
}

fn ensure_projected(node: &mut PlanNode, col: &ColumnRef) -> Result<usize> {
    if let PlanNode::Route(r) = node {
        if let Some(idx) = r.projections.iter().position(|t| {
            t.is_col
                && t.info
                    .cols
                    .first()
                    .map(|c| c.name == col.name && c.table == col.table)
                    .unwrap_or(false)
        }) {
            return Ok(idx);
        }
        let expr = Expr::CompoundIdentifier(vec![
            sqlparser::ast::Ident::new(col.table.clone().unwrap_or_default()),
            sqlparser::ast::Ident::new(col.name.clone()),
        ]);
        let known = BTreeSet::from([col.table.clone().unwrap_or_default()]);
        let tuple = SelectTuple::new(expr, None, &known)?;
        node.push_select_expr(tuple)
    } else {
        let expr = Expr::CompoundIdentifier(vec![
            sqlparser::ast::Ident::new(col.table.clone().unwrap_or_default()),
            sqlparser::ast::Ident::new(col.name.clone()),
        ]);
        let known = BTreeSet::from([col.table.clone().unwrap_or_default()]);
        let tuple = SelectTuple::new(expr, None, &known)?;
        node.push_select_expr(tuple)
    }
}
