use super::{LimitClause, OrderTerm, PlanNode};
use crate::error::{PlannerError, Result};
use crate::expr::{analyze, ExprInfo};
use crate::router::{Schemas, ShardRouter};
use crate::select::SelectTuple;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionType {
    Union,
    UnionAll,
}

/// `left` and `right` must share field count; `left_col_map`/`right_col_map`
/// translate a column name in the unified schema to each branch's schema.
#[derive(Debug, Clone)]
pub struct UnionNode {
    pub left: PlanNode,
    pub right: PlanNode,
    pub union_type: UnionType,
    pub left_col_map: Vec<String>,
    pub right_col_map: Vec<String>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<LimitClause>,
}

impl UnionNode {
    pub fn new(
        left: PlanNode,
        right: PlanNode,
        union_type: UnionType,
        left_col_map: Vec<String>,
        right_col_map: Vec<String>,
    ) -> Self {
        UnionNode {
            left,
            right,
            union_type,
            left_col_map,
            right_col_map,
            order_by: Vec::new(),
            limit: None,
        }
    }

    fn rewrite_for_right(&self, info: &ExprInfo) -> Result<ExprInfo> {
        let mut expr = info.expr.clone();
        for (unified, right_name) in self.left_col_map.iter().zip(self.right_col_map.iter()) {
            expr = crate::expr::rename_column(&expr, unified, right_name);
        }
        let known: BTreeSet<String> = info.refer_tables.clone();
        let rewritten = analyze(&expr, &known)?;
        if rewritten.refer_tables.is_empty() && !info.refer_tables.is_empty() {
            return Err(PlannerError::unsupported(
                "cannot push predicate into 'dual' table",
            ));
        }
        Ok(rewritten)
    }

    pub fn push_filter(&mut self, info: &ExprInfo) -> Result<()> {
        self.left.push_filter(info)?;
        let rewritten = self.rewrite_for_right(info)?;
        self.right.push_filter(&rewritten)
    }

    pub fn push_select_expr(&mut self, tuple: SelectTuple) -> Result<usize> {
        let idx = self.left.push_select_expr(tuple.clone())?;
        let rewritten_info = self.rewrite_for_right(&tuple.info)?;
        let mut right_tuple = tuple;
        right_tuple.info = rewritten_info;
        self.right.push_select_expr(right_tuple)?;
        Ok(idx)
    }

    pub fn push_having(&mut self, info: &ExprInfo) -> Result<()> {
        self.left.push_having(info)?;
        let rewritten = self.rewrite_for_right(info)?;
        self.right.push_having(&rewritten)
    }

    pub fn build_query(
        &mut self,
        router: &dyn ShardRouter,
        schemas: &Arc<Schemas>,
        max_fanout: usize,
    ) -> Result<()> {
        self.left.build_query(router, schemas, max_fanout)?;
        self.right.build_query(router, schemas, max_fanout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::analyze;
    use crate::plan::RouteNode;
    use crate::router::{Backend, PartitionType, Segment, TableDescriptor};
    use sqlparser::ast::Expr;
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

    fn union(left_col: &str, right_col: &str) -> UnionNode {
        UnionNode::new(
            route("left_tbl"),
            route("right_tbl"),
            UnionType::Union,
            vec![left_col.to_string()],
            vec![right_col.to_string()],
        )
    }

    fn expr(sql: &str) -> Expr {
        Parser::new(&GenericDialect {})
            .try_with_sql(sql)
            .unwrap()
            .parse_expr()
            .unwrap()
    }

    #[test]
    fn rewrite_for_right_renames_a_bare_column_that_differs_between_branches() {
        let node = union("id", "uid");
        let known = BTreeSet::new();
        let info = analyze(&expr("id"), &known).unwrap();
        let rewritten = node.rewrite_for_right(&info).unwrap();
        assert_eq!(rewritten.expr, Expr::Identifier(sqlparser::ast::Ident::new("uid")));
    }

    #[test]
    fn rewrite_for_right_renames_only_the_column_keeping_the_table_qualifier() {
        let node = union("id", "uid");
        let mut known = BTreeSet::new();
        known.insert("left_tbl".to_string());
        let info = analyze(&expr("left_tbl.id"), &known).unwrap();
        let rewritten = node.rewrite_for_right(&info).unwrap();
        assert_eq!(
            rewritten.expr,
            Expr::CompoundIdentifier(vec![
                sqlparser::ast::Ident::new("left_tbl"),
                sqlparser::ast::Ident::new("uid"),
            ])
        );
    }
}
