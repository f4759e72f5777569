use super::{LimitClause, OrderTerm};
use crate::error::{PlannerError, Result};
use crate::expr::{ColumnRef, ExprInfo};
use crate::router::{Schemas, Segment, ShardRouter, TableDescriptor};
use crate::select::SelectTuple;
use crate::value::Literal;
use sqlparser::ast::{BinaryOperator, Expr};
use std::sync::Arc;

/// A leaf plan node: one or more tables routed together to a single backend
/// as one SELECT.
#[derive(Debug, Clone)]
pub struct RouteNode {
    pub database: String,
    /// Aliases of the tables this route owns, in FROM-clause order.
    pub tables: Vec<String>,
    pub descriptors: Vec<TableDescriptor>,
    /// Rendered FROM-clause fragment, e.g. `A` or `` A JOIN B ON A.id = B.id ``.
    pub from_sql: String,
    pub where_exprs: Vec<Expr>,
    pub having_exprs: Vec<Expr>,
    pub projections: Vec<SelectTuple>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<LimitClause>,
    pub index: Vec<usize>,
    pub backend: Option<String>,
    pub non_global_count: usize,
    pub has_paren: bool,
    /// Predicates with no table references, propagated down from an
    /// ancestor `Join`; folded into the final WHERE at `build_query` time.
    pub no_table_filter: Vec<Expr>,
    pub final_sql: Option<String>,
    pub field_probe_sql: Option<String>,
}

impl RouteNode {
    pub fn single_table(database: String, alias: String, desc: TableDescriptor, from_sql: String) -> Self {
        let non_global_count = if desc.is_global() { 0 } else { 1 };
        RouteNode {
            database,
            tables: vec![alias],
            descriptors: vec![desc],
            from_sql,
            where_exprs: Vec::new(),
            having_exprs: Vec::new(),
            projections: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            index: Vec::new(),
            backend: None,
            non_global_count,
            has_paren: false,
            no_table_filter: Vec::new(),
            final_sql: None,
            field_probe_sql: None,
        }
    }

    pub fn descriptor_for(&self, alias: &str) -> Option<&TableDescriptor> {
        self.tables
            .iter()
            .position(|t| t == alias)
            .and_then(|i| self.descriptors.get(i))
    }

    pub fn shard_key_table(&self) -> Option<(&TableDescriptor, &str)> {
        if self.descriptors.len() != 1 {
            return None;
        }
        let desc = &self.descriptors[0];
        desc.shard_key.as_deref().map(|k| (desc, k))
    }

    /// The backend every one of this route's tables is statically pinned to,
    /// if every descriptor resolves to the same one (Single/Global tables
    /// only; a sharded descriptor's backend depends on runtime shard-key
    /// values and is never "static").
    pub fn static_backend(&self) -> Option<&str> {
        let mut backends = self.descriptors.iter().map(|d| d.single_backend());
        let first = backends.next()??;
        if backends.all(|b| b == Some(first)) {
            Some(first)
        } else {
            None
        }
    }

    pub fn push_filter(&mut self, info: &ExprInfo) -> Result<()> {
        self.where_exprs.push(info.expr.clone());
        Ok(())
    }

    pub fn push_select_expr(&mut self, tuple: SelectTuple) -> Result<usize> {
        self.projections.push(tuple);
        Ok(self.projections.len() - 1)
    }

    pub fn push_having(&mut self, info: &ExprInfo) -> Result<()> {
        self.having_exprs.push(info.expr.clone());
        Ok(())
    }

    /// Collects `(column, literal)` equality/IN constraints over `column`
    /// from the accumulated WHERE list, for shard-key pruning.
    fn literal_constraints(&self, column: &str) -> Vec<Literal> {
        let mut out = Vec::new();
        for expr in &self.where_exprs {
            collect_constraints(expr, column, &mut out);
        }
        out
    }

    pub fn build_query(
        &mut self,
        router: &dyn ShardRouter,
        _schemas: &Arc<Schemas>,
        max_fanout: usize,
    ) -> Result<()> {
        if let Some((desc, key)) = self.shard_key_table().map(|(d, k)| (d.clone(), k.to_string())) {
            if desc.shard_type.is_sharded() {
                let literals = self.literal_constraints(&key);
                let segments = if literals.is_empty() {
                    router.lookup(&self.database, &desc.name, None, None)?
                } else {
                    let mut merged: Vec<Segment> = Vec::new();
                    for lit in &literals {
                        let idx = router.get_index(&self.database, &desc.name, lit)?;
                        for seg in router.get_segments(&self.database, &desc.name, &[idx])? {
                            if !merged.iter().any(|s| s.index == seg.index) {
                                merged.push(seg);
                            }
                        }
                    }
                    merged.sort_by_key(|s| s.index);
                    merged
                };
                check_fanout(&desc.name, segments.len(), max_fanout)?;
                self.index = segments.iter().map(|s| s.index).collect();
                if let Some(first) = segments.first() {
                    if segments.iter().all(|s| s.backend == first.backend) {
                        self.backend = Some(first.backend.clone());
                    }
                }
            } else if let Some(b) = desc.single_backend() {
                self.backend = Some(b.to_string());
                self.index = desc.segments.iter().map(|s| s.index).collect();
            }
        } else if self.descriptors.len() == 1 {
            let desc = &self.descriptors[0];
            if let Some(b) = desc.single_backend() {
                self.backend = Some(b.to_string());
            }
            self.index = desc.segments.iter().map(|s| s.index).collect();
        } else {
            self.resolve_fused_backend(router, max_fanout)?;
        }

        self.final_sql = Some(self.render(false));
        self.field_probe_sql = Some(self.render(true));
        Ok(())
    }

    /// Resolves backend/index for a route fused from more than one table.
    /// The fusion was only legal because the merge decider already proved
    /// either a shared static backend or a matching sharded key, so this
    /// re-derives from whichever descriptor actually carries the constraint.
    fn resolve_fused_backend(&mut self, router: &dyn ShardRouter, max_fanout: usize) -> Result<()> {
        for desc in self.descriptors.clone() {
            if !desc.shard_type.is_sharded() {
                continue;
            }
            let Some(key) = &desc.shard_key else { continue };
            let literals = self.literal_constraints(key);
            if literals.is_empty() {
                continue;
            }
            let mut merged: Vec<Segment> = Vec::new();
            for lit in &literals {
                let idx = router.get_index(&self.database, &desc.name, lit)?;
                for seg in router.get_segments(&self.database, &desc.name, &[idx])? {
                    if !merged.iter().any(|s| s.index == seg.index) {
                        merged.push(seg);
                    }
                }
            }
            merged.sort_by_key(|s| s.index);
            check_fanout(&desc.name, merged.len(), max_fanout)?;
            self.index = merged.iter().map(|s| s.index).collect();
            if let Some(first) = merged.first() {
                if merged.iter().all(|s| s.backend == first.backend) {
                    self.backend = Some(first.backend.clone());
                }
            }
            return Ok(());
        }

        if let Some(backend) = self.static_backend() {
            self.backend = Some(backend.to_string());
        }
        Ok(())
    }

    fn render(&self, field_probe: bool) -> String {
        let mut sql = String::from("SELECT ");
        if self.projections.is_empty() {
            sql.push('*');
        } else {
            let cols: Vec<String> = self
                .projections
                .iter()
                .map(|t| render_projection(t))
                .collect();
            sql.push_str(&cols.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&self.from_sql);

        let mut where_exprs = self.no_table_filter.clone();
        where_exprs.extend(self.where_exprs.iter().cloned());
        if field_probe {
            sql.push_str(" WHERE 1 != 1");
        } else if !where_exprs.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&join_and(&where_exprs));
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.having_exprs.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&join_and(&self.having_exprs));
        }
        if !field_probe {
            if !self.order_by.is_empty() {
                sql.push_str(" ORDER BY ");
                let terms: Vec<String> = self
                    .order_by
                    .iter()
                    .map(|o| format!("{} {}", o.field, if o.asc { "ASC" } else { "DESC" }))
                    .collect();
                sql.push_str(&terms.join(", "));
            }
            if let Some(limit) = &self.limit {
                sql.push_str(&format!(" LIMIT {}, {}", limit.offset, limit.count));
            }
        }
        sql
    }
}

fn render_projection(tuple: &SelectTuple) -> String {
    let body = tuple.expr.to_string();
    match &tuple.alias {
        Some(alias) => format!("{} AS `{}`", body, alias),
        None => body,
    }
}

fn join_and(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn collect_constraints(expr: &Expr, column: &str, out: &mut Vec<Literal>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_constraints(left, column, out);
            collect_constraints(right, column, out);
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if column_matches(left, column) {
                if let Expr::Value(v) = right.as_ref() {
                    if let Some(lit) = Literal::from_ast_spanned(v) {
                        out.push(lit);
                    }
                }
            } else if column_matches(right, column) {
                if let Expr::Value(v) = left.as_ref() {
                    if let Some(lit) = Literal::from_ast_spanned(v) {
                        out.push(lit);
                    }
                }
            }
        }
        Expr::InList {
            expr: inner,
            list,
            negated: false,
        } if column_matches(inner, column) => {
            for item in list {
                if let Expr::Value(v) = item {
                    if let Some(lit) = Literal::from_ast_spanned(v) {
                        out.push(lit);
                    }
                }
            }
        }
        Expr::Nested(inner) => collect_constraints(inner, column, out),
        _ => {}
    }
}

fn column_matches(expr: &Expr, column: &str) -> bool {
    match expr {
        Expr::Identifier(i) => i.value == column,
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.as_str()) == Some(column),
        _ => false,
    }
}

pub fn column_ref_matches(col: &ColumnRef, alias: &str) -> bool {
    col.table.as_deref() == Some(alias)
}

pub(crate) fn catalog_err(msg: impl Into<String>) -> PlannerError {
    PlannerError::catalog(msg)
}

/// Rejects a route whose resolved segment count exceeds the configured
/// fan-out cap, before a query is ever stamped out to that many backends.
fn check_fanout(table: &str, resolved: usize, max_fanout: usize) -> Result<()> {
    if resolved > max_fanout {
        Err(PlannerError::unsupported(format!(
            "route.fanout[{}].exceeds.max[{}].for.table[{}]",
            resolved, max_fanout, table
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Backend, InMemoryRouter, PartitionType, Schemas, Segment, TableDescriptor};
    use std::collections::HashMap;

    fn hash_table(name: &str, num_segments: usize) -> TableDescriptor {
        let segments: Vec<Segment> = (0..num_segments)
            .map(|i| Segment {
                backend: format!("b{}", i),
                index: i,
            })
            .collect();
        let backends: Vec<Backend> = segments
            .iter()
            .map(|s| Backend {
                name: s.backend.clone(),
                address: format!("{}:3306", s.backend),
            })
            .collect();
        TableDescriptor {
            database: "d".into(),
            name: name.into(),
            shard_type: PartitionType::Hash,
            shard_key: Some("id".into()),
            backends,
            segments,
        }
    }

    fn router_for(desc: TableDescriptor) -> InMemoryRouter {
        let mut by_name = HashMap::new();
        by_name.insert(desc.name.clone(), desc);
        let mut databases = HashMap::new();
        databases.insert("d".to_string(), by_name);
        InMemoryRouter::new(Schemas { databases })
    }

    #[test]
    fn build_query_rejects_a_full_scan_over_the_fanout_cap() {
        let desc = hash_table("a", 8);
        let router = router_for(desc.clone());
        let mut route = RouteNode::single_table("d".into(), "a".into(), desc, "`a`".into());
        let schemas = router.schemas();
        let err = route.build_query(&router, &schemas, 4).unwrap_err();
        assert!(err.to_string().contains("route.fanout"));
    }

    #[test]
    fn build_query_allows_a_full_scan_within_the_fanout_cap() {
        let desc = hash_table("a", 4);
        let router = router_for(desc.clone());
        let mut route = RouteNode::single_table("d".into(), "a".into(), desc, "`a`".into());
        let schemas = router.schemas();
        route.build_query(&router, &schemas, 4).unwrap();
        assert_eq!(route.index.len(), 4);
    }
}
