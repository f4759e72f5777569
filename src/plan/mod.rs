//! Plan-node algebra: the `{Route, Join, Union}` sum type and its push/build
//! operations.

pub mod join;
pub mod route;
pub mod union;

pub use join::{Comparison, EquiPair, JoinKey, JoinNode, JoinStrategy, OtherJoinOn};
pub use route::RouteNode;
pub use union::{UnionNode, UnionType};

use crate::aggregate::AggregatePlan;
use crate::error::Result;
use crate::expr::ExprInfo;
use crate::router::{Schemas, ShardRouter};
use crate::select::SelectTuple;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub field: String,
    pub asc: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitClause {
    pub offset: i64,
    pub count: i64,
}

/// Child plans run by the executor after shard rows are gathered
/// attached to the root of the tree in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct ChildPlans {
    pub aggregate: Option<AggregatePlan>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<LimitClause>,
}

/// Tagged variant for the plan tree: one Rust enum, operations dispatched
/// via exhaustive `match` instead of a pseudo-polymorphic interface.
#[derive(Debug, Clone)]
pub enum PlanNode {
    Route(Box<RouteNode>),
    Join(Box<JoinNode>),
    Union(Box<UnionNode>),
}

impl PlanNode {
    pub fn has_paren(&self) -> bool {
        match self {
            PlanNode::Route(r) => r.has_paren,
            PlanNode::Join(_) | PlanNode::Union(_) => false,
        }
    }

    pub fn non_global_count(&self) -> usize {
        match self {
            PlanNode::Route(r) => r.non_global_count,
            PlanNode::Join(j) => j.left.non_global_count() + j.right.non_global_count(),
            PlanNode::Union(u) => u.left.non_global_count() + u.right.non_global_count(),
        }
    }

    pub fn owns_table(&self, alias: &str) -> bool {
        match self {
            PlanNode::Route(r) => r.tables.iter().any(|t| t == alias),
            PlanNode::Join(j) => j.left.owns_table(alias) || j.right.owns_table(alias),
            PlanNode::Union(u) => u.left.owns_table(alias) || u.right.owns_table(alias),
        }
    }

    pub fn push_filter(&mut self, info: &ExprInfo) -> Result<()> {
        match self {
            PlanNode::Route(r) => r.push_filter(info),
            PlanNode::Join(j) => j.push_filter(info),
            PlanNode::Union(u) => u.push_filter(info),
        }
    }

    pub fn push_select_expr(&mut self, tuple: SelectTuple) -> Result<usize> {
        match self {
            PlanNode::Route(r) => r.push_select_expr(tuple),
            PlanNode::Join(j) => j.push_select_expr(tuple),
            PlanNode::Union(u) => u.push_select_expr(tuple),
        }
    }

    pub fn push_having(&mut self, info: &ExprInfo) -> Result<()> {
        match self {
            PlanNode::Route(r) => r.push_having(info),
            PlanNode::Join(j) => j.push_having(info),
            PlanNode::Union(u) => u.push_having(info),
        }
    }

    pub fn push_order_by(&mut self, terms: Vec<OrderTerm>) {
        match self {
            PlanNode::Route(r) => r.order_by = terms,
            PlanNode::Join(j) => j.order_by = terms,
            PlanNode::Union(u) => u.order_by = terms,
        }
    }

    pub fn push_limit(&mut self, limit: LimitClause) {
        match self {
            PlanNode::Route(r) => r.limit = Some(limit),
            PlanNode::Join(j) => j.limit = Some(limit),
            PlanNode::Union(u) => u.limit = Some(limit),
        }
    }

    /// Bottom-up route fusion; the only operation allowed to reshape the
    /// tree.
    pub fn calc_route(self) -> Self {
        match self {
            PlanNode::Route(r) => PlanNode::Route(r),
            PlanNode::Join(mut j) => {
                j.left = j.left.calc_route();
                j.right = j.right.calc_route();
                crate::merge::try_fuse_join(*j)
            }
            PlanNode::Union(mut u) => {
                u.left = u.left.calc_route();
                u.right = u.right.calc_route();
                PlanNode::Union(u)
            }
        }
    }

    pub fn build_query(
        &mut self,
        router: &dyn ShardRouter,
        schemas: &Arc<Schemas>,
        max_fanout: usize,
    ) -> Result<()> {
        match self {
            PlanNode::Route(r) => r.build_query(router, schemas, max_fanout),
            PlanNode::Join(j) => j.build_query(router, schemas, max_fanout),
            PlanNode::Union(u) => u.build_query(router, schemas, max_fanout),
        }
    }
}
