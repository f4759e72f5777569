//! Deterministic plan emission: stable field order,
//! one-tab indentation, and the left-to-right depth-first query flattening
//! the executor walks to dispatch one statement per backend.

use crate::aggregate::AggregatePlan;
use crate::config::PlannerConfig;
use crate::error::{PlannerError, Result};
use crate::plan::{JoinStrategy, PlanNode, UnionType};
use serde::Serialize;

/// One statement bound for a single backend, in the order the executor
/// must issue them.
#[derive(Debug, Clone, Serialize)]
pub struct QueryTuple {
    pub database: String,
    pub query: String,
    pub backend: Option<String>,
    pub index: Vec<usize>,
}

/// Flattens the tree left-to-right, depth-first, collecting one
/// [`QueryTuple`] per `Route` leaf.
pub fn flatten(node: &PlanNode) -> Vec<QueryTuple> {
    let mut out = Vec::new();
    walk_flatten(node, &mut out);
    out
}

fn walk_flatten(node: &PlanNode, out: &mut Vec<QueryTuple>) {
    match node {
        PlanNode::Route(r) => out.push(QueryTuple {
            database: r.database.clone(),
            query: r.final_sql.clone().unwrap_or_default(),
            backend: r.backend.clone(),
            index: r.index.clone(),
        }),
        PlanNode::Join(j) => {
            walk_flatten(&j.left, out);
            walk_flatten(&j.right, out);
        }
        PlanNode::Union(u) => {
            walk_flatten(&u.left, out);
            walk_flatten(&u.right, out);
        }
    }
}

/// JSON-serialisable shadow of [`PlanNode`]; the AST types backing the real
/// tree are not themselves serialisable, so this projects only what a
/// client of the plan needs to see.
#[derive(Debug, Serialize)]
#[serde(tag = "node")]
pub enum PlanJson {
    Route {
        database: String,
        tables: Vec<String>,
        backend: Option<String>,
        index: Vec<usize>,
        sql: String,
    },
    Join {
        strategy: String,
        is_left_join: bool,
        join_on: Vec<String>,
        left: Box<PlanJson>,
        right: Box<PlanJson>,
    },
    Union {
        union_type: String,
        left: Box<PlanJson>,
        right: Box<PlanJson>,
    },
}

pub fn to_plan_json(node: &PlanNode) -> PlanJson {
    match node {
        PlanNode::Route(r) => PlanJson::Route {
            database: r.database.clone(),
            tables: r.tables.clone(),
            backend: r.backend.clone(),
            index: r.index.clone(),
            sql: r.final_sql.clone().unwrap_or_default(),
        },
        PlanNode::Join(j) => PlanJson::Join {
            strategy: match j.strategy {
                JoinStrategy::Cartesian => "cartesian".to_string(),
                JoinStrategy::SortMerge => "sort_merge".to_string(),
                JoinStrategy::NestLoop => "nest_loop".to_string(),
            },
            is_left_join: j.is_left_join,
            join_on: j
                .join_on
                .iter()
                .map(|p| format!("{} = {}", p.left.qualified(), p.right.qualified()))
                .collect(),
            left: Box::new(to_plan_json(&j.left)),
            right: Box::new(to_plan_json(&j.right)),
        },
        PlanNode::Union(u) => PlanJson::Union {
            union_type: match u.union_type {
                UnionType::Union => "union".to_string(),
                UnionType::UnionAll => "union_all".to_string(),
            },
            left: Box::new(to_plan_json(&u.left)),
            right: Box::new(to_plan_json(&u.right)),
        },
    }
}

/// Renders the plan tree as one-tab-indented JSON with stable field order,
/// suitable for diffing across planner runs.
pub fn emit(node: &PlanNode) -> Result<String> {
    render(&to_plan_json(node))
}

/// Top-level document returned to a caller: the plan tree, plus the
/// recombination recipe's rendered select list when the caller asked for it.
#[derive(Debug, Serialize)]
pub struct PlanDocument {
    #[serde(flatten)]
    pub plan: PlanJson,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_select: Option<String>,
}

/// Same as [`emit`], but honors `config.include_rewritten_select`: when set,
/// the aggregate splitter's rewritten select list (`AVG` expanded to
/// `SUM`/`COUNT`) rides along as a sibling field.
pub fn emit_output(node: &PlanNode, aggregate: Option<&AggregatePlan>, config: &PlannerConfig) -> Result<String> {
    let rewritten_select = if config.include_rewritten_select {
        aggregate.map(|a| a.rewritten.clone())
    } else {
        None
    };
    let document = PlanDocument {
        plan: to_plan_json(node),
        rewritten_select,
    };
    render(&document)
}

fn render(value: &impl Serialize) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| PlannerError::internal(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| PlannerError::internal(e.to_string()))
}
