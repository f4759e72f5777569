//! End-to-end scenarios driving the full `Planner::plan_select` pipeline
//! against an in-memory router: scan → pushdown → aggregate split → fusion →
//! emission.

use pretty_assertions::assert_eq;
use shard_query_planner::emit;
use shard_query_planner::error::PlannerError;
use shard_query_planner::plan::{PlanNode, UnionType};
use shard_query_planner::router::{Backend, InMemoryRouter, PartitionType, Schemas, Segment, TableDescriptor};
use shard_query_planner::{Planner, PlannerConfig};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::sync::Arc;

fn parse_select(sql: &str) -> sqlparser::ast::Select {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
    match statements.remove(0) {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => *select,
            other => panic!("expected a plain SELECT, got {:?}", other),
        },
        other => panic!("expected a query statement, got {:?}", other),
    }
}

fn parse_query(sql: &str) -> sqlparser::ast::Query {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
    match statements.remove(0) {
        Statement::Query(query) => *query,
        other => panic!("expected a query statement, got {:?}", other),
    }
}

fn single_table(name: &str, backend: &str) -> TableDescriptor {
    TableDescriptor {
        database: "d".to_string(),
        name: name.to_string(),
        shard_type: PartitionType::Single,
        shard_key: None,
        backends: vec![Backend {
            name: backend.to_string(),
            address: format!("{}:3306", backend),
        }],
        segments: vec![Segment {
            backend: backend.to_string(),
            index: 0,
        }],
    }
}

fn global_table(name: &str, backend: &str) -> TableDescriptor {
    TableDescriptor {
        shard_type: PartitionType::Global,
        ..single_table(name, backend)
    }
}

/// A `List`-partitioned table whose segments bind to the given literal
/// values, one segment per value, each pinned to its own backend encoded as
/// `"<backend>|<value>"` (see `InMemoryRouter`'s list-bound convention).
fn list_table(name: &str, shard_key: &str, values: &[&str]) -> TableDescriptor {
    let segments: Vec<Segment> = values
        .iter()
        .enumerate()
        .map(|(i, v)| Segment {
            backend: format!("b{}|{}", i, v),
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
        database: "d".to_string(),
        name: name.to_string(),
        shard_type: PartitionType::List,
        shard_key: Some(shard_key.to_string()),
        backends,
        segments,
    }
}

fn planner_for(tables: Vec<TableDescriptor>) -> Planner {
    let mut by_name = HashMap::new();
    for t in tables {
        by_name.insert(t.name.clone(), t);
    }
    let mut databases = HashMap::new();
    databases.insert("d".to_string(), by_name);
    let router = InMemoryRouter::new(Schemas { databases });
    Planner::new(Arc::new(router), PlannerConfig::default())
}

fn as_route(node: &PlanNode) -> &shard_query_planner::plan::RouteNode {
    match node {
        PlanNode::Route(r) => r,
        other => panic!("expected a fused Route, got {:?}", other),
    }
}

#[test]
fn scenario_1_select_list_with_eleven_items_splits_every_avg_and_keeps_group_by() {
    let planner = planner_for(vec![single_table("A", "b0")]);
    let select = parse_select(
        "SELECT 1, a, min(b), max(a), avg(a), sum(a), count(a), b AS b1, avg(b), c, avg(c) \
         FROM A GROUP BY a, b1, c",
    );
    let output = planner.plan_select("d", &select, &[], None).unwrap();
    let agg = output.aggregate.unwrap();

    // min, max, avg, sum, count, avg, avg: one NormalAggregator per
    // aggregate call, AVG carrying its paired COUNT column via `count_index`
    // rather than as a second top-level entry.
    assert_eq!(agg.normal.len(), 7);
    assert_eq!(agg.group.len(), 3);
    assert_eq!(agg.normal.iter().filter(|a| a.count_index.is_some()).count(), 3);
    assert!(agg.rewritten.contains("sum(a) as `avg(a)`"));
    assert!(!agg.rewritten.to_lowercase().contains("avg("));
}

#[test]
fn scenario_2_having_attaches_and_count_star_survives_as_one_aggregator() {
    let planner = planner_for(vec![single_table("A", "b0")]);
    let select = parse_select("SELECT age, count(*) FROM A GROUP BY age HAVING a >= 2");
    let output = planner.plan_select("d", &select, &[], None).unwrap();
    let agg = output.aggregate.unwrap();

    assert_eq!(agg.normal.len(), 1);
    assert_eq!(agg.normal[0].func, "count");
    assert_eq!(agg.group.len(), 1);
    assert_eq!(agg.group[0].field, "age");

    let route = as_route(&output.tree);
    assert_eq!(route.having_exprs.len(), 1);
    assert!(route.final_sql.as_ref().unwrap().contains("HAVING a >= 2"));
}

#[test]
fn scenario_3_matching_shard_keys_fuse_and_propagate_the_literal_to_both_sides() {
    // Same shard-key name on both tables: the merge decider only fuses on an
    // equi-join whose key is the shard key on both sides.
    let planner = planner_for(vec![
        list_table("A", "id", &["1"]),
        list_table("B", "id", &["1"]),
    ]);
    let select =
        parse_select("SELECT A.id, B.id FROM A JOIN B ON A.id = B.id AND A.id = 1 AND 1 = 1");
    let output = planner.plan_select("d", &select, &[], None).unwrap();

    let route = as_route(&output.tree);
    assert_eq!(route.tables, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(route.index, vec![0]);
    assert_eq!(route.no_table_filter.len(), 1);

    let sql = route.final_sql.as_ref().unwrap();
    assert!(sql.contains("A.id = 1"));
    assert!(sql.contains("B.id = 1"));
}

#[test]
fn scenario_4_left_join_cross_side_arithmetic_rejected_at_build_query() {
    let planner = planner_for(vec![single_table("A", "b0"), single_table("B", "b1")]);
    let select = parse_select(
        "SELECT A.id, B.id FROM A LEFT JOIN B ON A.id = B.id AND A.id = 1 AND 1 = 1 \
         AND B.a = 1 AND A.b + B.b > 0",
    );
    let err = planner.plan_select("d", &select, &[], None).unwrap_err();
    assert_eq!(
        err,
        PlannerError::unsupported("clause.'A.b + B.b > 0'.in.cross-shard.join")
    );
}

#[test]
fn scenario_5_global_table_fuses_with_a_sharded_partner() {
    let planner = planner_for(vec![global_table("G", "bg"), list_table("A", "id", &["1"])]);
    let select = parse_select("SELECT G.id, A.id FROM G JOIN A ON A.id = 1");
    let output = planner.plan_select("d", &select, &[], None).unwrap();

    let route = as_route(&output.tree);
    assert_eq!(route.tables, vec!["G".to_string(), "A".to_string()]);
    assert_eq!(route.index, vec![0]);
    assert!(route.final_sql.as_ref().unwrap().contains("A.id = 1"));
}

#[test]
fn scenario_6_in_list_over_the_shard_key_unions_deduplicated_segments() {
    let planner = planner_for(vec![list_table("A", "id", &["1", "2", "3"])]);
    let select = parse_select("SELECT id FROM A WHERE id IN (1, 2, 3)");
    let output = planner.plan_select("d", &select, &[], None).unwrap();

    let route = as_route(&output.tree);
    assert_eq!(route.index, vec![0, 1, 2]);
    assert!(route.final_sql.as_ref().unwrap().contains("IN (1, 2, 3)"));
}

#[test]
fn scenario_7_union_routes_each_branch_to_its_own_backend() {
    let planner = planner_for(vec![single_table("A", "b0"), single_table("B", "b1")]);
    let query = parse_query("SELECT id FROM A UNION SELECT id FROM B");
    let output = planner.plan_query("d", &query, &[], None).unwrap();

    match &output.tree {
        PlanNode::Union(u) => {
            assert!(matches!(&u.left, PlanNode::Route(_)));
            assert!(matches!(&u.right, PlanNode::Route(_)));
            assert_eq!(u.union_type, UnionType::Union);
        }
        other => panic!("expected a Union node, got {:?}", other),
    }

    let tuples = emit::flatten(&output.tree);
    assert_eq!(tuples.len(), 2);
    assert_eq!(tuples[0].backend.as_deref(), Some("b0"));
    assert_eq!(tuples[1].backend.as_deref(), Some("b1"));
}

#[test]
fn scenario_8_union_all_is_distinguished_from_union() {
    let planner = planner_for(vec![single_table("A", "b0"), single_table("B", "b0")]);
    let query = parse_query("SELECT id FROM A UNION ALL SELECT id FROM B");
    let output = planner.plan_query("d", &query, &[], None).unwrap();

    match &output.tree {
        PlanNode::Union(u) => assert_eq!(u.union_type, UnionType::UnionAll),
        other => panic!("expected a Union node, got {:?}", other),
    }
}

#[test]
fn union_branches_must_agree_on_column_count() {
    let planner = planner_for(vec![single_table("A", "b0"), single_table("B", "b1")]);
    let query = parse_query("SELECT id, a FROM A UNION SELECT id FROM B");
    let err = planner.plan_query("d", &query, &[], None).unwrap_err();
    assert_eq!(
        err,
        PlannerError::malformed("union.branches.column.count.mismatch")
    );
}
