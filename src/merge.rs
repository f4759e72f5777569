//! Merge/route decider: when two sibling `Route`s may
//! collapse into one, this is the only operation allowed to reshape the
//! plan tree besides the scanner itself.

use crate::plan::{EquiPair, JoinNode, JoinStrategy, PlanNode, RouteNode};

pub fn try_fuse_join(join: JoinNode) -> PlanNode {
    if join.strategy == JoinStrategy::NestLoop {
        return PlanNode::Join(Box::new(join));
    }
    if let (PlanNode::Route(_), PlanNode::Route(_)) = (&join.left, &join.right) {
        if let (PlanNode::Route(l), PlanNode::Route(r)) = (join.left.clone(), join.right.clone()) {
            if mergeable(&l, &r, &join) {
                return PlanNode::Route(Box::new(fuse(*l, *r, &join)));
            }
        }
    }
    PlanNode::Join(Box::new(join))
}

fn mergeable(l: &RouteNode, r: &RouteNode, join: &JoinNode) -> bool {
    if let (Some(lb), Some(rb)) = (l.static_backend(), r.static_backend()) {
        if lb == rb {
            return true;
        }
    }
    if l.non_global_count == 0 || r.non_global_count == 0 {
        return true;
    }
    join.join_on.iter().any(|pair| is_same_shard(l, r, pair))
}

fn is_same_shard(l: &RouteNode, r: &RouteNode, pair: &EquiPair) -> bool {
    let (Some((ld, lk)), Some((rd, rk))) = (l.shard_key_table(), r.shard_key_table()) else {
        return false;
    };
    ld.shard_type == rd.shard_type
        && ld.shard_type.is_sharded()
        && lk == rk
        && pair.left.name == lk
        && pair.right.name == rk
        && ld.segments.len() == rd.segments.len()
}

fn fuse(mut l: RouteNode, r: RouteNode, join: &JoinNode) -> RouteNode {
    l.tables.extend(r.tables);
    l.descriptors.extend(r.descriptors);
    let join_kw = if join.is_left_join { "LEFT JOIN" } else { "JOIN" };
    l.from_sql = format!("{} {} {}", l.from_sql, join_kw, r.from_sql);

    for pair in &join.join_on {
        l.where_exprs.push(sqlparser::ast::Expr::BinaryOp {
            left: Box::new(sqlparser::ast::Expr::CompoundIdentifier(vec![
                sqlparser::ast::Ident::new(pair.left.table.clone().unwrap_or_default()),
                sqlparser::ast::Ident::new(pair.left.name.clone()),
            ])),
            op: sqlparser::ast::BinaryOperator::Eq,
            right: Box::new(sqlparser::ast::Expr::CompoundIdentifier(vec![
                sqlparser::ast::Ident::new(pair.right.table.clone().unwrap_or_default()),
                sqlparser::ast::Ident::new(pair.right.name.clone()),
            ])),
        });
    }
    l.where_exprs.extend(join.other_filter.clone());
    l.where_exprs.extend(r.where_exprs);
    l.having_exprs.extend(r.having_exprs);
    l.projections.extend(r.projections);
    l.group_by.extend(r.group_by);
    l.no_table_filter.extend(join.no_table_filter.clone());
    l.no_table_filter.extend(r.no_table_filter);
    l.has_paren = l.has_paren || r.has_paren;
    l.non_global_count = l.non_global_count + r.non_global_count;
    if l.backend.is_none() {
        l.backend = r.backend;
    }
    if l.index.is_empty() {
        l.index = r.index;
    }
    l
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ColumnRef;
    use crate::plan::{JoinNode, JoinStrategy, RouteNode};
    use crate::router::{Backend, PartitionType, Segment, TableDescriptor};

    fn single_route(alias: &str, backend: &str) -> RouteNode {
        let desc = TableDescriptor {
            database: "d".into(),
            name: alias.into(),
            shard_type: PartitionType::Single,
            shard_key: None,
            backends: vec![Backend {
                name: backend.into(),
                address: format!("{}:3306", backend),
            }],
            segments: vec![Segment {
                backend: backend.into(),
                index: 0,
            }],
        };
        RouteNode::single_table("d".into(), alias.into(), desc, format!("`{}`", alias))
    }

    fn sharded_route(alias: &str, shard_key: &str, num_segments: usize) -> RouteNode {
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
        let desc = TableDescriptor {
            database: "d".into(),
            name: alias.into(),
            shard_type: PartitionType::Hash,
            shard_key: Some(shard_key.into()),
            backends,
            segments,
        };
        RouteNode::single_table("d".into(), alias.into(), desc, format!("`{}`", alias))
    }

    fn join_of(left: RouteNode, right: RouteNode, join_on: Vec<EquiPair>) -> JoinNode {
        JoinNode::new(
            PlanNode::Route(Box::new(left)),
            PlanNode::Route(Box::new(right)),
            false,
            join_on,
            None,
        )
    }

    #[test]
    fn fuses_two_routes_already_pinned_to_the_same_backend() {
        let join = join_of(single_route("a", "b0"), single_route("b", "b0"), Vec::new());
        match try_fuse_join(join) {
            PlanNode::Route(r) => assert_eq!(r.tables, vec!["a".to_string(), "b".to_string()]),
            PlanNode::Join(_) => panic!("expected fusion into a single route"),
            PlanNode::Union(_) => unreachable!("try_fuse_join never returns Union"),
        }
    }

    #[test]
    fn fuses_when_one_side_is_fully_global() {
        let desc_global = TableDescriptor {
            database: "d".into(),
            name: "g".into(),
            shard_type: PartitionType::Global,
            shard_key: None,
            backends: vec![Backend { name: "b0".into(), address: "b0:3306".into() }],
            segments: vec![Segment { backend: "b0".into(), index: 0 }],
        };
        let global = RouteNode::single_table("d".into(), "g".into(), desc_global, "`g`".into());
        let join = join_of(global, sharded_route("a", "id", 4), Vec::new());
        match try_fuse_join(join) {
            PlanNode::Route(r) => assert_eq!(r.tables, vec!["g".to_string(), "a".to_string()]),
            PlanNode::Join(_) => panic!("expected a GLOBAL-side fusion"),
            PlanNode::Union(_) => unreachable!("try_fuse_join never returns Union"),
        }
    }

    #[test]
    fn fuses_on_matching_shard_key_equi_join() {
        let pair = EquiPair {
            left: ColumnRef { table: Some("a".into()), name: "id".into() },
            right: ColumnRef { table: Some("b".into()), name: "id".into() },
        };
        let join = join_of(
            sharded_route("a", "id", 4),
            sharded_route("b", "id", 4),
            vec![pair],
        );
        match try_fuse_join(join) {
            PlanNode::Route(r) => assert_eq!(r.tables, vec!["a".to_string(), "b".to_string()]),
            PlanNode::Join(_) => panic!("expected shard-key equi-join fusion"),
            PlanNode::Union(_) => unreachable!("try_fuse_join never returns Union"),
        }
    }

    #[test]
    fn does_not_fuse_distinct_shard_keys() {
        let pair = EquiPair {
            left: ColumnRef { table: Some("a".into()), name: "id".into() },
            right: ColumnRef { table: Some("b".into()), name: "other_id".into() },
        };
        let join = join_of(
            sharded_route("a", "id", 4),
            sharded_route("b", "other_id", 4),
            vec![pair],
        );
        match try_fuse_join(join) {
            PlanNode::Join(_) => {}
            PlanNode::Route(_) => panic!("unrelated shard keys must not fuse"),
            PlanNode::Union(_) => unreachable!("try_fuse_join never returns Union"),
        }
    }

    #[test]
    fn never_fuses_a_nest_loop_join() {
        let mut join = join_of(sharded_route("a", "id", 4), sharded_route("b", "id", 4), Vec::new());
        join.set_nest_loop();
        match try_fuse_join(join) {
            PlanNode::Join(j) => assert_eq!(j.strategy, JoinStrategy::NestLoop),
            PlanNode::Route(_) => panic!("NestLoop joins must never fuse"),
            PlanNode::Union(_) => unreachable!("try_fuse_join never returns Union"),
        }
    }
}
