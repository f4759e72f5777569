//! Planner configuration: the handful of knobs that change its behaviour
//! without changing its semantics.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Database name used when a query carries no explicit schema qualifier.
    pub default_database: String,
    /// Caps the number of segments a single shard-key lookup may fan out to
    /// before the planner refuses the query outright.
    pub max_route_fanout: usize,
    /// Emits the rewritten (AVG-split) SELECT list alongside the plan JSON.
    pub include_rewritten_select: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            default_database: String::new(),
            max_route_fanout: 4096,
            include_rewritten_select: true,
        }
    }
}
