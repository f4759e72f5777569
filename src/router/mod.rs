//! Router contract: the external collaborator that maps tables to shard
//! metadata. The planner never owns catalog state; it borrows a snapshot
//! through this trait at the start of a plan and never mutates it.

mod memory;

pub use memory::InMemoryRouter;

use crate::error::{PlannerError, Result};
use crate::value::Literal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How a table's rows are distributed across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    /// Sharded by a hash of the shard key.
    Hash,
    /// Sharded by an explicit value-list-to-backend mapping.
    List,
    /// Lives entirely on one backend.
    Single,
    /// Replicated to every backend.
    Global,
}

impl PartitionType {
    pub fn is_sharded(self) -> bool {
        matches!(self, PartitionType::Hash | PartitionType::List)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub address: String,
}

/// One routable slice of a table's data, bound to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub backend: String,
    /// Index of this segment within the table's full segment list, used to
    /// de-duplicate segment lists gathered from multiple `Lookup` calls.
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub database: String,
    pub name: String,
    pub shard_type: PartitionType,
    pub shard_key: Option<String>,
    pub backends: Vec<Backend>,
    pub segments: Vec<Segment>,
}

impl TableDescriptor {
    pub fn is_global(&self) -> bool {
        self.shard_type == PartitionType::Global
    }

    pub fn single_backend(&self) -> Option<&str> {
        match self.shard_type {
            PartitionType::Single => self.backends.first().map(|b| b.name.as_str()),
            PartitionType::Global if self.backends.len() == 1 => {
                self.backends.first().map(|b| b.name.as_str())
            }
            _ => None,
        }
    }
}

/// Read-only `database -> table -> descriptor` snapshot.
#[derive(Debug, Clone, Default)]
pub struct Schemas {
    pub databases: HashMap<String, HashMap<String, TableDescriptor>>,
}

impl Schemas {
    pub fn global_tables(&self, database: &str) -> Vec<&TableDescriptor> {
        self.databases
            .get(database)
            .map(|tables| tables.values().filter(|t| t.is_global()).collect())
            .unwrap_or_default()
    }
}

/// What the planner calls out to; an external, read-only collaborator.
pub trait ShardRouter: Send + Sync {
    fn table_config(&self, db: &str, table: &str) -> Result<TableDescriptor>;

    fn partition_type(&self, db: &str, table: &str) -> Result<PartitionType> {
        Ok(self.table_config(db, table)?.shard_type)
    }

    fn is_partition_hash(&self, pt: PartitionType) -> bool {
        pt == PartitionType::Hash
    }

    /// Full scan when both bounds are absent.
    fn lookup(
        &self,
        db: &str,
        table: &str,
        lo: Option<&Literal>,
        hi: Option<&Literal>,
    ) -> Result<Vec<Segment>>;

    fn get_index(&self, db: &str, table: &str, val: &Literal) -> Result<usize>;

    fn get_segments(&self, db: &str, table: &str, indices: &[usize]) -> Result<Vec<Segment>>;

    fn schemas(&self) -> Arc<Schemas>;

    fn reload(&self) {}

    /// Strips a trailing `_NNNN` physical shard suffix for display purposes.
    /// Never called on the planning hot path.
    fn logical_table_name<'a>(&self, physical: &'a str) -> &'a str {
        strip_shard_suffix(physical)
    }
}

pub fn strip_shard_suffix(physical: &str) -> &str {
    let bytes = physical.as_bytes();
    let mut i = bytes.len();
    while i > 0 && bytes[i - 1].is_ascii_digit() {
        i -= 1;
    }
    if i < bytes.len() && i > 0 && bytes[i - 1] == b'_' && i != physical.len() {
        &physical[..i - 1]
    } else {
        physical
    }
}

pub fn not_found(db: &str, table: &str) -> PlannerError {
    PlannerError::catalog(format!("table not found: {}.{}", db, table))
}
