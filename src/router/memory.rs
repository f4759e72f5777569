//! In-memory reference router, good enough to drive the planner's test suite
//! and to serve as a template for a networked implementation.

use super::{not_found, Backend, PartitionType, Schemas, Segment, ShardRouter, TableDescriptor};
use crate::error::{PlannerError, Result};
use crate::value::Literal;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Default)]
pub struct InMemoryRouter {
    schemas: RwLock<Arc<Schemas>>,
}

impl InMemoryRouter {
    pub fn new(schemas: Schemas) -> Self {
        Self {
            schemas: RwLock::new(Arc::new(schemas)),
        }
    }

    pub fn set_schemas(&self, schemas: Schemas) {
        *self.schemas.write() = Arc::new(schemas);
    }

    fn descriptor(&self, db: &str, table: &str) -> Result<TableDescriptor> {
        self.schemas
            .read()
            .databases
            .get(db)
            .and_then(|tables| tables.get(table))
            .cloned()
            .ok_or_else(|| not_found(db, table))
    }

    fn hash_bucket(val: &Literal, num_backends: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        match val {
            Literal::Integer(i) => i.hash(&mut hasher),
            Literal::String(s) => s.hash(&mut hasher),
            Literal::Boolean(b) => b.hash(&mut hasher),
            Literal::Float(f) => f.to_bits().hash(&mut hasher),
            Literal::Null => 0u8.hash(&mut hasher),
        }
        (hasher.finish() as usize) % num_backends.max(1)
    }
}

impl ShardRouter for InMemoryRouter {
    fn table_config(&self, db: &str, table: &str) -> Result<TableDescriptor> {
        self.descriptor(db, table)
    }

    fn lookup(
        &self,
        db: &str,
        table: &str,
        lo: Option<&Literal>,
        hi: Option<&Literal>,
    ) -> Result<Vec<Segment>> {
        let desc = self.descriptor(db, table)?;
        match (lo, hi) {
            (None, None) => Ok(desc.segments.clone()),
            (Some(v), None) | (None, Some(v)) => {
                let idx = self.get_index(db, table, v)?;
                self.get_segments(db, table, &[idx])
            }
            (Some(lo), Some(hi)) => match desc.shard_type {
                PartitionType::Hash => Ok(desc.segments.clone()),
                _ => {
                    let lo_idx = self.get_index(db, table, lo)?;
                    let hi_idx = self.get_index(db, table, hi)?;
                    let (a, b) = if lo_idx <= hi_idx {
                        (lo_idx, hi_idx)
                    } else {
                        (hi_idx, lo_idx)
                    };
                    let indices: Vec<usize> = (a..=b).collect();
                    self.get_segments(db, table, &indices)
                }
            },
        }
    }

    fn get_index(&self, db: &str, table: &str, val: &Literal) -> Result<usize> {
        let desc = self.descriptor(db, table)?;
        if desc.segments.is_empty() {
            return Err(PlannerError::catalog(format!(
                "table {}.{} has no segments",
                db, table
            )));
        }
        match desc.shard_type {
            PartitionType::Hash => Ok(Self::hash_bucket(val, desc.segments.len())),
            PartitionType::List => desc
                .segments
                .iter()
                .position(|seg| list_bound_matches(seg, val))
                .ok_or_else(|| {
                    PlannerError::catalog(format!(
                        "value {} matches no list partition of {}.{}",
                        val, db, table
                    ))
                }),
            PartitionType::Single | PartitionType::Global => Ok(0),
        }
    }

    fn get_segments(&self, db: &str, table: &str, indices: &[usize]) -> Result<Vec<Segment>> {
        let desc = self.descriptor(db, table)?;
        let mut out = Vec::with_capacity(indices.len());
        let mut seen = std::collections::HashSet::new();
        for &i in indices {
            if !seen.insert(i) {
                continue;
            }
            let seg = desc
                .segments
                .get(i)
                .cloned()
                .ok_or_else(|| PlannerError::catalog(format!("segment index {} out of range", i)))?;
            out.push(seg);
        }
        out.sort_by(|a, b| a.index.cmp(&b.index));
        Ok(out)
    }

    fn schemas(&self) -> Arc<Schemas> {
        self.schemas.read().clone()
    }
}

/// List partitions carry their bound values out-of-band in tests via the
/// `Backend::name` field formatted as `value1,value2`; a real router would
/// consult its own list-partition metadata instead.
fn list_bound_matches(seg: &Segment, val: &Literal) -> bool {
    let needle = val.to_string();
    seg.backend
        .splitn(2, '|')
        .nth(1)
        .map(|bounds| bounds.split(',').any(|b| b == needle))
        .unwrap_or(false)
}

pub fn backend(name: &str) -> Backend {
    Backend {
        name: name.to_string(),
        address: format!("{}:3306", name),
    }
}
