//! Identifiers for queries, plan fragments and plan nodes.
//!
//! Query ids are scoped by the issuing data node and a monotonically
//! increasing counter, so two coordinators never hand out the same id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Logical identifier of a data node in the cluster.
pub type DataNodeId = i32;

/// Unique query identifier scoped by node and a monotonically increasing counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId {
    pub data_node_id: DataNodeId,
    pub counter: u64,
}

impl QueryId {
    pub const fn new(data_node_id: DataNodeId, counter: u64) -> Self {
        Self {
            data_node_id,
            counter,
        }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}_{}", self.counter, self.data_node_id)
    }
}

/// Allocates strictly increasing [`QueryId`] values for one data node.
///
/// Allocation is a single atomic increment; it never blocks and never fails.
#[derive(Debug)]
pub struct QueryIdGenerator {
    data_node_id: DataNodeId,
    next: AtomicU64,
}

impl QueryIdGenerator {
    pub fn new(data_node_id: DataNodeId) -> Self {
        Self {
            data_node_id,
            next: AtomicU64::new(1),
        }
    }

    pub fn data_node_id(&self) -> DataNodeId {
        self.data_node_id
    }

    /// Issue the next id.
    pub fn create_next_query_id(&self) -> QueryId {
        let counter = self.next.fetch_add(1, Ordering::Relaxed);
        QueryId::new(self.data_node_id, counter)
    }
}

/// Identifier of one fragment within a distributed plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanFragmentId {
    pub query_id: QueryId,
    pub fragment_id: i32,
}

impl PlanFragmentId {
    pub const fn new(query_id: QueryId, fragment_id: i32) -> Self {
        Self {
            query_id,
            fragment_id,
        }
    }
}

impl fmt::Display for PlanFragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query_id, self.fragment_id)
    }
}

/// Identifier of a plan node, unique within one logical plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanNodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PlanNodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
