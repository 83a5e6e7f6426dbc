//! Executions driven by the coordinator.
//!
//! A config execution runs one metadata task on the read pool. A distributed
//! execution plans, places and dispatches fragment instances. Both share
//! [`ExecutionStateMachine`] for their lifecycle.

mod config;
mod distributed;
mod state;

use std::sync::Arc;
use std::time::Duration;

use strata_plan::QueryId;

use crate::context::QueryContext;
use crate::error::{CoordinatorError, Result};
use crate::status::Status;

pub use config::{ConfigExecution, ConfigTask};
pub use distributed::{DistributedPlan, DistributedQueryExecution, Planner};
pub use state::{ExecutionState, ExecutionStateMachine};

/// What `execute` hands back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub query_id: QueryId,
    pub status: Status,
}

impl ExecutionResult {
    pub fn new(query_id: QueryId, status: Status) -> Self {
        Self { query_id, status }
    }
}

/// One in-flight query or write.
pub trait QueryExecution: Send + Sync {
    fn context(&self) -> &Arc<QueryContext>;

    fn query_id(&self) -> QueryId {
        self.context().query_id()
    }

    /// Whether the execution produces a result set and is tracked by the coordinator.
    fn is_query(&self) -> bool;

    fn is_user_query(&self) -> bool {
        self.context().is_user_query()
    }

    fn start(&self) -> Result<()>;

    /// Block until the execution is running or done and report its status.
    fn status(&self) -> ExecutionResult;

    fn state(&self) -> ExecutionState;

    /// Release everything the execution holds. `failure` is the error that
    /// ended it, if any.
    fn stop_and_cleanup(&self, failure: Option<&CoordinatorError>);

    fn record_execution_time(&self, elapsed: Duration);

    /// Recorded execution time in nanoseconds.
    fn total_execution_time(&self) -> i64;

    fn execute_sql(&self) -> Option<&str> {
        let sql = self.context().sql();
        (!sql.is_empty()).then_some(sql)
    }
}
