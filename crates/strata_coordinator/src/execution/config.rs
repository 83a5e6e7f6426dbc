use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{ExecutionResult, ExecutionState, ExecutionStateMachine, QueryExecution};
use crate::context::QueryContext;
use crate::error::{CoordinatorError, Result};
use crate::pool::WorkerPool;
use crate::statement::QueryType;
use crate::status::Status;

/// A metadata statement resolved to a runnable task.
pub trait ConfigTask: Send + Sync {
    fn execute(&self, context: &QueryContext) -> anyhow::Result<Status>;
}

/// Runs one [`ConfigTask`] on the read pool.
pub struct ConfigExecution {
    context: Arc<QueryContext>,
    task: Arc<dyn ConfigTask>,
    executor: Arc<WorkerPool>,
    state: Arc<ExecutionStateMachine>,
}

impl ConfigExecution {
    pub fn new(context: Arc<QueryContext>, task: Arc<dyn ConfigTask>, executor: Arc<WorkerPool>) -> Self {
        let state = Arc::new(ExecutionStateMachine::new(context.query_id()));
        Self {
            context,
            task,
            executor,
            state,
        }
    }
}

impl QueryExecution for ConfigExecution {
    fn context(&self) -> &Arc<QueryContext> {
        &self.context
    }

    fn is_query(&self) -> bool {
        self.context.query_type() != QueryType::Write
    }

    fn start(&self) -> Result<()> {
        self.state.transition_to_running();
        let context = self.context.clone();
        let task = self.task.clone();
        let state = self.state.clone();
        self.executor
            .execute(move || match task.execute(&context) {
                Ok(status) if status.is_success() => {
                    state.transition_to_finished();
                }
                Ok(status) => {
                    state.transition_to_failed(status);
                }
                Err(err) => {
                    warn!(query_id = %context.query_id(), error = %format!("{err:#}"), "config task failed");
                    state.transition_to_failed(CoordinatorError::Internal(err).to_status());
                }
            })
            .map_err(CoordinatorError::Internal)?;
        Ok(())
    }

    fn status(&self) -> ExecutionResult {
        let state = self
            .state
            .wait_for(self.context.deadline(), ExecutionState::is_done);
        if !state.is_done() {
            self.state.transition_to_failed(
                CoordinatorError::Timeout(self.context.query_id()).to_status(),
            );
        }
        ExecutionResult::new(self.context.query_id(), self.state.result_status())
    }

    fn state(&self) -> ExecutionState {
        self.state.state()
    }

    fn stop_and_cleanup(&self, failure: Option<&CoordinatorError>) {
        match failure {
            Some(err) => self.state.transition_to_failed(err.to_status()),
            None => self.state.transition_to_aborted(
                CoordinatorError::Canceled(self.context.query_id()).to_status(),
            ),
        };
    }

    fn record_execution_time(&self, elapsed: Duration) {
        self.state.record_execution_time(elapsed);
    }

    fn total_execution_time(&self) -> i64 {
        self.state.total_execution_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FrontEndMemoryPool, SessionInfo};
    use crate::pool::SaturationPolicy;
    use crate::status::StatusCode;
    use std::time::Instant;
    use strata_plan::{Endpoint, QueryId};

    struct FixedTask(Status);

    impl ConfigTask for FixedTask {
        fn execute(&self, _context: &QueryContext) -> anyhow::Result<Status> {
            Ok(self.0.clone())
        }
    }

    struct BrokenTask;

    impl ConfigTask for BrokenTask {
        fn execute(&self, _context: &QueryContext) -> anyhow::Result<Status> {
            anyhow::bail!("config node unreachable")
        }
    }

    fn context(counter: u64) -> Arc<QueryContext> {
        Arc::new(QueryContext::new(
            "show databases",
            QueryId::new(1, counter),
            SessionInfo::new(1, "root"),
            Endpoint::new("127.0.0.1", 10740),
            Endpoint::new("127.0.0.1", 10730),
            Instant::now(),
            Duration::from_secs(5),
            Arc::new(FrontEndMemoryPool::new(0)),
        ))
    }

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new("test-config", 1, SaturationPolicy::Queue).unwrap())
    }

    #[test]
    fn successful_task_finishes() {
        let execution = ConfigExecution::new(context(1), Arc::new(FixedTask(Status::success())), pool());
        assert!(execution.is_query());
        execution.start().unwrap();
        let result = execution.status();
        assert!(result.status.is_success());
        assert_eq!(execution.state(), ExecutionState::Finished);
    }

    #[test]
    fn task_errors_surface_in_status() {
        let execution = ConfigExecution::new(context(2), Arc::new(BrokenTask), pool());
        execution.start().unwrap();
        assert_eq!(
            execution.status().status.code,
            StatusCode::InternalServerError
        );

        let rejected = ConfigExecution::new(
            context(3),
            Arc::new(FixedTask(Status::error(StatusCode::StatementNotSupported, "no"))),
            pool(),
        );
        rejected.start().unwrap();
        assert_eq!(rejected.status().status.code, StatusCode::StatementNotSupported);
    }

    #[test]
    fn write_typed_config_statement_is_not_a_query() {
        let ctx = context(4);
        ctx.set_query_type(QueryType::Write);
        let execution = ConfigExecution::new(ctx, Arc::new(FixedTask(Status::success())), pool());
        assert!(!execution.is_query());
    }
}
