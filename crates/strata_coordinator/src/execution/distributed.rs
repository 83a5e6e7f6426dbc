use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_plan::{DataNodeLocation, Endpoint, NodeDistribution, PlanFragment, PlanNodeId};
use tracing::{debug, warn};

use super::{ExecutionResult, ExecutionState, ExecutionStateMachine, QueryExecution};
use crate::context::QueryContext;
use crate::dispatch::{FragmentInstance, FragmentInstanceDispatcher, FragmentInstanceId};
use crate::error::{CoordinatorError, Result};
use crate::metrics::CoordinatorMetrics;
use crate::pool::{ScheduledPool, ScheduledTask};

/// Output of planning: the fragments to run and, for the table model, the
/// per-node placement the distribution planner decided.
#[derive(Clone, Debug, Default)]
pub struct DistributedPlan {
    pub fragments: Vec<PlanFragment>,
    pub node_distribution: Option<HashMap<PlanNodeId, NodeDistribution>>,
}

/// Turns one statement into a distributed plan.
pub trait Planner: Send {
    /// Whether the statement produces a result set.
    fn is_query(&self) -> bool;

    fn analyze(&mut self, context: &QueryContext) -> Result<()>;

    fn plan(&mut self, context: &QueryContext) -> Result<DistributedPlan>;
}

/// Plans a statement and runs its fragments on the owning data nodes.
pub struct DistributedQueryExecution {
    context: Arc<QueryContext>,
    planner: Mutex<Box<dyn Planner>>,
    is_query: bool,
    dispatcher: Arc<FragmentInstanceDispatcher>,
    scheduled: Arc<ScheduledPool>,
    local: DataNodeLocation,
    metrics: Arc<CoordinatorMetrics>,
    state: Arc<ExecutionStateMachine>,
    instances: Mutex<Vec<(FragmentInstanceId, Endpoint)>>,
    timeout_task: Mutex<Option<ScheduledTask>>,
}

impl DistributedQueryExecution {
    pub fn new(
        context: Arc<QueryContext>,
        planner: Box<dyn Planner>,
        dispatcher: Arc<FragmentInstanceDispatcher>,
        scheduled: Arc<ScheduledPool>,
        local: DataNodeLocation,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let is_query = planner.is_query();
        let state = Arc::new(ExecutionStateMachine::new(context.query_id()));
        Self {
            context,
            planner: Mutex::new(planner),
            is_query,
            dispatcher,
            scheduled,
            local,
            metrics,
            state,
            instances: Mutex::new(Vec::new()),
            timeout_task: Mutex::new(None),
        }
    }

    fn plan(&self) -> Result<DistributedPlan> {
        let mut planner = self.planner.lock();
        planner.analyze(&self.context)?;
        planner.plan(&self.context)
    }

    fn schedule_timeout(&self) {
        let Some(deadline) = self.context.deadline() else {
            return;
        };
        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let query_id = self.context.query_id();
        let delay = deadline.saturating_duration_since(Instant::now());
        let task = self.scheduled.schedule(delay, move || {
            if state.transition_to_failed(CoordinatorError::Timeout(query_id).to_status()) {
                metrics.record_timeout();
                warn!(query_id = %query_id, "query exceeded its deadline");
            }
        });
        *self.timeout_task.lock() = Some(task);
    }

    fn fail(&self, err: &CoordinatorError) {
        self.state.transition_to_failed(err.to_status());
    }
}

impl QueryExecution for DistributedQueryExecution {
    fn context(&self) -> &Arc<QueryContext> {
        &self.context
    }

    fn is_query(&self) -> bool {
        self.is_query
    }

    fn start(&self) -> Result<()> {
        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        self.state.transition_to_planned();
        let distribution = plan.node_distribution.as_ref();
        let instances: Vec<FragmentInstance> = plan
            .fragments
            .into_iter()
            .zip(0..)
            .map(|(fragment, index)| {
                FragmentInstance::place(fragment, index, distribution, &self.local)
            })
            .collect();
        *self.instances.lock() = instances
            .iter()
            .filter_map(|instance| {
                let endpoint = instance.target().host_endpoint()?.clone();
                Some((instance.id(), endpoint))
            })
            .collect();
        debug!(query_id = %self.context.query_id(), instances = instances.len(), "plan placed");

        if self.is_query {
            self.schedule_timeout();
        }
        self.state.transition_to_dispatching();
        let status = self.dispatcher.dispatch(
            self.context.query_id(),
            &instances,
            self.context.timeout(),
            self.context.start_time(),
            self.is_query,
        );
        if !status.is_success() {
            self.state.transition_to_failed(status);
        } else if self.is_query {
            self.state.transition_to_running();
        } else {
            self.state.transition_to_finished();
        }
        Ok(())
    }

    fn status(&self) -> ExecutionResult {
        let deadline = self.context.deadline();
        let state = self.state.wait_for(deadline, |state| {
            state == ExecutionState::Running || state.is_done()
        });
        if state != ExecutionState::Running && !state.is_done() {
            self.state
                .transition_to_failed(CoordinatorError::Timeout(self.context.query_id()).to_status());
        }
        ExecutionResult::new(self.context.query_id(), self.state.result_status())
    }

    fn state(&self) -> ExecutionState {
        self.state.state()
    }

    fn stop_and_cleanup(&self, failure: Option<&CoordinatorError>) {
        if let Some(task) = self.timeout_task.lock().take() {
            task.cancel();
        }
        match failure {
            Some(err) => {
                self.fail(err);
            }
            None => {
                self.state.transition_to_finished();
            }
        }
        if self.state.state() == ExecutionState::Finished {
            return;
        }
        let instances = std::mem::take(&mut *self.instances.lock());
        if !instances.is_empty() {
            let reason = self.state.result_status().to_string();
            drop(self.dispatcher.cancel(instances, reason));
        }
    }

    fn record_execution_time(&self, elapsed: Duration) {
        self.state.record_execution_time(elapsed);
    }

    fn total_execution_time(&self) -> i64 {
        self.state.total_execution_time()
    }
}
