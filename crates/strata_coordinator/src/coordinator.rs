//! The node-local query coordinator.
//!
//! Every query or write issued on this node passes through [`Coordinator`]:
//! it gets a [`QueryId`] and a [`QueryContext`], an execution built by a
//! planner, and a slot in the live execution map until the caller cleans it
//! up. Cleanup feeds the slow query and sampled query logs.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use strata_plan::{DataNodeLocation, QueryId, QueryIdGenerator};
use tracing::{debug, info_span, warn};

use crate::client::{
    AsyncClientManager, AsyncInternalClient, ClientFactory, ClientManager, SyncInternalClient,
};
use crate::config::CoordinatorConfig;
use crate::context::{FrontEndMemoryPool, QueryContext, QueryTimeout, SessionInfo, SqlDialect};
use crate::dispatch::FragmentInstanceDispatcher;
use crate::error::{CoordinatorError, Result};
use crate::execution::{
    ConfigExecution, ConfigTask, DistributedQueryExecution, ExecutionResult, Planner,
    QueryExecution,
};
use crate::metrics::CoordinatorMetrics;
use crate::pool::CoordinatorPools;
use crate::schema_lock::SchemaLockManager;
use crate::statement::{StatementRef, StatementRouting, TableStatement, TreeStatement};
use crate::telemetry::{
    content_of_request, SampledQueryRecord, SamplingRateLimiter, SlowQueryRecord, TelemetrySink,
    TokenBucket, TracingTelemetrySink,
};

static GLOBAL: OnceLock<Arc<Coordinator>> = OnceLock::new();

/// Statement analysis and planning, provided by the SQL front ends.
pub trait PlanningBackend: Send + Sync {
    /// Resolve a config-routed statement to its task.
    fn config_task(
        &self,
        dialect: SqlDialect,
        statement: StatementRef<'_>,
        context: &Arc<QueryContext>,
    ) -> Result<Arc<dyn ConfigTask>>;

    /// Build a planner for a data-plane statement.
    fn planner(
        &self,
        dialect: SqlDialect,
        statement: StatementRef<'_>,
        context: &Arc<QueryContext>,
    ) -> Result<Box<dyn Planner>>;
}

/// Client pools for the internal service of other data nodes.
#[derive(Clone)]
pub struct InternalClients {
    pub sync_clients: Arc<ClientManager<SyncInternalClient>>,
    pub async_clients: Arc<AsyncClientManager<AsyncInternalClient>>,
}

impl InternalClients {
    pub fn new(
        sync_factory: Arc<dyn ClientFactory<SyncInternalClient>>,
        async_factory: Arc<dyn ClientFactory<AsyncInternalClient>>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            sync_clients: Arc::new(ClientManager::new(
                sync_factory,
                config.client_pool_max_per_endpoint,
                config.client_pool_wait_timeout(),
            )),
            async_clients: Arc::new(AsyncClientManager::new(
                async_factory,
                config.client_pool_max_per_endpoint,
                config.client_pool_wait_timeout(),
            )),
        }
    }
}

/// Releases context resources when `execute` returns, on every path.
struct ContextReleaseGuard<'a> {
    context: &'a QueryContext,
    schema_locks: &'a SchemaLockManager,
}

impl Drop for ContextReleaseGuard<'_> {
    fn drop(&mut self) {
        self.context.release_all_memory_reserved_for_front_end();
        self.schema_locks.release_read_lock(Some(self.context));
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    local_location: DataNodeLocation,
    id_generator: QueryIdGenerator,
    executions: DashMap<QueryId, Arc<dyn QueryExecution>>,
    backend: Arc<dyn PlanningBackend>,
    pools: CoordinatorPools,
    dispatcher: Arc<FragmentInstanceDispatcher>,
    clients: InternalClients,
    schema_locks: Arc<SchemaLockManager>,
    memory_pool: Arc<FrontEndMemoryPool>,
    telemetry: Arc<dyn TelemetrySink>,
    sampling_limiter: Option<Arc<dyn SamplingRateLimiter>>,
    metrics: Arc<CoordinatorMetrics>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        backend: Arc<dyn PlanningBackend>,
        clients: InternalClients,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let pools = CoordinatorPools::from_config(&config)?;
        let metrics = Arc::new(CoordinatorMetrics::default());
        let dispatcher = Arc::new(FragmentInstanceDispatcher::new(
            clients.sync_clients.clone(),
            clients.async_clients.clone(),
            pools.clone(),
            metrics.clone(),
        ));
        let sampling_limiter = config
            .query_sampling_bytes_per_sec
            .map(|rate| Arc::new(TokenBucket::new(rate)) as Arc<dyn SamplingRateLimiter>);
        debug!(
            data_node_id = config.data_node_id,
            read_pool = config.coordinator_read_executor_size,
            write_pool = config.coordinator_write_executor_size,
            dispatch_pool = config.dispatch_executor_size(),
            "coordinator initialized"
        );
        Ok(Self {
            local_location: config.local_location(),
            id_generator: QueryIdGenerator::new(config.data_node_id),
            executions: DashMap::new(),
            backend,
            pools,
            dispatcher,
            clients,
            schema_locks: Arc::new(SchemaLockManager::new()),
            memory_pool: Arc::new(FrontEndMemoryPool::new(config.front_end_memory_bytes)),
            telemetry: Arc::new(TracingTelemetrySink),
            sampling_limiter,
            metrics,
            config,
        })
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Replace the sampling limiter; `None` samples every eligible query.
    pub fn with_sampling_limiter(mut self, limiter: Option<Arc<dyn SamplingRateLimiter>>) -> Self {
        self.sampling_limiter = limiter;
        self
    }

    pub fn with_schema_locks(mut self, schema_locks: Arc<SchemaLockManager>) -> Self {
        self.schema_locks = schema_locks;
        self
    }

    /// Make `coordinator` the process-wide instance. Only the first call succeeds.
    pub fn install(coordinator: Coordinator) -> anyhow::Result<Arc<Coordinator>> {
        let coordinator = Arc::new(coordinator);
        GLOBAL
            .set(coordinator.clone())
            .map_err(|_| anyhow::anyhow!("coordinator is already installed"))?;
        Ok(coordinator)
    }

    pub fn global() -> Option<&'static Arc<Coordinator>> {
        GLOBAL.get()
    }

    pub fn create_query_id(&self) -> QueryId {
        self.id_generator.create_next_query_id()
    }

    /// Run one operation with an execution built by `factory`.
    ///
    /// A factory error is returned as is. A start failure is reported through
    /// the result's status. Front-end memory and the schema read lock held by
    /// the context are released on return.
    pub fn execute<F>(
        &self,
        session: SessionInfo,
        sql: &str,
        user_query: bool,
        factory: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce(Arc<QueryContext>, Instant) -> Result<Arc<dyn QueryExecution>>,
    {
        let start_time = Instant::now();
        let query_id = self.create_query_id();
        let span = info_span!("query", query_id = %query_id);
        let _entered = span.enter();
        if !sql.is_empty() {
            debug!(sql, "[QueryStart]");
        }
        let context = Arc::new(QueryContext::new(
            sql,
            query_id,
            session,
            self.config.data_block_endpoint(),
            self.config.internal_endpoint(),
            start_time,
            self.config.query_timeout_threshold(),
            self.memory_pool.clone(),
        ));
        context.set_user_query(user_query);
        let _release = ContextReleaseGuard {
            context: &context,
            schema_locks: &self.schema_locks,
        };
        self.metrics.record_execution();

        let execution = factory(context.clone(), start_time).inspect_err(|err| {
            self.metrics.record_planning_failure();
            warn!(error = %err, "failed to create execution");
        })?;
        if execution.is_query() {
            self.executions.insert(query_id, execution.clone());
            self.metrics.record_registration();
        } else {
            context.set_timeout(QueryTimeout::Unbounded);
        }

        let mut result = match execution.start() {
            Ok(()) => execution.status(),
            Err(err) => {
                self.metrics.record_start_failure();
                warn!(error = %err, "failed to start execution");
                ExecutionResult::new(query_id, err.to_status())
            }
        };
        if !execution.is_query() && result.status.needs_retry() {
            result.status.set_need_retry(true);
            self.metrics.record_retry_flagged_write();
        }
        Ok(result)
    }

    /// Run a tree-model statement. A non-positive `timeout_ms` uses the
    /// configured default.
    pub fn execute_for_tree_model(
        &self,
        statement: &TreeStatement,
        session: SessionInfo,
        sql: &str,
        timeout_ms: i64,
        user_query: bool,
    ) -> Result<ExecutionResult> {
        let timeout = QueryTimeout::from_millis_or(timeout_ms, self.config.query_timeout_threshold());
        self.execute(session, sql, user_query, |context, _start| {
            self.create_tree_execution(statement, context, timeout)
        })
    }

    /// Run an internal tree-model write without a deadline.
    pub fn execute_write_for_tree_model(
        &self,
        statement: &TreeStatement,
        session: SessionInfo,
        sql: &str,
    ) -> Result<ExecutionResult> {
        self.execute(session, sql, false, |context, _start| {
            self.create_tree_execution(statement, context, QueryTimeout::Unbounded)
        })
    }

    pub fn execute_for_table_model(
        &self,
        statement: &TableStatement,
        session: SessionInfo,
        sql: &str,
        timeout_ms: i64,
        user_query: bool,
    ) -> Result<ExecutionResult> {
        let timeout = QueryTimeout::from_millis_or(timeout_ms, self.config.query_timeout_threshold());
        self.execute(session, sql, user_query, |context, _start| {
            self.create_table_execution(StatementRef::Table(statement), context, timeout)
        })
    }

    /// Run a table-model statement issued by the node itself.
    pub fn execute_internal_for_table_model(
        &self,
        statement: &TableStatement,
        session: SessionInfo,
        sql: &str,
        timeout_ms: i64,
    ) -> Result<ExecutionResult> {
        self.execute_for_table_model(statement, session, sql, timeout_ms, false)
    }

    /// Plan a tree-model statement with the table-model planner.
    pub fn execute_tree_statement_for_table_model(
        &self,
        statement: &TreeStatement,
        session: SessionInfo,
        sql: &str,
        timeout_ms: i64,
    ) -> Result<ExecutionResult> {
        let timeout = QueryTimeout::from_millis_or(timeout_ms, self.config.query_timeout_threshold());
        self.execute(session, sql, false, |context, _start| {
            self.create_table_execution(StatementRef::Tree(statement), context, timeout)
        })
    }

    fn create_tree_execution(
        &self,
        statement: &TreeStatement,
        context: Arc<QueryContext>,
        timeout: QueryTimeout,
    ) -> Result<Arc<dyn QueryExecution>> {
        context.set_timeout(timeout);
        let statement_ref = StatementRef::Tree(statement);
        if let Some(query_type) = statement.kind().config_query_type() {
            context.set_query_type(query_type);
            let task = self
                .backend
                .config_task(SqlDialect::Tree, statement_ref, &context)?;
            return Ok(Arc::new(ConfigExecution::new(
                context,
                task,
                self.pools.read.clone(),
            )));
        }
        let planner = self.backend.planner(SqlDialect::Tree, statement_ref, &context)?;
        Ok(self.distributed_execution(context, planner))
    }

    fn create_table_execution(
        &self,
        statement: StatementRef<'_>,
        context: Arc<QueryContext>,
        timeout: QueryTimeout,
    ) -> Result<Arc<dyn QueryExecution>> {
        context.set_timeout(timeout);
        let config_routed = matches!(
            statement,
            StatementRef::Table(table) if table.kind().routing() == StatementRouting::Config
        );
        if config_routed {
            let task = self
                .backend
                .config_task(SqlDialect::Table, statement, &context)?;
            return Ok(Arc::new(ConfigExecution::new(
                context,
                task,
                self.pools.read.clone(),
            )));
        }
        let planner = self.backend.planner(SqlDialect::Table, statement, &context)?;
        Ok(self.distributed_execution(context, planner))
    }

    fn distributed_execution(
        &self,
        context: Arc<QueryContext>,
        planner: Box<dyn Planner>,
    ) -> Arc<dyn QueryExecution> {
        Arc::new(DistributedQueryExecution::new(
            context,
            planner,
            self.dispatcher.clone(),
            self.pools.scheduled.clone(),
            self.local_location.clone(),
            self.metrics.clone(),
        ))
    }

    pub fn get_execution(&self, query_id: QueryId) -> Option<Arc<dyn QueryExecution>> {
        self.executions
            .get(&query_id)
            .map(|entry| entry.value().clone())
    }

    pub fn list_executions(&self) -> Vec<Arc<dyn QueryExecution>> {
        self.executions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    /// Stop and forget an execution, then write its telemetry.
    ///
    /// `request` is the client's original request text, used in place of
    /// the SQL when present. An unknown id is a no-op.
    pub fn cleanup(
        &self,
        query_id: QueryId,
        request: Option<&str>,
        failure: Option<&CoordinatorError>,
    ) {
        let Some((_, execution)) = self.executions.remove(&query_id) else {
            return;
        };
        debug!(query_id = %query_id, failed = failure.is_some(), "[CleanUpQuery]");
        execution.stop_and_cleanup(failure);
        self.metrics.record_cleanup();

        if !(execution.is_query() && execution.is_user_query()) {
            return;
        }
        let cost_ns = execution.total_execution_time();
        let cost_ms = u64::try_from(cost_ns / 1_000_000).unwrap_or(0);
        if cost_ms >= self.config.slow_query_threshold_ms {
            let record = SlowQueryRecord {
                query_id: query_id.to_string(),
                cost_ms,
                content: content_of_request(request, execution.execute_sql()),
            };
            if let Err(err) = self.telemetry.slow_query(&record) {
                warn!(query_id = %query_id, error = %err, "failed to write slow query record");
            }
            self.metrics.record_slow_query();
        }

        if failure.is_some() || !self.config.enable_query_sampling {
            return;
        }
        let content = content_of_request(request, execution.execute_sql());
        let admitted = self
            .sampling_limiter
            .as_ref()
            .map_or(true, |limiter| limiter.try_acquire(content.len() as u64));
        if !admitted {
            self.metrics.record_sampling_suppressed();
            return;
        }
        let record = SampledQueryRecord {
            query_id: query_id.to_string(),
            user: execution.context().session().user_name.clone(),
            cost_ms,
            content,
        };
        if let Err(err) = self.telemetry.sampled_query(&record) {
            warn!(query_id = %query_id, error = %err, "failed to write sampled query record");
        }
        self.metrics.record_sampled_query();
    }

    pub fn cleanup_query(&self, query_id: QueryId) {
        self.cleanup(query_id, None, None);
    }

    pub fn record_execution_time(&self, query_id: QueryId, elapsed: Duration) {
        if let Some(execution) = self.get_execution(query_id) {
            execution.record_execution_time(elapsed);
        }
    }

    /// Recorded execution time in nanoseconds, or -1 for an unknown id.
    pub fn total_execution_time(&self, query_id: QueryId) -> i64 {
        self.get_execution(query_id)
            .map_or(-1, |execution| execution.total_execution_time())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn pools(&self) -> &CoordinatorPools {
        &self.pools
    }

    pub fn internal_clients(&self) -> &InternalClients {
        &self.clients
    }

    pub fn schema_locks(&self) -> &Arc<SchemaLockManager> {
        &self.schema_locks
    }

    pub fn memory_pool(&self) -> &Arc<FrontEndMemoryPool> {
        &self.memory_pool
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("data_node_id", &self.config.data_node_id)
            .field("executions", &self.executions.len())
            .finish_non_exhaustive()
    }
}
