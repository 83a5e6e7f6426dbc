//! Shared helpers for coordinator integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_coordinator::{
    AsyncInternalClient, AsyncInternalServiceClient, CancelFragmentInstanceRequest, ConfigTask,
    Coordinator, CoordinatorConfig, CoordinatorError, DistributedPlan, ExecutionResult,
    ExecutionState, FragmentInstanceId, InternalClients, InternalServiceClient, Planner,
    PlanningBackend, QueryContext, QueryExecution, SampledQueryRecord, SchemaLockManager,
    SendFragmentInstanceRequest, SlowQueryRecord, SqlDialect, StatementRef, Status, StatusCode,
    SyncInternalClient, TelemetrySink,
};
use strata_plan::{
    ConsensusGroupId, DataNodeLocation, Endpoint, PlanFragment, PlanFragmentId, PlanNodeBuilder,
    PlanNodeKind, QueryId, RegionReplicaSet, ScanOrder,
};

/// Upper bound for polling background effects.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small pools and a fixed node id.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        data_node_id: 7,
        coordinator_read_executor_size: 2,
        coordinator_write_executor_size: 2,
        client_pool_max_per_endpoint: 4,
        client_pool_wait_timeout_ms: 500,
        front_end_memory_bytes: 1 << 20,
        ..CoordinatorConfig::default()
    }
}

pub fn location(node: i32) -> DataNodeLocation {
    DataNodeLocation::new(
        node,
        Endpoint::new(format!("10.0.0.{node}"), 10730),
        Endpoint::new(format!("10.0.0.{node}"), 10740),
    )
}

pub fn region(id: i32, nodes: &[i32]) -> RegionReplicaSet {
    RegionReplicaSet::new(
        ConsensusGroupId::data_region(id),
        nodes.iter().map(|n| location(*n)).collect(),
    )
}

/// One series scan fragment bound to `region`.
pub fn scan_fragment(query_id: QueryId, index: i32, region: RegionReplicaSet) -> PlanFragment {
    let tree = PlanNodeBuilder::new(
        format!("scan-{index}"),
        PlanNodeKind::SeriesScan {
            series_path: format!("root.sg.d{index}.s1"),
            scan_order: ScanOrder::Asc,
            region: Some(region),
        },
    )
    .build();
    PlanFragment::new(PlanFragmentId::new(query_id, index), Some(tree))
}

/// Scripted behavior of the planners a [`FakeBackend`] hands out.
#[derive(Clone)]
pub struct PlannerScript {
    pub is_query: bool,
    /// Regions of the fragments to emit, one fragment each.
    pub regions: Vec<RegionReplicaSet>,
    pub fail_analysis: bool,
    pub reserve_bytes: u64,
    pub take_schema_lock: bool,
}

impl Default for PlannerScript {
    fn default() -> Self {
        Self {
            is_query: true,
            regions: vec![region(1, &[1])],
            fail_analysis: false,
            reserve_bytes: 0,
            take_schema_lock: false,
        }
    }
}

struct FakePlanner {
    script: PlannerScript,
    schema_locks: Arc<SchemaLockManager>,
}

impl Planner for FakePlanner {
    fn is_query(&self) -> bool {
        self.script.is_query
    }

    fn analyze(&mut self, context: &QueryContext) -> strata_coordinator::Result<()> {
        if self.script.take_schema_lock {
            self.schema_locks.take_read_lock(context);
        }
        if self.script.reserve_bytes > 0 {
            context.reserve_memory_for_front_end(self.script.reserve_bytes)?;
        }
        if self.script.fail_analysis {
            return Err(CoordinatorError::Planning("unknown series root.sg.x".into()));
        }
        Ok(())
    }

    fn plan(&mut self, context: &QueryContext) -> strata_coordinator::Result<DistributedPlan> {
        let fragments = self
            .script
            .regions
            .iter()
            .cloned()
            .zip(0..)
            .map(|(region, index)| scan_fragment(context.query_id(), index, region))
            .collect();
        Ok(DistributedPlan {
            fragments,
            node_distribution: None,
        })
    }
}

struct FixedConfigTask(Status);

impl ConfigTask for FixedConfigTask {
    fn execute(&self, _context: &QueryContext) -> anyhow::Result<Status> {
        Ok(self.0.clone())
    }
}

/// Backend that records which path each statement took.
pub struct FakeBackend {
    pub script: Mutex<PlannerScript>,
    pub config_status: Mutex<Status>,
    pub config_calls: Mutex<Vec<SqlDialect>>,
    pub planner_calls: Mutex<Vec<SqlDialect>>,
    pub schema_locks: Arc<SchemaLockManager>,
}

impl FakeBackend {
    pub fn new(schema_locks: Arc<SchemaLockManager>) -> Self {
        Self {
            script: Mutex::new(PlannerScript::default()),
            config_status: Mutex::new(Status::success()),
            config_calls: Mutex::new(Vec::new()),
            planner_calls: Mutex::new(Vec::new()),
            schema_locks,
        }
    }
}

impl PlanningBackend for FakeBackend {
    fn config_task(
        &self,
        dialect: SqlDialect,
        _statement: StatementRef<'_>,
        _context: &Arc<QueryContext>,
    ) -> strata_coordinator::Result<Arc<dyn ConfigTask>> {
        self.config_calls.lock().push(dialect);
        Ok(Arc::new(FixedConfigTask(self.config_status.lock().clone())))
    }

    fn planner(
        &self,
        dialect: SqlDialect,
        _statement: StatementRef<'_>,
        _context: &Arc<QueryContext>,
    ) -> strata_coordinator::Result<Box<dyn Planner>> {
        self.planner_calls.lock().push(dialect);
        Ok(Box::new(FakePlanner {
            script: self.script.lock().clone(),
            schema_locks: self.schema_locks.clone(),
        }))
    }
}

/// What the fake data nodes saw.
#[derive(Default)]
pub struct FakeCluster {
    /// Status each endpoint answers with; success when absent.
    pub answers: Mutex<HashMap<Endpoint, Status>>,
    pub sent: Mutex<Vec<(Endpoint, FragmentInstanceId)>>,
    pub canceled: Mutex<Vec<FragmentInstanceId>>,
}

struct FakeSyncClient {
    endpoint: Endpoint,
    cluster: Arc<FakeCluster>,
}

impl InternalServiceClient for FakeSyncClient {
    fn send_fragment_instance(
        &mut self,
        request: &SendFragmentInstanceRequest,
    ) -> anyhow::Result<Status> {
        PlanFragment::deserialize(&request.fragment)?;
        self.cluster
            .sent
            .lock()
            .push((self.endpoint.clone(), request.instance_id));
        Ok(self
            .cluster
            .answers
            .lock()
            .get(&self.endpoint)
            .cloned()
            .unwrap_or_else(Status::success))
    }
}

struct FakeAsyncClient {
    cluster: Arc<FakeCluster>,
}

#[async_trait]
impl AsyncInternalServiceClient for FakeAsyncClient {
    async fn cancel_fragment_instance(
        &mut self,
        request: &CancelFragmentInstanceRequest,
    ) -> anyhow::Result<()> {
        self.cluster.canceled.lock().push(request.instance_id);
        Ok(())
    }
}

pub fn fake_clients(cluster: &Arc<FakeCluster>, config: &CoordinatorConfig) -> InternalClients {
    let sync_cluster = cluster.clone();
    let async_cluster = cluster.clone();
    InternalClients::new(
        Arc::new(move |endpoint: &Endpoint| -> anyhow::Result<SyncInternalClient> {
            Ok(Box::new(FakeSyncClient {
                endpoint: endpoint.clone(),
                cluster: sync_cluster.clone(),
            }))
        }),
        Arc::new(move |_: &Endpoint| -> anyhow::Result<AsyncInternalClient> {
            Ok(Box::new(FakeAsyncClient {
                cluster: async_cluster.clone(),
            }))
        }),
        config,
    )
}

/// Sink that keeps every record in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub slow: Mutex<Vec<SlowQueryRecord>>,
    pub sampled: Mutex<Vec<SampledQueryRecord>>,
    pub fail: bool,
}

impl TelemetrySink for RecordingSink {
    fn slow_query(&self, record: &SlowQueryRecord) -> anyhow::Result<()> {
        self.slow.lock().push(record.clone());
        anyhow::ensure!(!self.fail, "slow log unavailable");
        Ok(())
    }

    fn sampled_query(&self, record: &SampledQueryRecord) -> anyhow::Result<()> {
        self.sampled.lock().push(record.clone());
        anyhow::ensure!(!self.fail, "sample log unavailable");
        Ok(())
    }
}

/// A coordinator wired to fakes.
pub struct Harness {
    pub coordinator: Coordinator,
    pub backend: Arc<FakeBackend>,
    pub cluster: Arc<FakeCluster>,
    pub sink: Arc<RecordingSink>,
}

pub fn harness(config: CoordinatorConfig) -> Harness {
    harness_with_sink(config, RecordingSink::default())
}

pub fn harness_with_sink(config: CoordinatorConfig, sink: RecordingSink) -> Harness {
    init_tracing();
    let schema_locks = Arc::new(SchemaLockManager::new());
    let backend = Arc::new(FakeBackend::new(schema_locks.clone()));
    let cluster = Arc::new(FakeCluster::default());
    let sink = Arc::new(sink);
    let clients = fake_clients(&cluster, &config);
    let coordinator = Coordinator::new(config, backend.clone(), clients)
        .expect("coordinator")
        .with_schema_locks(schema_locks)
        .with_telemetry(sink.clone());
    Harness {
        coordinator,
        backend,
        cluster,
        sink,
    }
}

/// Execution with fixed answers, for driving `Coordinator::execute` directly.
pub struct FixedExecution {
    pub context: Arc<QueryContext>,
    pub is_query: bool,
    pub status: Status,
    pub start_error: Mutex<Option<CoordinatorError>>,
    pub state: Mutex<ExecutionState>,
    pub recorded_ns: Mutex<i64>,
    pub cleanups: Mutex<Vec<Option<String>>>,
}

impl FixedExecution {
    pub fn new(context: Arc<QueryContext>, is_query: bool, status: Status) -> Self {
        Self {
            context,
            is_query,
            status,
            start_error: Mutex::new(None),
            state: Mutex::new(ExecutionState::Queued),
            recorded_ns: Mutex::new(0),
            cleanups: Mutex::new(Vec::new()),
        }
    }
}

impl QueryExecution for FixedExecution {
    fn context(&self) -> &Arc<QueryContext> {
        &self.context
    }

    fn is_query(&self) -> bool {
        self.is_query
    }

    fn start(&self) -> strata_coordinator::Result<()> {
        if let Some(err) = self.start_error.lock().take() {
            return Err(err);
        }
        *self.state.lock() = ExecutionState::Running;
        Ok(())
    }

    fn status(&self) -> ExecutionResult {
        ExecutionResult::new(self.context.query_id(), self.status.clone())
    }

    fn state(&self) -> ExecutionState {
        *self.state.lock()
    }

    fn stop_and_cleanup(&self, failure: Option<&CoordinatorError>) {
        self.cleanups
            .lock()
            .push(failure.map(|err| err.to_string()));
        *self.state.lock() = ExecutionState::Finished;
    }

    fn record_execution_time(&self, elapsed: Duration) {
        *self.recorded_ns.lock() += elapsed.as_nanos() as i64;
    }

    fn total_execution_time(&self) -> i64 {
        *self.recorded_ns.lock()
    }
}

/// Poll `check` until it holds or [`WAIT_TIMEOUT`] passes.
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

pub fn retryable_write_failure() -> Status {
    Status::error(StatusCode::WriteProcessReject, "region is read only")
}
