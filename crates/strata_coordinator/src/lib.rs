//! Query coordination for one data node.
//!
//! The coordinator owns the lifecycle of every query and write issued on the
//! node:
//! - id and context allocation, timeout defaulting, front-end memory release,
//! - routing statements to config tasks or distributed plans,
//! - placing plan fragments and dispatching them over pooled internal clients,
//! - the live execution map, cleanup, and slow/sampled query logs.
//!
//! Planning itself lives behind [`PlanningBackend`].

pub mod client;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod pool;
pub mod schema_lock;
pub mod statement;
pub mod status;
pub mod telemetry;

pub use client::{
    AsyncClientManager, AsyncInternalClient, AsyncInternalServiceClient,
    CancelFragmentInstanceRequest, ClientFactory, ClientManager, InternalServiceClient,
    SendFragmentInstanceRequest, SyncInternalClient,
};
pub use config::CoordinatorConfig;
pub use context::{FrontEndMemoryPool, QueryContext, QueryTimeout, SessionInfo, SqlDialect};
pub use coordinator::{Coordinator, InternalClients, PlanningBackend};
pub use dispatch::{ExecutorTarget, FragmentInstance, FragmentInstanceDispatcher, FragmentInstanceId};
pub use error::{CoordinatorError, Result};
pub use execution::{
    ConfigExecution, ConfigTask, DistributedPlan, DistributedQueryExecution, ExecutionResult,
    ExecutionState, Planner, QueryExecution,
};
pub use metrics::{CoordinatorMetrics, CoordinatorMetricsSnapshot};
pub use pool::{CoordinatorPools, SaturationPolicy, ScheduledPool, Submission, WorkerPool};
pub use schema_lock::SchemaLockManager;
pub use statement::{
    QueryType, Statement, StatementRef, StatementRouting, TableStatement, TableStatementKind,
    TreeStatement, TreeStatementKind,
};
pub use status::{Status, StatusCode};
pub use telemetry::{
    SampledQueryRecord, SamplingRateLimiter, SlowQueryRecord, TelemetrySink, TokenBucket,
    TracingTelemetrySink,
};
