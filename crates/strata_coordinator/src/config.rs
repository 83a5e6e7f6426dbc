//! Coordinator configuration.
//!
//! Every field can be given as a CLI flag or a `STRATA_*` environment
//! variable; embedding processes can also load it from JSON.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use strata_plan::{DataNodeId, DataNodeLocation, Endpoint};

/// Threads driving timeout checks and cancellation fan-out.
pub const SCHEDULED_EXECUTOR_SIZE: usize = 10;
/// Lower bound for the dispatch pool size.
pub const MIN_DISPATCH_THREADS: usize = 20;

/// Runtime options for one coordinator instance.
#[derive(Parser, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Node component of every issued query id.
    #[arg(long, env = "STRATA_DATA_NODE_ID", default_value_t = 0)]
    pub data_node_id: DataNodeId,

    /// Address this node advertises for internal and data-block endpoints.
    #[arg(long, env = "STRATA_INTERNAL_ADDRESS", default_value = "127.0.0.1")]
    pub internal_address: String,

    /// Port of the internal RPC service used for fragment dispatch.
    #[arg(long, env = "STRATA_INTERNAL_PORT", default_value_t = 10730)]
    pub internal_port: u16,

    /// Port exchange operators pull result blocks from.
    #[arg(long, env = "STRATA_DATA_BLOCK_PORT", default_value_t = 10740)]
    pub data_block_port: u16,

    /// Default query deadline when the caller gives none.
    #[arg(long, env = "STRATA_QUERY_TIMEOUT_THRESHOLD_MS", default_value_t = 60_000)]
    pub query_timeout_threshold_ms: u64,

    /// Queries costing at least this long are written to the slow query log.
    #[arg(long, env = "STRATA_SLOW_QUERY_THRESHOLD_MS", default_value_t = 10_000)]
    pub slow_query_threshold_ms: u64,

    #[arg(long, env = "STRATA_COORDINATOR_READ_EXECUTOR_SIZE", default_value_t = 20)]
    pub coordinator_read_executor_size: usize,

    #[arg(long, env = "STRATA_COORDINATOR_WRITE_EXECUTOR_SIZE", default_value_t = 50)]
    pub coordinator_write_executor_size: usize,

    /// Log successful user queries to the sampled query log.
    #[arg(long, env = "STRATA_ENABLE_QUERY_SAMPLING", default_value_t = false)]
    pub enable_query_sampling: bool,

    /// Request bytes per second admitted into the sampled query log.
    ///
    /// Unset means every successful user query is sampled.
    #[arg(long, env = "STRATA_QUERY_SAMPLING_BYTES_PER_SEC")]
    pub query_sampling_bytes_per_sec: Option<u64>,

    /// Maximum pooled internal clients per remote endpoint.
    #[arg(long, env = "STRATA_CLIENT_POOL_MAX_PER_ENDPOINT", default_value_t = 64)]
    pub client_pool_max_per_endpoint: usize,

    /// How long a checkout waits for a pooled client before failing.
    #[arg(long, env = "STRATA_CLIENT_POOL_WAIT_TIMEOUT_MS", default_value_t = 5_000)]
    pub client_pool_wait_timeout_ms: u64,

    /// Memory the front end may reserve across in-flight queries.
    #[arg(long, env = "STRATA_FRONT_END_MEMORY_BYTES", default_value_t = 256 * 1024 * 1024)]
    pub front_end_memory_bytes: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_node_id: 0,
            internal_address: "127.0.0.1".to_string(),
            internal_port: 10730,
            data_block_port: 10740,
            query_timeout_threshold_ms: 60_000,
            slow_query_threshold_ms: 10_000,
            coordinator_read_executor_size: 20,
            coordinator_write_executor_size: 50,
            enable_query_sampling: false,
            query_sampling_bytes_per_sec: None,
            client_pool_max_per_endpoint: 64,
            client_pool_wait_timeout_ms: 5_000,
            front_end_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Build a config from `STRATA_*` environment variables and defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self::try_parse_from(["strata-coordinator"])
            .context("parse coordinator config from environment")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("parse coordinator config json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.coordinator_read_executor_size > 0,
            "coordinator_read_executor_size must be positive"
        );
        anyhow::ensure!(
            self.coordinator_write_executor_size > 0,
            "coordinator_write_executor_size must be positive"
        );
        anyhow::ensure!(
            self.client_pool_max_per_endpoint > 0,
            "client_pool_max_per_endpoint must be positive"
        );
        anyhow::ensure!(
            self.query_timeout_threshold_ms > 0,
            "query_timeout_threshold_ms must be positive"
        );
        Ok(())
    }

    pub fn internal_endpoint(&self) -> Endpoint {
        Endpoint::new(self.internal_address.clone(), self.internal_port)
    }

    pub fn data_block_endpoint(&self) -> Endpoint {
        Endpoint::new(self.internal_address.clone(), self.data_block_port)
    }

    pub fn local_location(&self) -> DataNodeLocation {
        DataNodeLocation::new(
            self.data_node_id,
            self.internal_endpoint(),
            self.data_block_endpoint(),
        )
    }

    pub fn query_timeout_threshold(&self) -> Duration {
        Duration::from_millis(self.query_timeout_threshold_ms)
    }

    pub fn client_pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.client_pool_wait_timeout_ms)
    }

    /// Dispatch pool size: twice the CPU count, at least [`MIN_DISPATCH_THREADS`].
    pub fn dispatch_executor_size(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        MIN_DISPATCH_THREADS.max(cpus * 2)
    }
}
