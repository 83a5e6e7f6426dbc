//! Fragment instance placement and delivery.
//!
//! Each plan fragment becomes one instance bound to a region or a data node.
//! Reads are sent from the dispatch pool, which runs a send on the submitting
//! thread when no worker is idle. Writes go through the write pool and their
//! per-instance statuses are merged into one.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use strata_plan::{
    DataNodeId, DataNodeLocation, Endpoint, NodeDistribution, PlanFragment, PlanFragmentId,
    PlanNodeId, QueryId, RegionReplicaSet,
};
use tracing::{debug, warn};

use crate::client::{
    AsyncClientManager, AsyncInternalClient, CancelFragmentInstanceRequest, ClientManager,
    SendFragmentInstanceRequest, SyncInternalClient,
};
use crate::context::QueryTimeout;
use crate::error::CoordinatorError;
use crate::metrics::CoordinatorMetrics;
use crate::pool::{CoordinatorPools, Submission};
use crate::status::{Status, StatusCode};

/// Identifier of one running copy of a plan fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentInstanceId {
    pub fragment_id: PlanFragmentId,
    pub instance_id: i32,
}

impl FragmentInstanceId {
    pub const fn new(fragment_id: PlanFragmentId, instance_id: i32) -> Self {
        Self {
            fragment_id,
            instance_id,
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.fragment_id.query_id
    }
}

impl fmt::Display for FragmentInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.fragment_id, self.instance_id)
    }
}

/// Where an instance runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorTarget {
    /// Region-bound; runs on the region's leader replica.
    Region(RegionReplicaSet),
    /// Node-bound.
    Location(DataNodeLocation),
}

impl ExecutorTarget {
    /// Data node the instance is sent to, if any replica is known.
    pub fn host(&self) -> Option<&DataNodeLocation> {
        match self {
            Self::Region(region) => region.data_node_locations.first(),
            Self::Location(location) => Some(location),
        }
    }

    pub fn host_endpoint(&self) -> Option<&Endpoint> {
        self.host().map(|location| &location.internal_endpoint)
    }

    pub fn host_data_node_id(&self) -> Option<DataNodeId> {
        self.host().map(|location| location.data_node_id)
    }
}

/// A fragment bound to the node that will execute it.
#[derive(Clone, Debug)]
pub struct FragmentInstance {
    id: FragmentInstanceId,
    fragment: PlanFragment,
    target: ExecutorTarget,
}

impl FragmentInstance {
    /// Place `fragment` as the `index`th instance of its query.
    ///
    /// Placement prefers the fragment's region, then a node the fragment is
    /// pinned to, then the local node.
    pub fn place(
        mut fragment: PlanFragment,
        index: i32,
        distribution: Option<&HashMap<PlanNodeId, NodeDistribution>>,
        local: &DataNodeLocation,
    ) -> Self {
        let region = match distribution {
            Some(distribution) => fragment.target_region_for_table_model(distribution),
            None => fragment.target_region_for_tree_model(),
        }
        .filter(|region| !region.is_not_assigned())
        .cloned();
        let target = match region {
            Some(region) => ExecutorTarget::Region(region),
            None => ExecutorTarget::Location(
                fragment
                    .target_location()
                    .cloned()
                    .unwrap_or_else(|| local.clone()),
            ),
        };
        fragment.set_index_in_fragment_instance_list(index);
        Self {
            id: FragmentInstanceId::new(fragment.id(), index),
            fragment,
            target,
        }
    }

    pub fn id(&self) -> FragmentInstanceId {
        self.id
    }

    pub fn fragment(&self) -> &PlanFragment {
        &self.fragment
    }

    pub fn target(&self) -> &ExecutorTarget {
        &self.target
    }

    fn to_request(
        &self,
        query_id: QueryId,
        deadline: Option<Instant>,
        is_query: bool,
    ) -> anyhow::Result<SendFragmentInstanceRequest> {
        let timeout_ms = deadline.map(|deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .as_millis()
                .try_into()
                .unwrap_or(u64::MAX)
        });
        Ok(SendFragmentInstanceRequest {
            instance_id: self.id,
            query_id,
            fragment: self.fragment.to_bytes()?,
            timeout_ms,
            is_query,
        })
    }
}

/// Sends fragment instances to data nodes and cancels them again.
pub struct FragmentInstanceDispatcher {
    sync_clients: Arc<ClientManager<SyncInternalClient>>,
    async_clients: Arc<AsyncClientManager<AsyncInternalClient>>,
    pools: CoordinatorPools,
    metrics: Arc<CoordinatorMetrics>,
}

impl FragmentInstanceDispatcher {
    pub fn new(
        sync_clients: Arc<ClientManager<SyncInternalClient>>,
        async_clients: Arc<AsyncClientManager<AsyncInternalClient>>,
        pools: CoordinatorPools,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            sync_clients,
            async_clients,
            pools,
            metrics,
        }
    }

    /// Send every instance and wait for all sends to finish.
    ///
    /// Returns success, the single failure, or a `MULTIPLE_ERROR` status
    /// wrapping each failure.
    pub fn dispatch(
        &self,
        query_id: QueryId,
        instances: &[FragmentInstance],
        timeout: QueryTimeout,
        start_time: Instant,
        is_query: bool,
    ) -> Status {
        let pool = if is_query {
            &self.pools.dispatch
        } else {
            &self.pools.write
        };
        let deadline = timeout
            .as_duration()
            .and_then(|timeout| start_time.checked_add(timeout));
        let (tx, rx) = mpsc::channel();
        let mut statuses = Vec::with_capacity(instances.len());
        let mut submitted = 0usize;
        for instance in instances {
            let request = match instance.to_request(query_id, deadline, is_query) {
                Ok(request) => request,
                Err(err) => {
                    statuses.push(Status::error(
                        StatusCode::InternalServerError,
                        format!("serialize {}: {err:#}", instance.id()),
                    ));
                    continue;
                }
            };
            let Some(endpoint) = instance.target().host_endpoint().cloned() else {
                statuses.push(Status::error(
                    StatusCode::DispatchError,
                    format!("no replica to run {}", instance.id()),
                ));
                continue;
            };
            let clients = self.sync_clients.clone();
            let tx = tx.clone();
            let job = move || {
                let status = send_instance(&clients, &endpoint, &request);
                let _ = tx.send(status);
            };
            match pool.execute(job) {
                Ok(Submission::Queued) => submitted += 1,
                Ok(Submission::CallerRan) => {
                    self.metrics.record_caller_run_dispatch();
                    submitted += 1;
                }
                Err(err) => statuses.push(Status::error(
                    StatusCode::DispatchError,
                    format!("submit {}: {err:#}", instance.id()),
                )),
            }
        }
        drop(tx);
        let received_before = statuses.len();
        statuses.extend(rx.iter());
        if statuses.len() - received_before < submitted {
            statuses.push(Status::error(
                StatusCode::InternalServerError,
                "a dispatch job exited without reporting",
            ));
        }
        self.metrics.record_dispatched_instances(submitted as u64);
        let merged = merge_statuses(statuses);
        if !merged.is_success() {
            self.metrics.record_dispatch_failure();
        }
        debug!(query_id = %query_id, instances = instances.len(), status = %merged, "dispatch finished");
        merged
    }

    /// Ask every host to stop its instances. Failures are logged only.
    pub fn cancel(
        &self,
        instances: Vec<(FragmentInstanceId, Endpoint)>,
        reason: String,
    ) -> tokio::task::JoinHandle<()> {
        let clients = self.async_clients.clone();
        self.pools.scheduled.spawn(async move {
            let sends = instances.into_iter().map(|(instance_id, endpoint)| {
                let clients = clients.clone();
                let request = CancelFragmentInstanceRequest {
                    instance_id,
                    reason: reason.clone(),
                };
                async move {
                    let mut client = match clients.borrow_client(&endpoint).await {
                        Ok(client) => client,
                        Err(err) => {
                            warn!(instance = %instance_id, endpoint = %endpoint, error = %err, "cancel skipped");
                            return;
                        }
                    };
                    if let Err(err) = client.cancel_fragment_instance(&request).await {
                        warn!(instance = %instance_id, endpoint = %endpoint, error = %err, "cancel failed");
                        client.invalidate();
                    }
                }
            });
            futures_util::future::join_all(sends).await;
        })
    }
}

fn send_instance(
    clients: &ClientManager<SyncInternalClient>,
    endpoint: &Endpoint,
    request: &SendFragmentInstanceRequest,
) -> Status {
    let mut client = match clients.borrow_client(endpoint) {
        Ok(client) => client,
        Err(err) => return err.to_status(),
    };
    match client.send_fragment_instance(request) {
        Ok(status) => status,
        Err(err) => {
            warn!(instance = %request.instance_id, endpoint = %endpoint, error = %err, "send failed");
            client.invalidate();
            CoordinatorError::Dispatch {
                endpoint: endpoint.clone(),
                message: format!("{err:#}"),
            }
            .to_status()
        }
    }
}

fn merge_statuses(statuses: Vec<Status>) -> Status {
    let mut failures: Vec<Status> = statuses.into_iter().filter(|s| !s.is_success()).collect();
    match failures.len() {
        0 => Status::success(),
        1 => failures.remove(0),
        _ => Status::multiple(failures),
    }
}
