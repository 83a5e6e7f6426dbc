//! Pooled clients for other data nodes' internal service.
//!
//! Pools are keyed by endpoint and shared by every query on the node. A
//! borrowed client goes back to its pool when the guard is dropped, unless the
//! caller invalidates it after a transport error.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use strata_plan::{Endpoint, QueryId};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::dispatch::FragmentInstanceId;
use crate::error::{CoordinatorError, Result};
use crate::status::Status;

/// Request to run one fragment instance on a remote node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendFragmentInstanceRequest {
    pub instance_id: FragmentInstanceId,
    pub query_id: QueryId,
    /// Fragment in stream form.
    pub fragment: Bytes,
    /// Remaining time budget; `None` for writes.
    pub timeout_ms: Option<u64>,
    pub is_query: bool,
}

/// Request to stop one fragment instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelFragmentInstanceRequest {
    pub instance_id: FragmentInstanceId,
    pub reason: String,
}

/// Blocking client of a remote internal service.
pub trait InternalServiceClient: Send + 'static {
    fn send_fragment_instance(&mut self, request: &SendFragmentInstanceRequest)
        -> anyhow::Result<Status>;
}

/// Async client of a remote internal service.
#[async_trait]
pub trait AsyncInternalServiceClient: Send + 'static {
    async fn cancel_fragment_instance(
        &mut self,
        request: &CancelFragmentInstanceRequest,
    ) -> anyhow::Result<()>;
}

/// Creates clients for an endpoint on demand.
pub trait ClientFactory<C>: Send + Sync {
    fn create_client(&self, endpoint: &Endpoint) -> anyhow::Result<C>;
}

impl<C, F> ClientFactory<C> for F
where
    F: Fn(&Endpoint) -> anyhow::Result<C> + Send + Sync,
{
    fn create_client(&self, endpoint: &Endpoint) -> anyhow::Result<C> {
        self(endpoint)
    }
}

/// Boxed blocking client as pooled by the coordinator.
pub type SyncInternalClient = Box<dyn InternalServiceClient>;
/// Boxed async client as pooled by the coordinator.
pub type AsyncInternalClient = Box<dyn AsyncInternalServiceClient>;

#[derive(Debug)]
struct SyncPoolState<C> {
    idle: Vec<C>,
    borrowed: usize,
}

#[derive(Debug)]
struct SyncEndpointPool<C> {
    state: Mutex<SyncPoolState<C>>,
    returned: Condvar,
}

/// Blocking client pools keyed by endpoint.
pub struct ClientManager<C> {
    factory: Arc<dyn ClientFactory<C>>,
    pools: DashMap<Endpoint, Arc<SyncEndpointPool<C>>>,
    max_per_endpoint: usize,
    wait_timeout: Duration,
}

impl<C: Send + 'static> ClientManager<C> {
    pub fn new(
        factory: Arc<dyn ClientFactory<C>>,
        max_per_endpoint: usize,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            pools: DashMap::new(),
            max_per_endpoint: max_per_endpoint.max(1),
            wait_timeout,
        }
    }

    fn pool(&self, endpoint: &Endpoint) -> Arc<SyncEndpointPool<C>> {
        self.pools
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(SyncEndpointPool {
                    state: Mutex::new(SyncPoolState {
                        idle: Vec::new(),
                        borrowed: 0,
                    }),
                    returned: Condvar::new(),
                })
            })
            .clone()
    }

    /// Borrow a client, waiting up to the configured timeout when the pool is full.
    pub fn borrow_client(&self, endpoint: &Endpoint) -> Result<PooledClient<C>> {
        let pool = self.pool(endpoint);
        let mut state = pool.state.lock();
        while state.idle.is_empty() && state.borrowed >= self.max_per_endpoint {
            if pool
                .returned
                .wait_for(&mut state, self.wait_timeout)
                .timed_out()
            {
                return Err(CoordinatorError::ClientPoolExhausted {
                    endpoint: endpoint.clone(),
                    waited: self.wait_timeout,
                });
            }
        }
        state.borrowed += 1;
        let idle = state.idle.pop();
        drop(state);

        let client = match idle {
            Some(client) => client,
            None => match self.factory.create_client(endpoint) {
                Ok(client) => {
                    debug!(%endpoint, "created internal service client");
                    client
                }
                Err(err) => {
                    release_slot(&pool);
                    return Err(CoordinatorError::Dispatch {
                        endpoint: endpoint.clone(),
                        message: format!("{err:#}"),
                    });
                }
            },
        };
        Ok(PooledClient {
            client: Some(client),
            pool,
        })
    }

    /// Idle plus borrowed clients for `endpoint`.
    pub fn client_count(&self, endpoint: &Endpoint) -> usize {
        self.pools
            .get(endpoint)
            .map(|pool| {
                let state = pool.state.lock();
                state.idle.len() + state.borrowed
            })
            .unwrap_or(0)
    }

    /// Drop every idle client of `endpoint`, e.g. after the node left the cluster.
    pub fn clear(&self, endpoint: &Endpoint) {
        if let Some(pool) = self.pools.get(endpoint) {
            pool.state.lock().idle.clear();
        }
    }
}

fn release_slot<C>(pool: &SyncEndpointPool<C>) {
    let mut state = pool.state.lock();
    state.borrowed = state.borrowed.saturating_sub(1);
    pool.returned.notify_one();
}

/// Borrowed blocking client; returns to its pool on drop.
pub struct PooledClient<C> {
    client: Option<C>,
    pool: Arc<SyncEndpointPool<C>>,
}

impl<C> PooledClient<C> {
    /// Discard the client instead of returning it, e.g. after a transport error.
    pub fn invalidate(mut self) {
        self.client = None;
    }
}

impl<C> Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled client used after invalidation"))
    }
}

impl<C> DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled client used after invalidation"))
    }
}

impl<C> Drop for PooledClient<C> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
        if let Some(client) = self.client.take() {
            state.idle.push(client);
        }
        self.pool.returned.notify_one();
    }
}

#[derive(Debug)]
struct AsyncEndpointPool<C> {
    idle: Mutex<Vec<C>>,
    permits: Arc<Semaphore>,
}

/// Async client pools keyed by endpoint.
pub struct AsyncClientManager<C> {
    factory: Arc<dyn ClientFactory<C>>,
    pools: DashMap<Endpoint, Arc<AsyncEndpointPool<C>>>,
    max_per_endpoint: usize,
    wait_timeout: Duration,
}

impl<C: Send + 'static> AsyncClientManager<C> {
    pub fn new(
        factory: Arc<dyn ClientFactory<C>>,
        max_per_endpoint: usize,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            pools: DashMap::new(),
            max_per_endpoint: max_per_endpoint.max(1),
            wait_timeout,
        }
    }

    fn pool(&self, endpoint: &Endpoint) -> Arc<AsyncEndpointPool<C>> {
        self.pools
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(AsyncEndpointPool {
                    idle: Mutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(self.max_per_endpoint)),
                })
            })
            .clone()
    }

    pub async fn borrow_client(&self, endpoint: &Endpoint) -> Result<AsyncPooledClient<C>> {
        let pool = self.pool(endpoint);
        let permit = tokio::time::timeout(self.wait_timeout, pool.permits.clone().acquire_owned())
            .await
            .map_err(|_| CoordinatorError::ClientPoolExhausted {
                endpoint: endpoint.clone(),
                waited: self.wait_timeout,
            })?
            .map_err(|_| CoordinatorError::Internal(anyhow::anyhow!("client pool closed")))?;
        let idle = pool.idle.lock().pop();
        let client = match idle {
            Some(client) => client,
            None => self
                .factory
                .create_client(endpoint)
                .map_err(|err| CoordinatorError::Dispatch {
                    endpoint: endpoint.clone(),
                    message: format!("{err:#}"),
                })?,
        };
        Ok(AsyncPooledClient {
            client: Some(client),
            pool,
            _permit: permit,
        })
    }

    pub fn available_permits(&self, endpoint: &Endpoint) -> usize {
        self.pools
            .get(endpoint)
            .map(|pool| pool.permits.available_permits())
            .unwrap_or(self.max_per_endpoint)
    }
}

/// Borrowed async client; returns to its pool on drop.
pub struct AsyncPooledClient<C> {
    client: Option<C>,
    pool: Arc<AsyncEndpointPool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C> AsyncPooledClient<C> {
    pub fn invalidate(mut self) {
        self.client = None;
    }
}

impl<C> Deref for AsyncPooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled client used after invalidation"))
    }
}

impl<C> DerefMut for AsyncPooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled client used after invalidation"))
    }
}

impl<C> Drop for AsyncPooledClient<C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.idle.lock().push(client);
        }
    }
}
