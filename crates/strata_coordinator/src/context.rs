//! Per-operation query context and front-end memory accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_plan::{Endpoint, QueryId};

use crate::error::{CoordinatorError, Result};
use crate::statement::QueryType;

/// Which statement language a session speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlDialect {
    #[default]
    Tree,
    Table,
}

/// Client session data forwarded to planners; never inspected here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: i64,
    pub user_name: String,
    pub zone_id: String,
    pub database: Option<String>,
    pub dialect: SqlDialect,
}

impl SessionInfo {
    pub fn new(session_id: i64, user_name: impl Into<String>) -> Self {
        Self {
            session_id,
            user_name: user_name.into(),
            zone_id: "UTC".to_string(),
            database: None,
            dialect: SqlDialect::Tree,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }
}

/// Time budget of one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryTimeout {
    Bounded(Duration),
    /// Writes are not time-limited by the coordinator.
    Unbounded,
}

impl QueryTimeout {
    /// Resolve a caller timeout in milliseconds; non-positive means "use the default".
    pub fn from_millis_or(timeout_ms: i64, default: Duration) -> Self {
        if timeout_ms > 0 {
            Self::Bounded(Duration::from_millis(timeout_ms as u64))
        } else {
            Self::Bounded(default)
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Bounded(duration) => Some(duration),
            Self::Unbounded => None,
        }
    }
}

/// Process-wide budget for memory reserved by front-end planning.
#[derive(Debug)]
pub struct FrontEndMemoryPool {
    capacity: u64,
    used: AtomicU64,
}

impl FrontEndMemoryPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn try_reserve(&self, bytes: u64) -> Result<()> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.capacity {
                return Err(CoordinatorError::MemoryExhausted {
                    requested: bytes,
                    available: self.capacity.saturating_sub(current),
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Mutable state of one query or write, shared by the coordinator and its execution.
#[derive(Debug)]
pub struct QueryContext {
    sql: String,
    query_id: QueryId,
    session: SessionInfo,
    local_data_block_endpoint: Endpoint,
    local_internal_endpoint: Endpoint,
    start_time: Instant,
    timeout: Mutex<QueryTimeout>,
    query_type: Mutex<QueryType>,
    user_query: AtomicBool,
    memory_pool: Arc<FrontEndMemoryPool>,
    reserved_bytes: AtomicU64,
    /// Set while this context holds the shared schema read lock.
    holds_schema_read_lock: AtomicBool,
}

impl QueryContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sql: impl Into<String>,
        query_id: QueryId,
        session: SessionInfo,
        local_data_block_endpoint: Endpoint,
        local_internal_endpoint: Endpoint,
        start_time: Instant,
        default_timeout: Duration,
        memory_pool: Arc<FrontEndMemoryPool>,
    ) -> Self {
        Self {
            sql: sql.into(),
            query_id,
            session,
            local_data_block_endpoint,
            local_internal_endpoint,
            start_time,
            timeout: Mutex::new(QueryTimeout::Bounded(default_timeout)),
            query_type: Mutex::new(QueryType::Read),
            user_query: AtomicBool::new(false),
            memory_pool,
            reserved_bytes: AtomicU64::new(0),
            holds_schema_read_lock: AtomicBool::new(false),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn local_data_block_endpoint(&self) -> &Endpoint {
        &self.local_data_block_endpoint
    }

    pub fn local_internal_endpoint(&self) -> &Endpoint {
        &self.local_internal_endpoint
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn timeout(&self) -> QueryTimeout {
        *self.timeout.lock()
    }

    pub fn set_timeout(&self, timeout: QueryTimeout) {
        *self.timeout.lock() = timeout;
    }

    /// Absolute deadline, `None` when unbounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout()
            .as_duration()
            .and_then(|timeout| self.start_time.checked_add(timeout))
    }

    pub fn query_type(&self) -> QueryType {
        *self.query_type.lock()
    }

    pub fn set_query_type(&self, query_type: QueryType) {
        *self.query_type.lock() = query_type;
    }

    pub fn is_user_query(&self) -> bool {
        self.user_query.load(Ordering::Acquire)
    }

    pub fn set_user_query(&self, user_query: bool) {
        self.user_query.store(user_query, Ordering::Release);
    }

    /// Reserve front-end memory on behalf of this query.
    pub fn reserve_memory_for_front_end(&self, bytes: u64) -> Result<()> {
        self.memory_pool.try_reserve(bytes)?;
        self.reserved_bytes.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    pub fn reserved_front_end_memory(&self) -> u64 {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    /// Return every reserved byte to the pool. Safe to call more than once.
    pub fn release_all_memory_reserved_for_front_end(&self) {
        let reserved = self.reserved_bytes.swap(0, Ordering::AcqRel);
        if reserved > 0 {
            self.memory_pool.release(reserved);
        }
    }

    pub fn holds_schema_read_lock(&self) -> bool {
        self.holds_schema_read_lock.load(Ordering::Acquire)
    }

    pub(crate) fn mark_schema_read_lock(&self) {
        self.holds_schema_read_lock.store(true, Ordering::Release);
    }

    /// Clear the lock flag; returns whether it was set.
    pub(crate) fn take_schema_read_lock(&self) -> bool {
        self.holds_schema_read_lock.swap(false, Ordering::AcqRel)
    }
}
