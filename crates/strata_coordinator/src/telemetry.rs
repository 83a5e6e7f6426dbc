//! Slow-query and sampled-query logs.
//!
//! Both logs are written after a query is cleaned up. A failing sink is
//! logged and otherwise ignored.

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Target of the slow query log.
pub const SLOW_SQL_TARGET: &str = "slow_sql";
/// Target of the sampled query log.
pub const SAMPLED_QUERIES_TARGET: &str = "sampled_queries";

/// Placeholder content when neither the request nor the SQL is known.
pub const UNKNOWN_CONTENT: &str = "UNKNOWN";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlowQueryRecord {
    pub query_id: String,
    pub cost_ms: u64,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SampledQueryRecord {
    pub query_id: String,
    pub user: String,
    pub cost_ms: u64,
    pub content: String,
}

/// Destination for query telemetry records.
pub trait TelemetrySink: Send + Sync {
    fn slow_query(&self, record: &SlowQueryRecord) -> anyhow::Result<()>;

    fn sampled_query(&self, record: &SampledQueryRecord) -> anyhow::Result<()>;
}

/// Writes records as JSON on dedicated tracing targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn slow_query(&self, record: &SlowQueryRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        info!(target: SLOW_SQL_TARGET, record = %json, "Cost: {} ms, {}", record.cost_ms, record.content);
        Ok(())
    }

    fn sampled_query(&self, record: &SampledQueryRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        info!(target: SAMPLED_QUERIES_TARGET, record = %json);
        Ok(())
    }
}

/// Admission control for the sampled query log.
pub trait SamplingRateLimiter: Send + Sync {
    /// Try to admit a record costing `bytes`.
    fn try_acquire(&self, bytes: u64) -> bool;
}

/// Token bucket refilled continuously at a fixed byte rate.
///
/// A request is admitted whenever no earlier request is still being paid
/// off; its cost may put the bucket into debt. Stored credit is capped at one
/// second of refill.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    tokens_per_sec: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            capacity: rate,
            tokens_per_sec: rate,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.tokens_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

impl SamplingRateLimiter for TokenBucket {
    fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens < 0.0 {
            return false;
        }
        state.tokens -= bytes as f64;
        true
    }
}

/// Text recorded for a query: the request if given, else its SQL.
pub fn content_of_request(request: Option<&str>, sql: Option<&str>) -> String {
    request
        .or(sql)
        .unwrap_or(UNKNOWN_CONTENT)
        .to_string()
}
