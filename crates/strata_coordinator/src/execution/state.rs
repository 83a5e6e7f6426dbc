//! Lifecycle state shared by every execution kind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata_plan::QueryId;
use tracing::debug;

use crate::status::{Status, StatusCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Queued,
    Planned,
    Dispatching,
    Running,
    Finished,
    Failed,
    Canceled,
    Aborted,
}

impl ExecutionState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Canceled | Self::Aborted
        )
    }
}

#[derive(Debug)]
struct Inner {
    state: ExecutionState,
    failure: Option<Status>,
}

/// State machine with blocking waits; terminal states are final.
#[derive(Debug)]
pub struct ExecutionStateMachine {
    query_id: QueryId,
    inner: Mutex<Inner>,
    changed: Condvar,
    execution_time_ns: AtomicU64,
}

impl ExecutionStateMachine {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            inner: Mutex::new(Inner {
                state: ExecutionState::Queued,
                failure: None,
            }),
            changed: Condvar::new(),
            execution_time_ns: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.lock().state
    }

    pub fn transition_to_planned(&self) -> bool {
        self.transition(ExecutionState::Planned, None)
    }

    pub fn transition_to_dispatching(&self) -> bool {
        self.transition(ExecutionState::Dispatching, None)
    }

    pub fn transition_to_running(&self) -> bool {
        self.transition(ExecutionState::Running, None)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.transition(ExecutionState::Finished, None)
    }

    pub fn transition_to_failed(&self, status: Status) -> bool {
        self.transition(ExecutionState::Failed, Some(status))
    }

    pub fn transition_to_canceled(&self, status: Status) -> bool {
        self.transition(ExecutionState::Canceled, Some(status))
    }

    pub fn transition_to_aborted(&self, status: Status) -> bool {
        self.transition(ExecutionState::Aborted, Some(status))
    }

    /// Returns false when the machine was already done.
    fn transition(&self, next: ExecutionState, failure: Option<Status>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_done() {
            return false;
        }
        debug!(query_id = %self.query_id, from = ?inner.state, to = ?next, "execution state change");
        inner.state = next;
        if failure.is_some() {
            inner.failure = failure;
        }
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Block until `ready` holds for the state or `deadline` passes.
    pub fn wait_for(
        &self,
        deadline: Option<Instant>,
        ready: impl Fn(ExecutionState) -> bool,
    ) -> ExecutionState {
        let mut inner = self.inner.lock();
        while !ready(inner.state) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.changed.wait(&mut inner),
            }
        }
        inner.state
    }

    /// Status a caller sees for the current state.
    pub fn result_status(&self) -> Status {
        let inner = self.inner.lock();
        match inner.state {
            ExecutionState::Failed | ExecutionState::Canceled | ExecutionState::Aborted => {
                inner.failure.clone().unwrap_or_else(|| {
                    Status::error(StatusCode::InternalServerError, "execution failed")
                })
            }
            _ => Status::success(),
        }
    }

    pub fn record_execution_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.execution_time_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Accumulated recorded time in nanoseconds.
    pub fn total_execution_time(&self) -> i64 {
        i64::try_from(self.execution_time_ns.load(Ordering::Acquire)).unwrap_or(i64::MAX)
    }
}
