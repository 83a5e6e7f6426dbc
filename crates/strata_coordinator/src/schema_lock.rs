//! Shared schema lock held by planners while they read schema metadata.
//!
//! Planners take the read lock on behalf of a [`QueryContext`]; the coordinator
//! releases it when the operation returns. Schema mutations take the write lock,
//! which waits for every reader to leave.

use parking_lot::{Condvar, Mutex};

use crate::context::QueryContext;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// Reader/writer lock whose read side is owned by query contexts, not threads.
#[derive(Debug, Default)]
pub struct SchemaLockManager {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl SchemaLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the read lock for `context`. A context holds it at most once.
    pub fn take_read_lock(&self, context: &QueryContext) {
        if context.holds_schema_read_lock() {
            return;
        }
        let mut state = self.state.lock();
        while state.writer {
            self.changed.wait(&mut state);
        }
        state.readers += 1;
        context.mark_schema_read_lock();
    }

    /// Release the read lock if `context` holds it; a missing context is a no-op.
    pub fn release_read_lock(&self, context: Option<&QueryContext>) {
        let Some(context) = context else {
            return;
        };
        if !context.take_schema_read_lock() {
            return;
        }
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.changed.notify_all();
        }
    }

    /// Block until no reader or writer remains, then hold the write lock.
    pub fn take_write_lock(&self) -> SchemaWriteGuard<'_> {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.changed.wait(&mut state);
        }
        state.writer = true;
        SchemaWriteGuard { manager: self }
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }
}

/// Releases the schema write lock on drop.
#[derive(Debug)]
pub struct SchemaWriteGuard<'a> {
    manager: &'a SchemaLockManager,
}

impl Drop for SchemaWriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        state.writer = false;
        self.manager.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FrontEndMemoryPool, SessionInfo};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use strata_plan::{Endpoint, QueryId};

    fn context(counter: u64) -> QueryContext {
        QueryContext::new(
            "",
            QueryId::new(0, counter),
            SessionInfo::default(),
            Endpoint::new("127.0.0.1", 10740),
            Endpoint::new("127.0.0.1", 10730),
            Instant::now(),
            Duration::from_secs(1),
            Arc::new(FrontEndMemoryPool::new(0)),
        )
    }

    #[test]
    fn read_lock_is_released_once_per_context() {
        let manager = SchemaLockManager::new();
        let first = context(1);
        let second = context(2);
        manager.take_read_lock(&first);
        manager.take_read_lock(&first);
        manager.take_read_lock(&second);
        assert_eq!(manager.reader_count(), 2);

        manager.release_read_lock(Some(&first));
        manager.release_read_lock(Some(&first));
        assert_eq!(manager.reader_count(), 1);
        manager.release_read_lock(None);
        manager.release_read_lock(Some(&second));
        assert_eq!(manager.reader_count(), 0);
    }

    #[test]
    fn writer_waits_for_readers() {
        let manager = Arc::new(SchemaLockManager::new());
        let reader = Arc::new(context(1));
        manager.take_read_lock(&reader);

        let acquired = Arc::new(AtomicBool::new(false));
        let writer = {
            let manager = manager.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let _guard = manager.take_write_lock();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        manager.release_read_lock(Some(&reader));
        writer.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
