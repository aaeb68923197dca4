//! Worker identity and liveness.
//!
//! A [`WorkerToken`] identifies one unit of work to the session
//! registry. The worker counts as alive for as long as any clone of its
//! token exists; once the last clone is dropped the reaper reclaims the
//! worker's session on its next pass.

use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Unique worker identity (UUIDv7, time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Uuid);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct Alive;

/// Identity token passed to every store operation.
#[derive(Debug, Clone)]
pub struct WorkerToken {
    id: WorkerId,
    alive: Arc<Alive>,
}

thread_local! {
    static CURRENT: WorkerToken = WorkerToken::new();
}

impl WorkerToken {
    pub fn new() -> Self {
        Self {
            id: WorkerId(Uuid::now_v7()),
            alive: Arc::new(Alive),
        }
    }

    /// Token of the calling thread.
    ///
    /// The thread's own copy is dropped when the thread exits, so a
    /// thread that does not hold on to the returned clone has its
    /// session reclaimed after it terminates.
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn watch(&self) -> LivenessWatch {
        LivenessWatch(Arc::downgrade(&self.alive))
    }
}

impl Default for WorkerToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes whether a worker's token still exists.
#[derive(Debug, Clone)]
pub(crate) struct LivenessWatch(Weak<Alive>);

impl LivenessWatch {
    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}
