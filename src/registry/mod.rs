//! Per-worker session registry.
//!
//! Hands out one [`Session`] per worker, keyed by [`WorkerId`] in a
//! sharded concurrent map so unrelated workers never serialize on a
//! global lock. Sessions of workers whose tokens have all been dropped
//! are closed and removed by the [`reaper`] on its next pass.
//!
//! Each session sits behind its own mutex. Only the owning worker
//! locks it in practice; the reaper locks it only after the worker is
//! gone, so that lock is never contended.

pub mod reaper;
pub mod worker;

pub use worker::{WorkerId, WorkerToken};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::storage::pool::SessionFactory;
use crate::storage::session::Session;
use reaper::Reaper;
use worker::LivenessWatch;

/// Shared, lockable handle to a worker's session.
pub type SessionHandle = Arc<Mutex<Session>>;

struct Slot {
    liveness: LivenessWatch,
    session: SessionHandle,
}

/// State shared between the registry and its reaper.
pub(crate) struct RegistryInner {
    slots: DashMap<WorkerId, Slot>,
    factory: RwLock<Option<SessionFactory>>,
}

impl RegistryInner {
    /// Close and remove the sessions of every dead worker.
    ///
    /// Candidates are collected first so no shard lock is held while a
    /// session is closed. Removal re-checks liveness under the shard lock.
    pub(crate) fn sweep(&self) -> usize {
        let dead: Vec<WorkerId> = self
            .slots
            .iter()
            .filter(|slot| !slot.liveness.is_alive())
            .map(|slot| *slot.key())
            .collect();

        let mut reclaimed = 0;
        for id in dead {
            if let Some((_, slot)) = self
                .slots
                .remove_if(&id, |_, slot| !slot.liveness.is_alive())
            {
                slot.session.lock().close();
                reclaimed += 1;
                tracing::debug!(worker = %id, "Reclaimed session of terminated worker");
            }
        }
        reclaimed
    }
}

/// Owns the session factory and every live worker session.
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
    reaper: Mutex<Option<Reaper>>,
    closed: AtomicBool,
}

impl SessionRegistry {
    /// Create a registry and start its reaper.
    pub fn new(factory: SessionFactory, reaper_interval: Duration) -> Result<Self, StoreError> {
        let inner = Arc::new(RegistryInner {
            slots: DashMap::new(),
            factory: RwLock::new(Some(factory)),
        });
        let reaper = Reaper::spawn(Arc::clone(&inner), reaper_interval)?;

        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
            closed: AtomicBool::new(false),
        })
    }

    /// Session of the given worker, opening one on first use.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::Closed`] once the registry has been
    /// shut down.
    pub fn acquire(&self, worker: &WorkerToken) -> Result<SessionHandle, StoreError> {
        if let Some(slot) = self.inner.slots.get(&worker.id()) {
            return Ok(Arc::clone(&slot.session));
        }

        let session = {
            let factory = self.inner.factory.read();
            (*factory).as_ref().ok_or(StoreError::Closed)?.open_session()
        };
        let session_id = session.id();
        let handle = Arc::new(Mutex::new(session));

        // Clones of one token may race here; the first insert wins and
        // the loser's session closes when dropped.
        let slot = self
            .inner
            .slots
            .entry(worker.id())
            .or_insert_with(|| Slot {
                liveness: worker.watch(),
                session: Arc::clone(&handle),
            });

        tracing::debug!(worker = %worker.id(), session = %session_id, "Opened session");
        Ok(Arc::clone(&slot.session))
    }

    /// Run one reclamation pass now. Returns the number of sessions closed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of sessions currently registered.
    pub fn live_sessions(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the reaper, close every session, then close the factory.
    ///
    /// Must not race with in-flight `acquire` calls. Calling it again
    /// is a no-op.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.shutdown_with(|_| Ok(()))
    }

    /// As [`shutdown`](Self::shutdown), running `teardown` against the
    /// factory after the sessions are closed and before it is dropped.
    pub fn shutdown_with<F>(&self, teardown: F) -> Result<(), StoreError>
    where
        F: FnOnce(&SessionFactory) -> Result<(), StoreError>,
    {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut reaper) = self.reaper.lock().take() {
            reaper.stop();
        }

        let ids: Vec<WorkerId> = self.inner.slots.iter().map(|slot| *slot.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, slot)) = self.inner.slots.remove(&id) {
                slot.session.lock().close();
                closed += 1;
            }
        }

        let factory = self.inner.factory.write().take();
        let result = match &factory {
            Some(factory) => teardown(factory),
            None => Ok(()),
        };
        drop(factory);

        tracing::info!(sessions_closed = closed, "Session registry shut down");
        result
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Session registry shutdown failed");
        }
    }
}
