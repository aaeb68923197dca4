//! Background reclamation of sessions owned by terminated workers.
//!
//! The reaper runs on its own thread, driving a current-thread tokio
//! runtime so that its wait between passes is a timer raced against a
//! cancellation token. Cancellation always wins over a pending tick.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::RegistryInner;
use crate::config::MAX_REAPER_INTERVAL_MS;
use crate::error::StoreError;

/// Handle to the running reaper thread.
#[derive(Debug)]
pub(crate) struct Reaper {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Start the reaper thread.
    ///
    /// The interval must be nonzero and at most one day.
    pub(crate) fn spawn(inner: Arc<RegistryInner>, interval: Duration) -> Result<Self, StoreError> {
        if interval.is_zero() || interval > Duration::from_millis(MAX_REAPER_INTERVAL_MS) {
            return Err(StoreError::InvalidArgument(format!(
                "reaper interval must be between 1ms and {MAX_REAPER_INTERVAL_MS}ms, got {interval:?}"
            )));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("cachet-reaper".into())
            .spawn(move || runtime.block_on(run(inner, interval, token)))?;

        tracing::debug!(interval_ms = interval.as_millis() as u64, "Reaper started");

        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    /// Cancel the reaper and wait for its thread to exit.
    pub(crate) fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(inner: Arc<RegistryInner>, interval: Duration, cancel: CancellationToken) {
    let now = tokio::time::Instant::now();
    let start = now.checked_add(interval).unwrap_or(now);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reclaimed = inner.sweep();
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "Reaper pass reclaimed sessions");
                }
            }
        }
    }

    tracing::debug!("Reaper stopped");
}
