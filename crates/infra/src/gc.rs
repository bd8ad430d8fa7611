//! Retention: removal of finished calls.

use std::sync::{Arc, mpsc};
use std::thread;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::store::CallStore;
use crate::worker::WorkerPool;

/// Handle to a running collector thread.
#[derive(Debug)]
pub struct CollectorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl CollectorHandle {
    /// Request shutdown and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl<S, P> Dispatcher<S, P>
where
    S: CallStore + 'static,
    P: WorkerPool + 'static,
{
    /// Delete non-archived terminal calls that finished more than `retention`
    /// ago. Archived calls stay in the store but leave memory.
    ///
    /// Returns the number of deleted records.
    pub fn collect_garbage(&self) -> Result<usize, DispatchError> {
        let shared = &self.shared;
        let cutoff = chrono::Duration::from_std(shared.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let mut guard = shared.lock();
        let expired = shared.store.list_expired(cutoff)?;
        for task_id in &expired {
            shared.store.delete(*task_id)?;
            guard.calls.remove(task_id);
        }
        guard.calls.retain(|_, entry| {
            !(entry.report.is_terminal() && entry.report.finish_time().is_some_and(|t| t < cutoff))
        });

        if !expired.is_empty() {
            info!(collected = expired.len(), cutoff = %cutoff, "collected expired calls");
        }
        Ok(expired.len())
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `collect_interval`
    /// on a background thread. The thread exits on shutdown or once the
    /// dispatcher is dropped.
    pub fn spawn_collector(&self) -> std::io::Result<CollectorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let interval = self.shared.config.collect_interval;
        let weak = Arc::downgrade(&self.shared);

        let join = thread::Builder::new()
            .name("conductor-collector".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "call collector started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    match (Dispatcher { shared }).collect_garbage() {
                        Ok(n) => debug!(collected = n, "collector pass"),
                        Err(e) => error!(error = %e, "collector pass failed"),
                    }
                }
                info!("call collector stopped");
            })?;

        Ok(CollectorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}
