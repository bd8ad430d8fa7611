//! Start-up: rebuild the dispatcher's view from the call store.
//!
//! Every non-terminal record left by a previous process is decoded and
//! re-submitted in original submission order, so FIFO admission holds across
//! restarts. Records that can no longer be decoded (callable renamed, hook
//! removed, corrupt document) are logged and left out; they stay in the store
//! untouched for an operator to inspect.

use std::sync::Arc;

use tracing::{info, warn};

use conductor_calls::{CallRegistry, codec};
use conductor_core::{CallError, TaskId};

use crate::config::DispatchConfig;
use crate::dispatcher::{CallEntry, DispatchError, Dispatcher};
use crate::store::CallStore;
use crate::worker::WorkerPool;

/// What [`Dispatcher::start`] did with the stored calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Re-submitted calls, in submission order.
    pub resumed: Vec<TaskId>,
    /// Calls left out because their record could not be decoded.
    pub dropped: Vec<DroppedCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedCall {
    pub task_id: TaskId,
    pub error: CallError,
}

impl<S, P> Dispatcher<S, P>
where
    S: CallStore + 'static,
    P: WorkerPool + 'static,
{
    /// Build a dispatcher over `store` and resume every unfinished call it holds.
    ///
    /// Only a failure to list the store is fatal; individual bad records are
    /// reported in [`RecoveryReport::dropped`].
    pub fn start(
        store: S,
        pool: P,
        registry: Arc<CallRegistry>,
        config: DispatchConfig,
    ) -> Result<(Self, RecoveryReport), DispatchError> {
        let mut records = store.list_non_terminal()?;
        records.sort_by_key(|r| (r.submit_time(), r.task_id()));

        let dispatcher = Self::new(store, pool, registry, config);
        let shared = &dispatcher.shared;
        let mut recovery = RecoveryReport::default();
        let mut executions = Vec::new();

        {
            let mut guard = shared.lock();
            let state = &mut *guard;

            for record in records {
                let task_id = record.task_id();
                let decoded =
                    codec::decode(record, &shared.registry).and_then(|(request, mut report)| {
                        report.reset_for_resubmission()?;
                        Ok((request, report))
                    });
                let (request, report) = match decoded {
                    Ok(call) => call,
                    Err(error) => {
                        warn!(task_id = %task_id, error = %error, "dropping unrecoverable call");
                        recovery.dropped.push(DroppedCall { task_id, error });
                        continue;
                    }
                };

                let entry = state
                    .calls
                    .entry(task_id)
                    .or_insert(CallEntry::new(request, report));
                let admission = state.coordinator.request(
                    task_id,
                    entry.request.resources(),
                    entry.request.weight(),
                );
                shared.apply_admission(entry, admission, &mut executions);
                recovery.resumed.push(task_id);
            }
        }

        info!(
            resumed = recovery.resumed.len(),
            dropped = recovery.dropped.len(),
            "recovery complete"
        );
        shared.launch(executions);
        Ok((dispatcher, recovery))
    }
}
