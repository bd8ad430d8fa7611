//! Worker pools: where admitted calls actually run.
//!
//! The dispatcher hands each admitted call to a [`WorkerPool`] as an
//! [`Execution`]. The execution owns everything needed to run the callable and
//! a [`ReportHandle`] through which progress and exactly one outcome flow back.

mod manual;
mod thread_pool;

pub use manual::ManualWorkerPool;
pub use thread_pool::{PoolStats, ThreadPoolConfig, ThreadWorkerPool};

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use conductor_calls::{CallContext, CallFailure, Callable, CallableRef, ProgressSink};
use conductor_core::{JobId, TaskId, Value};

/// Executes admitted calls.
pub trait WorkerPool: Send + Sync {
    /// Accept an execution. Refusal fails the call.
    fn execute(&self, execution: Execution) -> Result<(), WorkerPoolError>;
}

impl<T> WorkerPool for Arc<T>
where
    T: WorkerPool + ?Sized,
{
    fn execute(&self, execution: Execution) -> Result<(), WorkerPoolError> {
        (**self).execute(execution)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("worker pool refused execution: {0}")]
    Refused(String),
}

/// Terminal outcome produced by running a callable.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Succeeded(Value),
    Failed(CallFailure),
}

/// Dispatcher side of a [`ReportHandle`].
pub(crate) trait OutcomeSink: Send + Sync {
    fn progress(&self, task_id: TaskId, key: String, value: Value);

    fn cancel_requested(&self, task_id: TaskId) -> bool;

    fn finish(&self, task_id: TaskId, outcome: CallOutcome);
}

/// A worker's only way back into the dispatcher.
///
/// Holds a weak reference: once the dispatcher is gone, progress and outcomes
/// are dropped. Consumed by [`succeed`](Self::succeed)/[`fail`](Self::fail).
pub struct ReportHandle {
    task_id: TaskId,
    job_id: JobId,
    sink: Weak<dyn OutcomeSink>,
}

impl ReportHandle {
    pub(crate) fn new(task_id: TaskId, job_id: JobId, sink: Weak<dyn OutcomeSink>) -> Self {
        Self {
            task_id,
            job_id,
            sink,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn progress(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.progress(self.task_id, key.into(), value.into());
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.sink
            .upgrade()
            .is_some_and(|sink| sink.cancel_requested(self.task_id))
    }

    pub fn succeed(self, result: Value) {
        self.finish(CallOutcome::Succeeded(result));
    }

    pub fn fail(self, failure: CallFailure) {
        self.finish(CallOutcome::Failed(failure));
    }

    pub fn finish(self, outcome: CallOutcome) {
        if let Some(sink) = self.sink.upgrade() {
            sink.finish(self.task_id, outcome);
        }
    }

    /// Context for the callable; shares this handle's progress channel.
    pub fn context(&self) -> CallContext {
        let sink: Arc<dyn ProgressSink> = Arc::new(ContextSink {
            sink: self.sink.clone(),
        });
        CallContext::new(self.task_id, self.job_id, sink)
    }
}

impl fmt::Debug for ReportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportHandle")
            .field("task_id", &self.task_id)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

struct ContextSink {
    sink: Weak<dyn OutcomeSink>,
}

impl ProgressSink for ContextSink {
    fn progress(&self, task_id: TaskId, key: String, value: Value) {
        if let Some(sink) = self.sink.upgrade() {
            sink.progress(task_id, key, value);
        }
    }

    fn cancel_requested(&self, task_id: TaskId) -> bool {
        self.sink
            .upgrade()
            .is_some_and(|sink| sink.cancel_requested(task_id))
    }
}

/// One admitted call, ready to run on any thread.
pub struct Execution {
    callable_name: CallableRef,
    callable: Callable,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    handle: ReportHandle,
}

impl Execution {
    pub(crate) fn new(
        callable_name: CallableRef,
        callable: Callable,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        handle: ReportHandle,
    ) -> Self {
        Self {
            callable_name,
            callable,
            args,
            kwargs,
            handle,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.handle.task_id
    }

    pub fn callable_name(&self) -> &CallableRef {
        &self.callable_name
    }

    /// Run the callable and deliver its outcome. A panic becomes a failure.
    ///
    /// Returns whether the callable succeeded.
    pub fn run(self) -> bool {
        let Execution {
            callable_name,
            callable,
            args,
            kwargs,
            handle,
        } = self;
        let ctx = handle.context();

        let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
            callable(&ctx, args.as_slice(), &kwargs)
        }));
        let outcome = match invoked {
            Ok(Ok(value)) => CallOutcome::Succeeded(value),
            Ok(Err(failure)) => CallOutcome::Failed(failure),
            Err(payload) => CallOutcome::Failed(
                CallFailure::new(format!("callable panicked: {}", panic_message(&*payload)))
                    .with_frame(format!("in {callable_name}")),
            ),
        };

        let succeeded = matches!(outcome, CallOutcome::Succeeded(_));
        handle.finish(outcome);
        succeeded
    }

    /// Give up the execution without running it, keeping the handle so the
    /// caller can still report an outcome.
    pub fn into_handle(self) -> ReportHandle {
        self.handle
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("task_id", &self.handle.task_id)
            .field("callable", &self.callable_name)
            .field("args", &self.args.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
