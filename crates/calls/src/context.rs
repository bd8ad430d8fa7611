//! What a running callable sees: its ids, a progress channel and a cancel flag.

use std::fmt;
use std::sync::Arc;

use conductor_core::{JobId, TaskId, Value};

/// Receiver of progress emitted by running callables.
///
/// Implemented by the dispatcher's report handle; callables never touch the
/// dispatcher directly.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, task_id: TaskId, key: String, value: Value);

    fn cancel_requested(&self, task_id: TaskId) -> bool;
}

/// Execution context handed to a callable.
#[derive(Clone)]
pub struct CallContext {
    task_id: TaskId,
    job_id: JobId,
    sink: Arc<dyn ProgressSink>,
}

impl CallContext {
    pub fn new(task_id: TaskId, job_id: JobId, sink: Arc<dyn ProgressSink>) -> Self {
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

    /// Publish a progress payload under `key`. Updates are delivered in call order.
    pub fn report_progress(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.sink.progress(self.task_id, key.into(), value.into());
    }

    /// Whether the call was canceled; long-running callables should poll this.
    pub fn is_canceled(&self) -> bool {
        self.sink.cancel_requested(self.task_id)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("task_id", &self.task_id)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Failure raised by a callable, captured into the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub exception: String,
    pub traceback: Vec<String>,
}

impl CallFailure {
    pub fn new(exception: impl Into<String>) -> Self {
        Self {
            exception: exception.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.traceback.push(frame.into());
        self
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.exception)
    }
}

impl<E: std::error::Error> From<E> for CallFailure {
    fn from(err: E) -> Self {
        let mut failure = CallFailure::new(err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            failure.traceback.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        failure
    }
}
