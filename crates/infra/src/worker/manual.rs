use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use conductor_core::TaskId;

use super::{Execution, WorkerPool, WorkerPoolError};

/// Pool that only collects executions; the owner decides when (and whether)
/// they run. For tests and step-by-step debugging.
#[derive(Debug, Default)]
pub struct ManualWorkerPool {
    pending: Mutex<VecDeque<Execution>>,
    closed: AtomicBool,
}

impl ManualWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every later execution.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Task ids of collected executions, oldest first.
    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.queue().iter().map(Execution::task_id).collect()
    }

    pub fn take_next(&self) -> Option<Execution> {
        self.queue().pop_front()
    }

    pub fn take(&self, task_id: TaskId) -> Option<Execution> {
        let mut queue = self.queue();
        let idx = queue.iter().position(|e| e.task_id() == task_id)?;
        queue.remove(idx)
    }

    /// Run the oldest execution on the calling thread.
    pub fn run_next(&self) -> Option<TaskId> {
        let execution = self.take_next()?;
        let task_id = execution.task_id();
        execution.run();
        Some(task_id)
    }

    /// Run until empty, including executions admitted along the way.
    pub fn run_all(&self) -> Vec<TaskId> {
        let mut ran = Vec::new();
        while let Some(task_id) = self.run_next() {
            ran.push(task_id);
        }
        ran
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Execution>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl WorkerPool for ManualWorkerPool {
    fn execute(&self, execution: Execution) -> Result<(), WorkerPoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerPoolError::ShutDown);
        }
        self.queue().push_back(execution);
        Ok(())
    }
}
