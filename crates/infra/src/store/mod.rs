//! Durable call records.
//!
//! One document per call, keyed by task id. The dispatcher writes through this
//! seam on every transition and reads it back on start.

mod in_memory;

pub use in_memory::InMemoryCallStore;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use conductor_calls::{CallRecord, ReportRecord, RequestRecord};
use conductor_core::TaskId;

/// Call store abstraction.
pub trait CallStore: Send + Sync {
    /// Insert or replace the record for `task_id`.
    fn put(
        &self,
        task_id: TaskId,
        request: RequestRecord,
        report: ReportRecord,
    ) -> Result<(), CallStoreError>;

    fn get(&self, task_id: TaskId) -> Result<Option<CallRecord>, CallStoreError>;

    /// Every record whose state is `waiting` or `running`.
    fn list_non_terminal(&self) -> Result<Vec<CallRecord>, CallStoreError>;

    /// Non-archived terminal records finished before `cutoff`.
    fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>, CallStoreError>;

    /// Remove a record. Deleting a missing record is not an error.
    fn delete(&self, task_id: TaskId) -> Result<(), CallStoreError>;
}

/// Call store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallStoreError {
    #[error("record for {expected} carries task id {found}")]
    TaskIdMismatch { expected: TaskId, found: TaskId },
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> CallStore for Arc<T>
where
    T: CallStore + ?Sized,
{
    fn put(
        &self,
        task_id: TaskId,
        request: RequestRecord,
        report: ReportRecord,
    ) -> Result<(), CallStoreError> {
        (**self).put(task_id, request, report)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<CallRecord>, CallStoreError> {
        (**self).get(task_id)
    }

    fn list_non_terminal(&self) -> Result<Vec<CallRecord>, CallStoreError> {
        (**self).list_non_terminal()
    }

    fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>, CallStoreError> {
        (**self).list_expired(cutoff)
    }

    fn delete(&self, task_id: TaskId) -> Result<(), CallStoreError> {
        (**self).delete(task_id)
    }
}
