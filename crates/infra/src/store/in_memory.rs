use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use conductor_calls::{CallRecord, ReportRecord, RequestRecord};
use conductor_core::TaskId;

use super::{CallStore, CallStoreError};

/// In-memory call store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCallStore {
    records: RwLock<HashMap<TaskId, CallRecord>>,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored record, in no particular order.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.records
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> CallStoreError {
    CallStoreError::Storage("call store lock poisoned".to_string())
}

impl CallStore for InMemoryCallStore {
    fn put(
        &self,
        task_id: TaskId,
        request: RequestRecord,
        report: ReportRecord,
    ) -> Result<(), CallStoreError> {
        if report.task_id != task_id {
            return Err(CallStoreError::TaskIdMismatch {
                expected: task_id,
                found: report.task_id,
            });
        }
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(task_id, CallRecord::new(report, request));
        Ok(())
    }

    fn get(&self, task_id: TaskId) -> Result<Option<CallRecord>, CallStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&task_id).cloned())
    }

    fn list_non_terminal(&self) -> Result<Vec<CallRecord>, CallStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>, CallStoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut expired: Vec<TaskId> = records
            .values()
            .filter(|r| {
                r.is_terminal()
                    && !r.is_archived()
                    && r.finish_time().is_some_and(|t| t < cutoff)
            })
            .map(CallRecord::task_id)
            .collect();
        expired.sort();
        Ok(expired)
    }

    fn delete(&self, task_id: TaskId) -> Result<(), CallStoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.remove(&task_id);
        Ok(())
    }
}
