//! Runtime side of call dispatch: resource coordination, the dispatcher and
//! its recovery loop, durable stores and worker pools.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod gc;
pub mod recovery;
pub mod store;
pub mod watch;
pub mod worker;


pub use config::DispatchConfig;
pub use coordinator::{Admission, ResourceBudgets, ResourceCoordinator};
pub use dispatcher::{CancelOutcome, DispatchError, Dispatcher, DispatcherStats, Submission};
pub use gc::CollectorHandle;
pub use recovery::{DroppedCall, RecoveryReport};
pub use store::{CallStore, CallStoreError, InMemoryCallStore};
pub use watch::{ReportEvent, Subscription};
pub use worker::{
    CallOutcome, Execution, ManualWorkerPool, PoolStats, ReportHandle, ThreadPoolConfig,
    ThreadWorkerPool, WorkerPool, WorkerPoolError,
};
