//! Call dispatcher: admission, execution and lifecycle of asynchronous calls.
//!
//! ## Submission Flow
//!
//! ```text
//! CallRequest
//!   ↓
//! 1. New report in `waiting`, `enqueue` hooks fire
//!   ↓
//! 2. Encode request + report (an encode failure aborts; nothing is stored)
//!   ↓
//! 3. Persist
//!   ↓
//! 4. Resource coordinator decides: accepted / postponed / rejected
//!   ↓
//! 5. Persist again; accepted calls are handed to the worker pool
//! ```
//!
//! Outcomes, progress and cancellations come back through the same lock, so
//! every admission and release is atomic with respect to every other one.
//!
//! ## Locking
//!
//! One mutex guards the coordinator and the in-memory call set. Lifecycle and
//! control hooks run while it is held and must not call back into the
//! dispatcher. Executions are handed to the pool only after the lock is
//! released, so a pool may run them inline.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use conductor_calls::codec;
use conductor_calls::{
    CallContext, CallFailure, CallRegistry, CallReport, CallRequest, CallState, Callable,
    ControlOperation, HookRef, LifecycleEvent, Response,
};
use conductor_core::{CallError, JobId, TaskId, Value};

use crate::config::DispatchConfig;
use crate::coordinator::{Admission, ResourceCoordinator};
use crate::store::{CallStore, CallStoreError};
use crate::watch::{ReportEvent, Subscription};
use crate::worker::{CallOutcome, Execution, OutcomeSink, ReportHandle, WorkerPool, panic_message};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("call not found: {0}")]
    NotFound(TaskId),
    #[error("call {0} has no cancel hook")]
    NotCancelable(TaskId),
    #[error("cancel hook for call {task_id} failed: {reason}")]
    CancelHookFailed { task_id: TaskId, reason: String },
    #[error("callable not registered: {0}")]
    UnregisteredCallable(String),
    #[error("hook not registered: {0}")]
    UnregisteredHook(String),
    #[error("call {0} already finished")]
    AlreadyFinished(TaskId),
    #[error("dispatcher is shut down")]
    ShutDown,
    #[error(transparent)]
    Store(#[from] CallStoreError),
}

/// What `submit` hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Asynchronous call handed off; running or postponed.
    Queued(CallReport),
    /// The call reached a terminal state before `submit` returned.
    Finished(CallReport),
    /// A synchronous call was still unfinished when the wait timed out.
    TimedOut(CallReport),
}

impl Submission {
    pub fn report(&self) -> &CallReport {
        match self {
            Submission::Queued(r) | Submission::Finished(r) | Submission::TimedOut(r) => r,
        }
    }

    pub fn into_report(self) -> CallReport {
        match self {
            Submission::Queued(r) | Submission::Finished(r) | Submission::TimedOut(r) => r,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.report().task_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The call was already terminal; nothing changed.
    AlreadyFinished,
}

/// Snapshot of the in-memory call set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub waiting: usize,
    pub running: usize,
    pub finished: usize,
}

pub(crate) struct CallEntry {
    pub(crate) request: CallRequest,
    pub(crate) report: CallReport,
    watchers: Vec<mpsc::Sender<ReportEvent>>,
}

impl CallEntry {
    pub(crate) fn new(request: CallRequest, report: CallReport) -> Self {
        Self {
            request,
            report,
            watchers: Vec::new(),
        }
    }

    fn publish(&mut self, event: ReportEvent) {
        let closes = matches!(event, ReportEvent::StateChanged(s) if s.is_terminal());
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
        if closes {
            self.watchers.clear();
        }
    }
}

pub(crate) struct DispatchState {
    pub(crate) coordinator: ResourceCoordinator,
    pub(crate) calls: HashMap<TaskId, CallEntry>,
    accepting: bool,
}

pub(crate) struct Shared<S, P> {
    me: Weak<Shared<S, P>>,
    state: Mutex<DispatchState>,
    changed: Condvar,
    pub(crate) store: S,
    pool: P,
    pub(crate) registry: Arc<CallRegistry>,
    pub(crate) config: DispatchConfig,
}

/// Entry point for submitting and controlling calls.
///
/// Cheap to clone; clones share one dispatcher.
///
/// ## Generic Parameters
///
/// - `S`: durable call store
/// - `P`: worker pool that runs admitted calls
pub struct Dispatcher<S, P> {
    pub(crate) shared: Arc<Shared<S, P>>,
}

impl<S, P> Clone for Dispatcher<S, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S, P> fmt::Debug for Dispatcher<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.shared.registry)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<S, P> Dispatcher<S, P>
where
    S: CallStore + 'static,
    P: WorkerPool + 'static,
{
    /// Empty dispatcher; [`start`](Self::start) is the public constructor.
    pub(crate) fn new(
        store: S,
        pool: P,
        registry: Arc<CallRegistry>,
        config: DispatchConfig,
    ) -> Self {
        let coordinator = ResourceCoordinator::new(config.budgets());
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            state: Mutex::new(DispatchState {
                coordinator,
                calls: HashMap::new(),
                accepting: true,
            }),
            changed: Condvar::new(),
            store,
            pool,
            registry,
            config,
        });
        Self { shared }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    /// Submit a call.
    ///
    /// Asynchronous requests return as soon as admission is decided.
    /// Synchronous ones block until the call is terminal or the configured
    /// `sync_wait_timeout` elapses.
    pub fn submit(&self, request: CallRequest) -> Result<Submission, DispatchError> {
        self.submit_waiting(request, self.shared.config.sync_wait_timeout)
    }

    /// Like [`submit`](Self::submit) with an explicit wait for synchronous calls.
    pub fn submit_with_timeout(
        &self,
        request: CallRequest,
        timeout: Duration,
    ) -> Result<Submission, DispatchError> {
        self.submit_waiting(request, Some(timeout))
    }

    fn submit_waiting(
        &self,
        request: CallRequest,
        timeout: Option<Duration>,
    ) -> Result<Submission, DispatchError> {
        let synchronous = !request.asynchronous();
        let task_id = TaskId::new();
        let report = self.enqueue(request, task_id, JobId::for_task(task_id))?;

        if report.is_terminal() {
            return Ok(Submission::Finished(report));
        }
        if synchronous {
            return self.wait(task_id, timeout);
        }
        Ok(Submission::Queued(report))
    }

    /// Submit several calls as one job. Every call is dispatched asynchronously
    /// and shares the returned job id.
    ///
    /// All requests are validated before any is submitted.
    pub fn submit_job(
        &self,
        requests: Vec<CallRequest>,
    ) -> Result<(JobId, Vec<CallReport>), DispatchError> {
        for request in &requests {
            self.shared.check_registered(request)?;
            codec::encode_request(request)?;
        }

        let job_id = JobId::new();
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            reports.push(self.enqueue(request, TaskId::new(), job_id)?);
        }
        info!(job_id = %job_id, calls = reports.len(), "job submitted");
        Ok((job_id, reports))
    }

    fn enqueue(
        &self,
        request: CallRequest,
        task_id: TaskId,
        job_id: JobId,
    ) -> Result<CallReport, DispatchError> {
        let shared = &self.shared;
        shared.check_registered(&request)?;

        let mut executions = Vec::new();
        let snapshot = {
            let mut guard = shared.lock();
            let state = &mut *guard;
            if !state.accepting {
                return Err(DispatchError::ShutDown);
            }

            let mut report = CallReport::new(task_id, job_id);
            report.mark_submitted(Utc::now());
            let entry = CallEntry::new(request, report);

            let record = codec::encode(&entry.request, &entry.report)?;
            shared.store.put(task_id, record.request, record.report)?;
            shared.fire(&entry, LifecycleEvent::Enqueue);
            info!(
                task_id = %task_id,
                job_id = %job_id,
                callable = %entry.request.callable(),
                "call submitted"
            );

            let entry = state.calls.entry(task_id).or_insert(entry);
            let admission =
                state
                    .coordinator
                    .request(task_id, entry.request.resources(), entry.request.weight());
            shared.apply_admission(entry, admission, &mut executions);
            entry.report.clone()
        };

        if snapshot.is_terminal() {
            shared.changed.notify_all();
        }
        shared.launch(executions);
        Ok(snapshot)
    }

    /// Block until `task_id` is terminal or `timeout` elapses.
    ///
    /// `None` waits indefinitely.
    pub fn wait(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<Submission, DispatchError> {
        let shared = &self.shared;
        let guard = shared.lock();
        if !guard.calls.contains_key(&task_id) {
            drop(guard);
            let report = shared.stored_report(task_id)?;
            return Ok(if report.is_terminal() {
                Submission::Finished(report)
            } else {
                Submission::Queued(report)
            });
        }

        let unfinished = move |state: &mut DispatchState| {
            state
                .calls
                .get(&task_id)
                .is_some_and(|e| !e.report.is_terminal())
        };
        let guard = match timeout {
            None => shared
                .changed
                .wait_while(guard, unfinished)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                shared
                    .changed
                    .wait_timeout_while(guard, timeout, unfinished)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };

        match guard.calls.get(&task_id) {
            Some(entry) if entry.report.is_terminal() => {
                Ok(Submission::Finished(entry.report.clone()))
            }
            Some(entry) => {
                debug!(task_id = %task_id, "wait timed out");
                Ok(Submission::TimedOut(entry.report.clone()))
            }
            None => {
                drop(guard);
                Ok(Submission::Finished(shared.stored_report(task_id)?))
            }
        }
    }

    /// Cancel a call through its cancel control hook.
    ///
    /// A waiting call leaves the queue; a running one gives up its grants and
    /// its callable sees [`CallContext::is_canceled`](conductor_calls::CallContext::is_canceled).
    /// Canceling a terminal call is a no-op.
    pub fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, DispatchError> {
        let shared = &self.shared;
        let mut executions = Vec::new();
        {
            let mut guard = shared.lock();
            let state = &mut *guard;
            let Some(entry) = state.calls.get_mut(&task_id) else {
                return match shared.store.get(task_id)? {
                    Some(record) if record.is_terminal() => Ok(CancelOutcome::AlreadyFinished),
                    _ => Err(DispatchError::NotFound(task_id)),
                };
            };
            if entry.report.is_terminal() {
                debug!(
                    task_id = %task_id,
                    state = %entry.report.state(),
                    "cancel of finished call ignored"
                );
                return Ok(CancelOutcome::AlreadyFinished);
            }

            let cancel_hook = entry.request.control_hooks().get(ControlOperation::Cancel);
            let Some(hook_ref) = cancel_hook.cloned() else {
                return Err(DispatchError::NotCancelable(task_id));
            };
            let Some(hook) = shared.registry.control_hook(&hook_ref) else {
                return Err(DispatchError::UnregisteredHook(hook_ref.to_string()));
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                hook(ControlOperation::Cancel, &entry.report)
            }));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(reason),
                Err(payload) => Some(format!("cancel hook panicked: {}", panic_message(&*payload))),
            };
            if let Some(reason) = failure {
                warn!(task_id = %task_id, hook = %hook_ref, error = %reason, "cancel hook failed");
                return Err(DispatchError::CancelHookFailed { task_id, reason });
            }

            let was_running = entry.report.state() == CallState::Running;
            entry.report.mark_canceled(Utc::now())?;
            info!(task_id = %task_id, was_running, "call canceled");
            if !was_running {
                shared.fire(entry, LifecycleEvent::Dequeue);
            }
            shared.fire(entry, LifecycleEvent::Cancel);
            shared.fire(entry, LifecycleEvent::Complete);
            entry.publish(ReportEvent::StateChanged(CallState::Canceled));
            shared.persist_logged(entry);

            shared.release(state, task_id, was_running, &mut executions);
        }

        shared.changed.notify_all();
        shared.launch(executions);
        Ok(CancelOutcome::Canceled)
    }

    /// Attach a lifecycle hook (by registered name) to a live call.
    pub fn register_hook(
        &self,
        task_id: TaskId,
        event: &str,
        hook: &str,
    ) -> Result<(), DispatchError> {
        let event: LifecycleEvent = event.parse()?;
        let hook = HookRef::new(hook)?;
        if !self.shared.registry.has_lifecycle_hook(&hook) {
            return Err(DispatchError::UnregisteredHook(hook.to_string()));
        }

        self.shared.with_open_call(task_id, |entry| {
            entry.request.add_lifecycle_hook(event, hook);
        })
    }

    /// Set a control hook (by registered name) on a live call; replaces any
    /// previous hook for the operation.
    pub fn register_control_hook(
        &self,
        task_id: TaskId,
        operation: &str,
        hook: &str,
    ) -> Result<(), DispatchError> {
        let operation: ControlOperation = operation.parse()?;
        let hook = HookRef::new(hook)?;
        if !self.shared.registry.has_control_hook(&hook) {
            return Err(DispatchError::UnregisteredHook(hook.to_string()));
        }

        self.shared.with_open_call(task_id, |entry| {
            entry.request.add_control_hook(operation, hook);
        })
    }

    /// Current report; falls back to the store for calls no longer in memory.
    pub fn get_report(&self, task_id: TaskId) -> Result<CallReport, DispatchError> {
        if let Some(entry) = self.shared.lock().calls.get(&task_id) {
            return Ok(entry.report.clone());
        }
        self.shared.stored_report(task_id)
    }

    /// Reports of in-memory calls carrying every tag in `tags`, oldest first.
    pub fn find_by_tags<T: AsRef<str>>(&self, tags: &[T]) -> Vec<CallReport> {
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        let mut reports: Vec<CallReport> = self
            .shared
            .lock()
            .calls
            .values()
            .filter(|e| e.request.has_tags(&tags))
            .map(|e| e.report.clone())
            .collect();
        reports.sort_by_key(|r| (r.submit_time(), r.task_id()));
        reports
    }

    /// Reports of every in-memory call belonging to `job_id`, oldest first.
    pub fn job_reports(&self, job_id: JobId) -> Vec<CallReport> {
        let mut reports: Vec<CallReport> = self
            .shared
            .lock()
            .calls
            .values()
            .filter(|e| e.report.job_id() == job_id)
            .map(|e| e.report.clone())
            .collect();
        reports.sort_by_key(|r| (r.submit_time(), r.task_id()));
        reports
    }

    /// Subscribe to progress and state changes of one call.
    ///
    /// A call that is already terminal yields its final state and closes.
    pub fn watch(&self, task_id: TaskId) -> Result<Subscription<ReportEvent>, DispatchError> {
        let (tx, rx) = mpsc::channel();
        {
            let mut guard = self.shared.lock();
            if let Some(entry) = guard.calls.get_mut(&task_id) {
                if entry.report.is_terminal() {
                    let _ = tx.send(ReportEvent::StateChanged(entry.report.state()));
                } else {
                    entry.watchers.push(tx);
                }
                return Ok(Subscription::new(rx));
            }
        }

        let report = self.shared.stored_report(task_id)?;
        let _ = tx.send(ReportEvent::StateChanged(report.state()));
        Ok(Subscription::new(rx))
    }

    pub fn stats(&self) -> DispatcherStats {
        let guard = self.shared.lock();
        let mut stats = DispatcherStats::default();
        for entry in guard.calls.values() {
            match entry.report.state() {
                CallState::Waiting => stats.waiting += 1,
                CallState::Running => stats.running += 1,
                _ => stats.finished += 1,
            }
        }
        stats
    }

    /// Stop accepting submissions. Calls already submitted keep going; any
    /// left unfinished are resumed by the next [`start`](Self::start).
    pub fn shutdown(&self) {
        let mut guard = self.shared.lock();
        if guard.accepting {
            guard.accepting = false;
            let unfinished = guard
                .calls
                .values()
                .filter(|e| !e.report.is_terminal())
                .count();
            info!(unfinished, "dispatcher stopped accepting calls");
        }
    }
}

impl<S, P> Shared<S, P>
where
    S: CallStore + 'static,
    P: WorkerPool + 'static,
{
    pub(crate) fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_registered(&self, request: &CallRequest) -> Result<(), DispatchError> {
        if !self.registry.has_callable(request.callable()) {
            return Err(DispatchError::UnregisteredCallable(request.callable_name().to_string()));
        }
        for (_, hooks) in request.execution_hooks().iter() {
            if let Some(missing) = hooks.iter().find(|h| !self.registry.has_lifecycle_hook(h)) {
                return Err(DispatchError::UnregisteredHook(missing.to_string()));
            }
        }
        for hook in request.control_hooks().iter().filter_map(|(_, h)| h) {
            if !self.registry.has_control_hook(hook) {
                return Err(DispatchError::UnregisteredHook(hook.to_string()));
            }
        }
        Ok(())
    }

    fn with_open_call(
        &self,
        task_id: TaskId,
        change: impl FnOnce(&mut CallEntry),
    ) -> Result<(), DispatchError> {
        let mut guard = self.lock();
        let entry = guard
            .calls
            .get_mut(&task_id)
            .ok_or(DispatchError::NotFound(task_id))?;
        if entry.report.is_terminal() {
            return Err(DispatchError::AlreadyFinished(task_id));
        }
        change(entry);
        self.persist(entry)
    }

    fn stored_report(&self, task_id: TaskId) -> Result<CallReport, DispatchError> {
        match self.store.get(task_id)? {
            Some(record) => Ok(codec::decode_report(record.report)?),
            None => Err(DispatchError::NotFound(task_id)),
        }
    }

    /// Fire every hook registered for `event`, in registration order.
    fn fire(&self, entry: &CallEntry, event: LifecycleEvent) {
        let task_id = entry.report.task_id();
        for hook_ref in entry.request.execution_hooks().get(event) {
            let Some(hook) = self.registry.lifecycle_hook(hook_ref) else {
                warn!(
                    task_id = %task_id,
                    hook = %hook_ref,
                    event = %event,
                    "lifecycle hook not registered"
                );
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| hook(event, &entry.report))) {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => {
                    warn!(
                        task_id = %task_id,
                        hook = %hook_ref,
                        event = %event,
                        error = %reason,
                        "lifecycle hook failed"
                    );
                }
                Err(payload) => {
                    warn!(
                        task_id = %task_id,
                        hook = %hook_ref,
                        event = %event,
                        error = %panic_message(&*payload),
                        "lifecycle hook panicked"
                    );
                }
            }
        }
    }

    fn persist(&self, entry: &CallEntry) -> Result<(), DispatchError> {
        let record = codec::encode(&entry.request, &entry.report)?;
        self.store
            .put(entry.report.task_id(), record.request, record.report)?;
        Ok(())
    }

    fn persist_logged(&self, entry: &CallEntry) {
        if let Err(e) = self.persist(entry) {
            error!(task_id = %entry.report.task_id(), error = %e, "failed to persist call");
        }
    }

    pub(crate) fn apply_admission(
        &self,
        entry: &mut CallEntry,
        admission: Admission,
        executions: &mut Vec<Execution>,
    ) {
        let task_id = entry.report.task_id();
        match admission {
            Admission::Accepted => self.start_call(entry, executions),
            Admission::Postponed(reasons) => {
                debug!(task_id = %task_id, reasons = ?reasons, "call postponed");
                if let Err(e) = entry.report.set_admission(Response::Postponed, reasons) {
                    error!(task_id = %task_id, error = %e, "failed to record postponement");
                }
                self.persist_logged(entry);
            }
            Admission::Rejected(reasons) => {
                warn!(task_id = %task_id, reasons = ?reasons, "call rejected");
                match entry.report.mark_rejected(reasons, Utc::now()) {
                    Ok(()) => {
                        self.fire(entry, LifecycleEvent::Failure);
                        self.fire(entry, LifecycleEvent::Complete);
                        entry.publish(ReportEvent::StateChanged(CallState::Failed));
                    }
                    Err(e) => error!(task_id = %task_id, error = %e, "failed to record rejection"),
                }
                self.persist_logged(entry);
            }
        }
    }

    fn start_call(&self, entry: &mut CallEntry, executions: &mut Vec<Execution>) {
        let task_id = entry.report.task_id();
        if let Err(e) = entry.report.mark_running(Utc::now()) {
            error!(task_id = %task_id, error = %e, "failed to start call");
            return;
        }
        debug!(task_id = %task_id, callable = %entry.request.callable(), "call admitted");
        self.fire(entry, LifecycleEvent::Dequeue);
        self.fire(entry, LifecycleEvent::Run);
        entry.publish(ReportEvent::StateChanged(CallState::Running));
        self.persist_logged(entry);

        let callable = self
            .registry
            .callable(entry.request.callable())
            .unwrap_or_else(|| unresolved(entry.request.callable_name()));
        let sink: Weak<dyn OutcomeSink> = self.me.clone();
        executions.push(Execution::new(
            entry.request.callable().clone(),
            callable,
            entry.request.args().to_vec(),
            entry.request.kwargs().clone(),
            ReportHandle::new(task_id, entry.report.job_id(), sink),
        ));
    }

    /// Give back `task_id`'s grants (or its queue slot) and start whatever
    /// that admits.
    fn release(
        &self,
        state: &mut DispatchState,
        task_id: TaskId,
        was_running: bool,
        executions: &mut Vec<Execution>,
    ) {
        let admitted = if was_running {
            state.coordinator.release(task_id)
        } else {
            state.coordinator.withdraw(task_id)
        };
        for id in admitted {
            if let Some(entry) = state.calls.get_mut(&id) {
                self.start_call(entry, executions);
            }
        }

        let DispatchState {
            coordinator, calls, ..
        } = state;
        for (id, reasons) in coordinator.queued() {
            let Some(entry) = calls.get_mut(&id) else {
                continue;
            };
            if entry.report.reasons() != reasons
                && entry
                    .report
                    .set_admission(Response::Postponed, reasons.to_vec())
                    .is_ok()
            {
                self.persist_logged(entry);
            }
        }
    }

    /// Hand executions to the pool. Must be called without the lock held.
    pub(crate) fn launch(&self, executions: Vec<Execution>) {
        for execution in executions {
            let task_id = execution.task_id();
            if let Err(e) = self.pool.execute(execution) {
                error!(task_id = %task_id, error = %e, "worker pool refused call");
                self.finish(
                    task_id,
                    CallOutcome::Failed(CallFailure::new(format!("worker pool unavailable: {e}"))),
                );
            }
        }
    }
}

fn unresolved(name: &str) -> Callable {
    let message = format!("callable not registered: {name}");
    Arc::new(
        move |_: &CallContext,
              _: &[Value],
              _: &BTreeMap<String, Value>|
              -> Result<Value, CallFailure> { Err(CallFailure::new(message.clone())) },
    )
}

impl<S, P> OutcomeSink for Shared<S, P>
where
    S: CallStore + 'static,
    P: WorkerPool + 'static,
{
    fn progress(&self, task_id: TaskId, key: String, value: Value) {
        if let Err(e) = value.to_record() {
            warn!(
                task_id = %task_id,
                key = %key,
                error = %e,
                "dropping progress that cannot be stored"
            );
            return;
        }

        let mut guard = self.lock();
        let Some(entry) = guard.calls.get_mut(&task_id) else {
            return;
        };
        if entry.report.state() != CallState::Running {
            debug!(task_id = %task_id, state = %entry.report.state(), "ignoring progress");
            return;
        }
        if entry.report.record_progress(key.clone(), value.clone()).is_ok() {
            self.persist_logged(entry);
            entry.publish(ReportEvent::Progress { key, value });
        }
    }

    fn cancel_requested(&self, task_id: TaskId) -> bool {
        self.lock()
            .calls
            .get(&task_id)
            .is_some_and(|e| e.report.state() == CallState::Canceled)
    }

    fn finish(&self, task_id: TaskId, outcome: CallOutcome) {
        let mut executions = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(entry) = state.calls.get_mut(&task_id) else {
                debug!(task_id = %task_id, "outcome for unknown call dropped");
                return;
            };
            if entry.report.state() != CallState::Running {
                debug!(task_id = %task_id, state = %entry.report.state(), "late outcome ignored");
                return;
            }

            let outcome = match outcome {
                CallOutcome::Succeeded(value) => match value.to_record() {
                    Ok(_) => CallOutcome::Succeeded(value),
                    Err(e) => CallOutcome::Failed(CallFailure::new(format!(
                        "result cannot be stored: {e}"
                    ))),
                },
                failed => failed,
            };

            let now = Utc::now();
            let (recorded, event) = match outcome {
                CallOutcome::Succeeded(value) => (
                    entry.report.mark_succeeded(value, now),
                    LifecycleEvent::Success,
                ),
                CallOutcome::Failed(failure) => {
                    let traceback = (!failure.traceback.is_empty()).then_some(failure.traceback);
                    (
                        entry.report.mark_failed(failure.exception, traceback, now),
                        LifecycleEvent::Failure,
                    )
                }
            };
            if let Err(e) = recorded {
                error!(task_id = %task_id, error = %e, "failed to record outcome");
                return;
            }

            let final_state = entry.report.state();
            info!(task_id = %task_id, state = %final_state, "call finished");
            self.fire(entry, event);
            self.fire(entry, LifecycleEvent::Complete);
            entry.publish(ReportEvent::StateChanged(final_state));
            self.persist_logged(entry);

            self.release(state, task_id, true, &mut executions);
        }

        self.changed.notify_all();
        self.launch(executions);
    }
}
