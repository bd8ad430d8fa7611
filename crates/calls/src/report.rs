//! Call report: admission response, lifecycle state, progress and outcome.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::{CallError, CallResult, JobId, TaskId, Value};

use crate::call::Operation;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Submitted, not yet admitted.
    Waiting,
    /// Admitted and handed to a worker.
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Succeeded | CallState::Failed | CallState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Waiting => "waiting",
            CallState::Running => "running",
            CallState::Succeeded => "succeeded",
            CallState::Failed => "failed",
            CallState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Accepted,
    Postponed,
    Rejected,
}

impl Response {
    pub fn as_str(&self) -> &'static str {
        match self {
            Response::Accepted => "accepted",
            Response::Postponed => "postponed",
            Response::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for Response {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Response::Accepted),
            "postponed" => Ok(Response::Postponed),
            "rejected" => Ok(Response::Rejected),
            other => Err(CallError::invalid_report(format!("unknown response {other:?}"))),
        }
    }
}

/// Why a call is not (yet) running.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    /// The requested operation on this resource conflicts with current grants
    /// or with an earlier queued call.
    Resource {
        resource_id: String,
        operation: Operation,
    },
    /// The global weight budget cannot take this call now (or ever, on rejection).
    GlobalBudget { weight: u32, budget: u32 },
}

impl Reason {
    pub fn resource(resource_id: impl Into<String>, operation: Operation) -> Self {
        Reason::Resource {
            resource_id: resource_id.into(),
            operation,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Resource {
                resource_id,
                operation,
            } => write!(f, "({resource_id}, {operation})"),
            Reason::GlobalBudget { weight, budget } => {
                write!(f, "(global budget {budget}, weight {weight})")
            }
        }
    }
}

/// Raw report fields, validated by [`CallReport::from_parts`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReportParts {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub state: CallState,
    pub response: Option<Response>,
    pub reasons: Vec<Reason>,
    pub progress: BTreeMap<String, Value>,
    pub result: Option<Value>,
    pub exception: Option<String>,
    pub traceback: Option<Vec<String>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

/// Progress and outcome of one dispatched call.
///
/// At most one of `result` / `exception` is present, and only once the
/// call is in the matching terminal state. Terminal reports are frozen.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    task_id: TaskId,
    job_id: JobId,
    state: CallState,
    response: Option<Response>,
    reasons: Vec<Reason>,
    progress: BTreeMap<String, Value>,
    result: Option<Value>,
    exception: Option<String>,
    traceback: Option<Vec<String>>,
    submit_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
}

impl CallReport {
    /// A fresh report in `waiting` with every optional field unset.
    pub fn new(task_id: TaskId, job_id: JobId) -> Self {
        Self {
            task_id,
            job_id,
            state: CallState::Waiting,
            response: None,
            reasons: Vec::new(),
            progress: BTreeMap::new(),
            result: None,
            exception: None,
            traceback: None,
            submit_time: None,
            start_time: None,
            finish_time: None,
        }
    }

    /// Build a report from raw parts, enforcing the outcome/timestamp invariants.
    pub fn from_parts(parts: ReportParts) -> CallResult<Self> {
        let ReportParts {
            task_id,
            job_id,
            state,
            response,
            reasons,
            progress,
            result,
            exception,
            traceback,
            submit_time,
            start_time,
            finish_time,
        } = parts;

        if result.is_some() && exception.is_some() {
            return Err(CallError::invalid_report("both result and exception are set"));
        }
        if result.is_some() && state != CallState::Succeeded {
            return Err(CallError::invalid_report(format!("result set in state {state}")));
        }
        if exception.is_some() && state != CallState::Failed {
            return Err(CallError::invalid_report(format!("exception set in state {state}")));
        }
        if traceback.is_some() && exception.is_none() {
            return Err(CallError::invalid_report("traceback without exception"));
        }
        if state.is_terminal() != finish_time.is_some() {
            return Err(CallError::invalid_report(format!(
                "finish_time {} in state {state}",
                if finish_time.is_some() { "set" } else { "missing" }
            )));
        }
        if state == CallState::Running && start_time.is_none() {
            return Err(CallError::invalid_report("running without start_time"));
        }
        if let (Some(start), Some(finish)) = (start_time, finish_time) {
            if finish < start {
                return Err(CallError::invalid_report("finish_time precedes start_time"));
            }
        }

        Ok(Self {
            task_id,
            job_id,
            state,
            response,
            reasons,
            progress,
            result,
            exception,
            traceback,
            submit_time,
            start_time,
            finish_time,
        })
    }

    pub fn into_parts(self) -> ReportParts {
        ReportParts {
            task_id: self.task_id,
            job_id: self.job_id,
            state: self.state,
            response: self.response,
            reasons: self.reasons,
            progress: self.progress,
            result: self.result,
            exception: self.exception,
            traceback: self.traceback,
            submit_time: self.submit_time,
            start_time: self.start_time,
            finish_time: self.finish_time,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn response(&self) -> Option<Response> {
        self.response
    }

    pub fn reasons(&self) -> &[Reason] {
        &self.reasons
    }

    pub fn progress(&self) -> &BTreeMap<String, Value> {
        &self.progress
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn traceback(&self) -> Option<&[String]> {
        self.traceback.as_deref()
    }

    pub fn submit_time(&self) -> Option<DateTime<Utc>> {
        self.submit_time
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.finish_time
    }

    fn ensure_open(&self, action: &str) -> CallResult<()> {
        if self.is_terminal() {
            return Err(CallError::invalid_report(format!(
                "cannot {action}: call {} is already {}",
                self.task_id, self.state
            )));
        }
        Ok(())
    }

    /// Stamp the submission time (once).
    pub fn mark_submitted(&mut self, at: DateTime<Utc>) {
        if self.submit_time.is_none() {
            self.submit_time = Some(at);
        }
    }

    /// Record an admission decision that did not start the call.
    pub fn set_admission(&mut self, response: Response, reasons: Vec<Reason>) -> CallResult<()> {
        self.ensure_open("record admission")?;
        self.response = Some(response);
        self.reasons = reasons;
        Ok(())
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) -> CallResult<()> {
        if self.state != CallState::Waiting {
            return Err(CallError::invalid_report(format!(
                "cannot start call {} from state {}",
                self.task_id, self.state
            )));
        }
        self.state = CallState::Running;
        self.response = Some(Response::Accepted);
        self.reasons.clear();
        if self.start_time.is_none() {
            self.start_time = Some(at);
        }
        Ok(())
    }

    pub fn mark_succeeded(&mut self, result: Value, at: DateTime<Utc>) -> CallResult<()> {
        self.ensure_open("record result")?;
        self.state = CallState::Succeeded;
        self.result = Some(result);
        self.finish(at);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        exception: impl Into<String>,
        traceback: Option<Vec<String>>,
        at: DateTime<Utc>,
    ) -> CallResult<()> {
        self.ensure_open("record failure")?;
        self.state = CallState::Failed;
        self.exception = Some(exception.into());
        self.traceback = traceback;
        self.finish(at);
        Ok(())
    }

    /// Terminal rejection: the call can never be admitted.
    pub fn mark_rejected(&mut self, reasons: Vec<Reason>, at: DateTime<Utc>) -> CallResult<()> {
        self.ensure_open("reject")?;
        let described: Vec<String> = reasons.iter().map(Reason::to_string).collect();
        self.response = Some(Response::Rejected);
        self.reasons = reasons;
        self.mark_failed(
            format!("rejected by resource coordinator: {}", described.join(", ")),
            None,
            at,
        )
    }

    pub fn mark_canceled(&mut self, at: DateTime<Utc>) -> CallResult<()> {
        self.ensure_open("cancel")?;
        self.state = CallState::Canceled;
        self.finish(at);
        Ok(())
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        // Clamp so that finish_time never precedes start_time.
        let at = match self.start_time {
            Some(start) if at < start => start,
            _ => at,
        };
        self.finish_time = Some(at);
    }

    /// Store a progress payload under `key`. Ignored once terminal.
    pub fn record_progress(&mut self, key: impl Into<String>, value: Value) -> CallResult<()> {
        self.ensure_open("record progress")?;
        self.progress.insert(key.into(), value);
        Ok(())
    }

    /// Put a recovered, non-terminal report back to `waiting` so it can be
    /// re-submitted. Ids, submit time and progress are kept.
    pub fn reset_for_resubmission(&mut self) -> CallResult<()> {
        self.ensure_open("resubmit")?;
        self.state = CallState::Waiting;
        self.response = None;
        self.reasons.clear();
        self.start_time = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn report() -> CallReport {
        let task_id = TaskId::new();
        CallReport::new(task_id, JobId::for_task(task_id))
    }

    #[test]
    fn new_report_is_waiting_and_empty() {
        let r = report();
        assert_eq!(r.state(), CallState::Waiting);
        assert!(r.response().is_none());
        assert!(r.reasons().is_empty());
        assert!(r.progress().is_empty());
        assert!(r.result().is_none());
        assert!(r.exception().is_none());
        assert!(r.start_time().is_none());
        assert!(r.finish_time().is_none());
    }

    #[test]
    fn success_lifecycle() {
        let mut r = report();
        let start = Utc::now();
        r.mark_running(start).unwrap();
        assert_eq!(r.response(), Some(Response::Accepted));
        r.record_progress("units", Value::Int(3)).unwrap();
        r.mark_succeeded(Value::from("done"), start + Duration::seconds(1)).unwrap();

        assert_eq!(r.state(), CallState::Succeeded);
        assert_eq!(r.result(), Some(&Value::from("done")));
        assert!(r.exception().is_none());
        assert!(r.finish_time().unwrap() >= r.start_time().unwrap());
    }

    #[test]
    fn terminal_reports_are_frozen() {
        let mut r = report();
        r.mark_running(Utc::now()).unwrap();
        r.mark_failed("boom", Some(vec!["frame 1".to_string()]), Utc::now()).unwrap();

        assert!(r.mark_succeeded(Value::Null, Utc::now()).is_err());
        assert!(r.mark_canceled(Utc::now()).is_err());
        assert!(r.record_progress("late", Value::Null).is_err());
        assert!(r.mark_running(Utc::now()).is_err());
        assert_eq!(r.state(), CallState::Failed);
        assert!(r.result().is_none());
    }

    #[test]
    fn finish_time_never_precedes_start_time() {
        let mut r = report();
        let start = Utc::now();
        r.mark_running(start).unwrap();
        r.mark_canceled(start - Duration::seconds(5)).unwrap();
        assert_eq!(r.finish_time(), Some(start));
    }

    #[test]
    fn rejection_is_terminal_failure_with_reasons() {
        let mut r = report();
        let reasons = vec![Reason::resource("repo-1", Operation::Read)];
        r.mark_rejected(reasons.clone(), Utc::now()).unwrap();

        assert_eq!(r.state(), CallState::Failed);
        assert_eq!(r.response(), Some(Response::Rejected));
        assert_eq!(r.reasons(), reasons.as_slice());
        assert!(r.exception().unwrap().contains("repo-1"));
        assert!(r.start_time().is_none());
    }

    #[test]
    fn from_parts_rejects_result_and_exception() {
        let mut parts = report().into_parts();
        parts.state = CallState::Failed;
        parts.finish_time = Some(Utc::now());
        parts.result = Some(Value::Int(1));
        parts.exception = Some("boom".to_string());
        let err = CallReport::from_parts(parts).unwrap_err();
        assert!(matches!(err, CallError::InvalidReport(_)));
    }

    #[test]
    fn from_parts_rejects_outcome_on_open_call() {
        let mut parts = report().into_parts();
        parts.result = Some(Value::Int(1));
        assert!(CallReport::from_parts(parts).is_err());

        let mut parts = report().into_parts();
        parts.finish_time = Some(Utc::now());
        assert!(CallReport::from_parts(parts).is_err());
    }

    #[test]
    fn from_parts_rejects_inverted_timestamps() {
        let now = Utc::now();
        let mut parts = report().into_parts();
        parts.state = CallState::Canceled;
        parts.start_time = Some(now);
        parts.finish_time = Some(now - Duration::seconds(1));
        assert!(CallReport::from_parts(parts).is_err());
    }

    #[test]
    fn reset_keeps_identity_and_progress() {
        let mut r = report();
        r.mark_submitted(Utc::now());
        r.mark_running(Utc::now()).unwrap();
        r.record_progress("step", Value::Int(2)).unwrap();
        let (task_id, job_id, submitted) = (r.task_id(), r.job_id(), r.submit_time());

        r.reset_for_resubmission().unwrap();
        assert_eq!(r.state(), CallState::Waiting);
        assert!(r.response().is_none());
        assert!(r.start_time().is_none());
        assert_eq!(r.task_id(), task_id);
        assert_eq!(r.job_id(), job_id);
        assert_eq!(r.submit_time(), submitted);
        assert_eq!(r.progress().get("step"), Some(&Value::Int(2)));
    }
}
