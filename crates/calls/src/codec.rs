//! Durable record form of call requests and reports.
//!
//! A stored call is one JSON document: the report fields and the request
//! fields flattened together. Callables and hooks are stored by name and
//! resolved through a [`CallRegistry`] on decode; argument data goes through
//! the [`Value`] allow-list. Anything that cannot be reconstructed exactly is
//! an `Encode`/`Decode` error, never a silently altered record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conductor_core::{CallError, CallResult, JobId, TaskId, Value};

use crate::call::{CallRequest, ControlOperation, HookRef, LifecycleEvent};
use crate::registry::CallRegistry;
use crate::report::{CallReport, CallState, Reason, ReportParts, Response};

/// Stored form of a [`CallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub callable_name: String,
    #[serde(default)]
    pub args: Option<Vec<JsonValue>>,
    #[serde(default)]
    pub kwargs: Option<BTreeMap<String, JsonValue>>,
    #[serde(default)]
    pub resources: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub asynchronous: Option<bool>,
    #[serde(default)]
    pub archive: Option<bool>,
    #[serde(default)]
    pub execution_hooks: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub control_hooks: Option<BTreeMap<String, Option<String>>>,
}

/// Stored form of a [`CallReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub task_id: TaskId,
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub state: CallState,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub reasons: Option<Vec<Reason>>,
    #[serde(default)]
    pub progress: Option<BTreeMap<String, JsonValue>>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub traceback: Option<Vec<String>>,
    #[serde(default)]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

/// One persisted call: report and request in a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(flatten)]
    pub report: ReportRecord,
    #[serde(flatten)]
    pub request: RequestRecord,
}

impl CallRecord {
    pub fn new(report: ReportRecord, request: RequestRecord) -> Self {
        Self { report, request }
    }

    pub fn task_id(&self) -> TaskId {
        self.report.task_id
    }

    pub fn state(&self) -> CallState {
        self.report.state
    }

    pub fn is_terminal(&self) -> bool {
        self.report.state.is_terminal()
    }

    pub fn is_archived(&self) -> bool {
        self.request.archive.unwrap_or(false)
    }

    pub fn submit_time(&self) -> Option<DateTime<Utc>> {
        self.report.submit_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.report.finish_time
    }

    pub fn tags(&self) -> &[String] {
        self.request.tags.as_deref().unwrap_or(&[])
    }
}

pub fn encode_request(request: &CallRequest) -> CallResult<RequestRecord> {
    let args = request
        .args()
        .iter()
        .enumerate()
        .map(|(i, v)| v.to_record().map_err(|e| annotate(e, format!("arg {i}"))))
        .collect::<CallResult<Vec<_>>>()?;

    let kwargs = encode_map(request.kwargs(), "kwarg")?;

    let resources = request
        .resources()
        .iter()
        .map(|(id, op)| (id.clone(), op.as_str().to_string()))
        .collect();

    let execution_hooks = request
        .execution_hooks()
        .iter()
        .map(|(event, hooks)| {
            (
                event.as_str().to_string(),
                hooks.iter().map(|h| h.as_str().to_string()).collect(),
            )
        })
        .collect();

    let control_hooks = request
        .control_hooks()
        .iter()
        .map(|(op, hook)| (op.as_str().to_string(), hook.map(|h| h.as_str().to_string())))
        .collect();

    Ok(RequestRecord {
        callable_name: request.callable_name().to_string(),
        args: Some(args),
        kwargs: Some(kwargs),
        resources: Some(resources),
        weight: Some(i64::from(request.weight())),
        tags: Some(request.tags().to_vec()),
        asynchronous: Some(request.asynchronous()),
        archive: Some(request.archive()),
        execution_hooks: Some(execution_hooks),
        control_hooks: Some(control_hooks),
    })
}

/// Rebuild a request. The callable and every hook must be registered.
pub fn decode_request(record: RequestRecord, registry: &CallRegistry) -> CallResult<CallRequest> {
    decode_request_inner(record, registry).map_err(CallError::into_decode)
}

fn decode_request_inner(record: RequestRecord, registry: &CallRegistry) -> CallResult<CallRequest> {
    let mut builder = CallRequest::builder(record.callable_name)
        .weight(record.weight.unwrap_or(1))
        .asynchronous(record.asynchronous.unwrap_or(false))
        .archive(record.archive.unwrap_or(false));

    for (i, raw) in record.args.unwrap_or_default().into_iter().enumerate() {
        let value = Value::from_record(raw).map_err(|e| annotate(e, format!("arg {i}")))?;
        builder = builder.arg(value);
    }
    for (key, raw) in record.kwargs.unwrap_or_default() {
        let value = Value::from_record(raw).map_err(|e| annotate(e, format!("kwarg {key}")))?;
        builder = builder.kwarg(key, value);
    }
    for (id, op) in record.resources.unwrap_or_default() {
        builder = builder.resource(id, op.parse()?);
    }
    for tag in record.tags.unwrap_or_default() {
        builder = builder.tag(tag);
    }

    let mut request = builder.build()?;
    if !registry.has_callable(request.callable()) {
        return Err(CallError::decode(format!(
            "callable {} is not registered",
            request.callable_name()
        )));
    }

    for (key, names) in record.execution_hooks.unwrap_or_default() {
        let event: LifecycleEvent = key.parse()?;
        for name in names {
            let hook = HookRef::new(name)?;
            if !registry.has_lifecycle_hook(&hook) {
                return Err(CallError::decode(format!(
                    "lifecycle hook {hook} ({event}) is not registered"
                )));
            }
            request.add_lifecycle_hook(event, hook);
        }
    }
    for (key, name) in record.control_hooks.unwrap_or_default() {
        let op: ControlOperation = key.parse()?;
        let Some(name) = name else { continue };
        let hook = HookRef::new(name)?;
        if !registry.has_control_hook(&hook) {
            return Err(CallError::decode(format!(
                "control hook {hook} ({op}) is not registered"
            )));
        }
        request.add_control_hook(op, hook);
    }

    Ok(request)
}

pub fn encode_report(report: &CallReport) -> CallResult<ReportRecord> {
    let result = report
        .result()
        .map(|v| v.to_record().map_err(|e| annotate(e, "result")))
        .transpose()?;

    Ok(ReportRecord {
        task_id: report.task_id(),
        job_id: Some(report.job_id()),
        state: report.state(),
        response: report.response().map(|r| r.as_str().to_string()),
        reasons: Some(report.reasons().to_vec()),
        progress: Some(encode_map(report.progress(), "progress")?),
        result,
        exception: report.exception().map(str::to_string),
        traceback: report.traceback().map(<[String]>::to_vec),
        submit_time: report.submit_time(),
        start_time: report.start_time(),
        finish_time: report.finish_time(),
    })
}

pub fn decode_report(record: ReportRecord) -> CallResult<CallReport> {
    decode_report_inner(record).map_err(CallError::into_decode)
}

fn decode_report_inner(record: ReportRecord) -> CallResult<CallReport> {
    let response = record
        .response
        .as_deref()
        .map(str::parse::<Response>)
        .transpose()?;

    let mut progress = BTreeMap::new();
    for (key, raw) in record.progress.unwrap_or_default() {
        let value = Value::from_record(raw).map_err(|e| annotate(e, format!("progress {key}")))?;
        progress.insert(key, value);
    }

    let result = record
        .result
        .map(|raw| Value::from_record(raw).map_err(|e| annotate(e, "result")))
        .transpose()?;

    CallReport::from_parts(ReportParts {
        task_id: record.task_id,
        job_id: record.job_id.unwrap_or_else(|| JobId::for_task(record.task_id)),
        state: record.state,
        response,
        reasons: record.reasons.unwrap_or_default(),
        progress,
        result,
        exception: record.exception,
        traceback: record.traceback,
        submit_time: record.submit_time,
        start_time: record.start_time,
        finish_time: record.finish_time,
    })
}

pub fn encode(request: &CallRequest, report: &CallReport) -> CallResult<CallRecord> {
    Ok(CallRecord::new(encode_report(report)?, encode_request(request)?))
}

pub fn decode(
    record: CallRecord,
    registry: &CallRegistry,
) -> CallResult<(CallRequest, CallReport)> {
    let report = decode_report(record.report)?;
    let request = decode_request(record.request, registry)?;
    Ok((request, report))
}

fn encode_map(
    map: &BTreeMap<String, Value>,
    what: &str,
) -> CallResult<BTreeMap<String, JsonValue>> {
    map.iter()
        .map(|(k, v)| {
            v.to_record()
                .map(|raw| (k.clone(), raw))
                .map_err(|e| annotate(e, format!("{what} {k}")))
        })
        .collect()
}

fn annotate(err: CallError, context: impl AsRef<str>) -> CallError {
    let context = context.as_ref();
    match err {
        CallError::Encode(msg) => CallError::Encode(format!("{context}: {msg}")),
        CallError::Decode(msg) => CallError::Decode(format!("{context}: {msg}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Operation;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn registry() -> CallRegistry {
        let mut registry = CallRegistry::new();
        registry
            .register_callable("repo.sync", |_, _, _| Ok(Value::Null))
            .unwrap();
        registry
            .register_lifecycle_hook("audit.record", |_, _| Ok(()))
            .unwrap();
        registry
            .register_lifecycle_hook("audit.notify", |_, _| Ok(()))
            .unwrap();
        registry
            .register_control_hook("repo.cancel_sync", |_, _| Ok(()))
            .unwrap();
        registry
    }

    fn populated_request() -> CallRequest {
        CallRequest::builder("repo.sync")
            .arg("repo-1")
            .arg(Value::List(vec![Value::Int(1), Value::Float(0.5)]))
            .kwarg("force", true)
            .kwarg("payload", Value::Bytes(vec![0, 159, 255]))
            .resource("repo-1", Operation::Exclusive)
            .resource("content", Operation::Read)
            .weight(3)
            .tag("repo:repo-1")
            .tag("action:sync")
            .asynchronous(true)
            .archive(true)
            .lifecycle_hook(LifecycleEvent::Run, "audit.record")
            .lifecycle_hook(LifecycleEvent::Run, "audit.notify")
            .lifecycle_hook(LifecycleEvent::Complete, "audit.record")
            .control_hook(ControlOperation::Cancel, "repo.cancel_sync")
            .build()
            .unwrap()
    }

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).single().unwrap()
    }

    #[test]
    fn populated_request_round_trips() {
        let request = populated_request();
        let record = encode_request(&request).unwrap();
        assert_eq!(decode_request(record, &registry()).unwrap(), request);
    }

    #[test]
    fn empty_request_round_trips() {
        let request = CallRequest::builder("repo.sync").weight(0).build().unwrap();
        let record = encode_request(&request).unwrap();
        assert_eq!(decode_request(record, &registry()).unwrap(), request);
    }

    #[test]
    fn finished_report_round_trips() {
        let task_id = TaskId::new();
        let mut report = CallReport::new(task_id, JobId::new());
        report.mark_submitted(at(1_700_000_000, 123_456_789));
        report.mark_running(at(1_700_000_001, 5)).unwrap();
        report.record_progress("units", Value::Int(7)).unwrap();
        report
            .mark_failed("boom", Some(vec!["sync.rs:10".to_string()]), at(1_700_000_002, 0))
            .unwrap();

        let record = encode_report(&report).unwrap();
        assert_eq!(decode_report(record).unwrap(), report);
    }

    #[test]
    fn null_result_is_distinct_from_no_result() {
        let task_id = TaskId::new();
        let mut report = CallReport::new(task_id, JobId::for_task(task_id));
        report.mark_running(at(10, 0)).unwrap();
        report.mark_succeeded(Value::Null, at(11, 0)).unwrap();

        let decoded = decode_report(encode_report(&report).unwrap()).unwrap();
        assert_eq!(decoded.result(), Some(&Value::Null));
    }

    #[test]
    fn document_uses_flat_record_shape() {
        let task_id = TaskId::new();
        let record = encode(&populated_request(), &CallReport::new(task_id, JobId::new())).unwrap();
        let doc = serde_json::to_value(&record).unwrap();
        for field in [
            "task_id",
            "job_id",
            "callable_name",
            "args",
            "kwargs",
            "resources",
            "weight",
            "tags",
            "asynchronous",
            "archive",
            "execution_hooks",
            "control_hooks",
            "response",
            "reasons",
            "state",
            "progress",
            "result",
            "exception",
            "traceback",
            "start_time",
            "finish_time",
        ] {
            assert!(doc.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(doc["callable_name"], "repo.sync");
        assert_eq!(doc["state"], "waiting");
        assert_eq!(doc["resources"]["repo-1"], "exclusive");

        let back: CallRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn minimal_document_decodes_with_defaults() {
        let task_id = TaskId::new();
        let doc = serde_json::json!({
            "task_id": task_id,
            "callable_name": "repo.sync",
            "state": "waiting",
        });
        let record: CallRecord = serde_json::from_value(doc).unwrap();
        let (request, report) = decode(record, &registry()).unwrap();
        assert_eq!(request.weight(), 1);
        assert_eq!(report.job_id(), JobId::for_task(task_id));
    }

    #[test]
    fn non_finite_argument_fails_to_encode() {
        let request = CallRequest::builder("repo.sync")
            .arg(f64::NAN)
            .build()
            .unwrap();
        let err = encode_request(&request).unwrap_err();
        assert!(matches!(err, CallError::Encode(msg) if msg.starts_with("arg 0")));
    }

    #[test]
    fn unresolvable_names_fail_to_decode() {
        let mut record = encode_request(&populated_request()).unwrap();
        record.callable_name = "repo.sync_v0".to_string();
        assert!(matches!(decode_request(record, &registry()), Err(CallError::Decode(_))));

        let mut record = encode_request(&populated_request()).unwrap();
        record.callable_name = "\u{0}garbage".to_string();
        assert!(matches!(decode_request(record, &registry()), Err(CallError::Decode(_))));

        let request = populated_request();
        let record = encode_request(&request).unwrap();
        let mut partial = CallRegistry::new();
        partial
            .register_callable("repo.sync", |_, _, _| Ok(Value::Null))
            .unwrap();
        let err = decode_request(record, &partial).unwrap_err();
        assert!(matches!(err, CallError::Decode(msg) if msg.contains("audit.record")));
    }

    #[test]
    fn unknown_hook_keys_fail_to_decode() {
        let mut record = encode_request(&populated_request()).unwrap();
        record
            .execution_hooks
            .as_mut()
            .unwrap()
            .insert("on_explode".to_string(), vec!["audit.record".to_string()]);
        let err = decode_request(record, &registry()).unwrap_err();
        assert!(matches!(err, CallError::Decode(msg) if msg.contains("on_explode")));
    }

    #[test]
    fn unsafe_argument_payloads_fail_to_decode() {
        let mut record = encode_request(&populated_request()).unwrap();
        record.args.as_mut().unwrap()[0] = serde_json::json!({"pickle": "Y29zCnN5c3RlbQo="});
        assert!(matches!(decode_request(record, &registry()), Err(CallError::Decode(_))));
    }

    #[test]
    fn negative_weight_fails_to_decode() {
        let mut record = encode_request(&populated_request()).unwrap();
        record.weight = Some(-4);
        assert!(matches!(decode_request(record, &registry()), Err(CallError::Decode(_))));
    }

    #[test]
    fn inconsistent_report_fails_to_decode() {
        let task_id = TaskId::new();
        let mut record = encode_report(&CallReport::new(task_id, JobId::new())).unwrap();
        record.exception = Some("boom".to_string());
        assert!(matches!(decode_report(record), Err(CallError::Decode(_))));
    }

    fn arb_arg() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            // Quarter steps are exact in binary, so they survive JSON text.
            (-4_000_000i64..4_000_000).prop_map(|n| Value::Float(n as f64 / 4.0)),
            "[a-z0-9-]{0,10}".prop_map(Value::Str),
        ]
    }

    fn arb_operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            Just(Operation::Read),
            Just(Operation::Write),
            Just(Operation::Exclusive),
        ]
    }

    fn arb_request() -> impl Strategy<Value = CallRequest> {
        (
            prop::collection::vec(arb_arg(), 0..4),
            prop::collection::btree_map("[a-z]{1,5}", arb_arg(), 0..3),
            prop::collection::btree_map("repo-[0-9]{1,2}", arb_operation(), 0..3),
            0i64..100,
            prop::collection::vec("[a-z:]{1,8}", 0..3),
            any::<(bool, bool)>(),
            prop::collection::vec((0usize..LifecycleEvent::ALL.len(), any::<bool>()), 0..5),
            any::<bool>(),
        )
            .prop_map(
                |(args, kwargs, resources, weight, tags, (asynchronous, archive), hooks, cancel)| {
                    let mut builder = CallRequest::builder("repo.sync")
                        .args(args)
                        .weight(weight)
                        .asynchronous(asynchronous)
                        .archive(archive);
                    for (k, v) in kwargs {
                        builder = builder.kwarg(k, v);
                    }
                    for (id, op) in resources {
                        builder = builder.resource(id, op);
                    }
                    for tag in tags {
                        builder = builder.tag(tag);
                    }
                    for (idx, first) in hooks {
                        let name = if first { "audit.record" } else { "audit.notify" };
                        builder = builder.lifecycle_hook(LifecycleEvent::ALL[idx], name);
                    }
                    if cancel {
                        builder =
                            builder.control_hook(ControlOperation::Cancel, "repo.cancel_sync");
                    }
                    builder.build().unwrap()
                },
            )
    }

    fn arb_report() -> impl Strategy<Value = CallReport> {
        (
            0u8..5,
            prop::collection::btree_map("[a-z]{1,5}", arb_arg(), 0..3),
            arb_arg(),
            0i64..1_000_000,
            0u32..1_000_000_000,
        )
            .prop_map(|(state, progress, result, secs, nanos)| {
                let task_id = TaskId::new();
                let mut report = CallReport::new(task_id, JobId::new());
                let base = 1_600_000_000 + secs;
                report.mark_submitted(at(base, nanos));
                if state == 4 {
                    let reasons = vec![Reason::GlobalBudget { weight: 9, budget: 4 }];
                    report.mark_rejected(reasons, at(base, nanos)).unwrap();
                    return report;
                }
                if state >= 1 {
                    report.mark_running(at(base + 1, nanos)).unwrap();
                    for (k, v) in progress {
                        report.record_progress(k, v).unwrap();
                    }
                }
                match state {
                    2 => report.mark_succeeded(result, at(base + 2, 0)).unwrap(),
                    3 => report.mark_canceled(at(base + 2, 0)).unwrap(),
                    _ => {}
                }
                report
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: decode(encode(request)) == request.
        #[test]
        fn requests_round_trip(request in arb_request()) {
            let registry = registry();
            let record = encode_request(&request).unwrap();
            prop_assert_eq!(decode_request(record, &registry).unwrap(), request);
        }

        /// Property: decode(encode(report)) == report, including through JSON text.
        #[test]
        fn reports_round_trip(report in arb_report()) {
            let record = encode_report(&report).unwrap();
            let text = serde_json::to_string(&record).unwrap();
            let parsed: ReportRecord = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(decode_report(parsed).unwrap(), report);
        }
    }
}
