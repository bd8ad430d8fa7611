//! `conductor-calls`: the call model.
//!
//! - [`CallRequest`]: what to run (callable name, arguments, resources, weight, hooks)
//! - [`CallReport`]: how it is going (admission, state, progress, outcome)
//! - [`codec`]: durable record form of both
//! - [`CallRegistry`]: name → code resolution for callables and hooks
//!
//! Pure domain; no storage, threads or clocks beyond timestamps passed in.

pub mod call;
pub mod codec;
pub mod context;
pub mod registry;
pub mod report;

pub use call::{
    CallRequest, CallRequestBuilder, CallableRef, ControlHooks, ControlOperation, ExecutionHooks,
    HookRef, LifecycleEvent, Operation,
};
pub use codec::{CallRecord, ReportRecord, RequestRecord};
pub use context::{CallContext, CallFailure, ProgressSink};
pub use registry::{CallRegistry, Callable, ControlHook, LifecycleHook};
pub use report::{CallReport, CallState, Reason, ReportParts, Response};
