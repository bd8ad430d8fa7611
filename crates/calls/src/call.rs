//! Call descriptor: what to run, with which arguments, against which resources.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use conductor_core::{CallError, CallResult, Value};

/// Check that `name` is a module-qualified identifier (`sync.repo::run`).
///
/// Segments are separated by `.` or `::` and each one must be a plain
/// identifier.
pub fn is_qualified_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.split("::").flat_map(|part| part.split('.')).all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

macro_rules! qualified_name_newtype {
    ($t:ident, $what:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $t(String);

        impl $t {
            pub fn new(name: impl Into<String>) -> CallResult<Self> {
                let name = name.into();
                if !is_qualified_name(&name) {
                    return Err(CallError::invalid_descriptor(format!(
                        "{} name {:?} is not a qualified identifier",
                        $what, name
                    )));
                }
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = CallError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

qualified_name_newtype!(CallableRef, "callable");
qualified_name_newtype!(HookRef, "hook");

/// How a call uses a resource.
///
/// `Read` is shared; `Write` and `Exclusive` both require sole ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Exclusive,
}

impl Operation {
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, Operation::Read)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            "exclusive" => Ok(Operation::Exclusive),
            other => Err(CallError::invalid_descriptor(format!(
                "unknown resource operation {other:?}"
            ))),
        }
    }
}

/// Points in a call's lifecycle where observer hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The call entered `waiting`.
    Enqueue,
    /// The call left the wait queue (admitted, or canceled while waiting).
    Dequeue,
    /// The call entered `running`.
    Run,
    Success,
    Failure,
    Cancel,
    /// Fired after any terminal state, following the specific event.
    Complete,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 7] = [
        LifecycleEvent::Enqueue,
        LifecycleEvent::Dequeue,
        LifecycleEvent::Run,
        LifecycleEvent::Success,
        LifecycleEvent::Failure,
        LifecycleEvent::Cancel,
        LifecycleEvent::Complete,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Enqueue => "enqueue",
            LifecycleEvent::Dequeue => "dequeue",
            LifecycleEvent::Run => "run",
            LifecycleEvent::Success => "success",
            LifecycleEvent::Failure => "failure",
            LifecycleEvent::Cancel => "cancel",
            LifecycleEvent::Complete => "complete",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| CallError::UnknownLifecycleEvent(s.to_string()))
    }
}

/// Operations an external actor can invoke on a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOperation {
    Cancel,
}

impl ControlOperation {
    pub const ALL: [ControlOperation; 1] = [ControlOperation::Cancel];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOperation::Cancel => "cancel",
        }
    }
}

impl fmt::Display for ControlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlOperation {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| CallError::UnknownControlOperation(s.to_string()))
    }
}

/// Observer hooks, one ordered list per lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionHooks {
    slots: [Vec<HookRef>; LifecycleEvent::ALL.len()],
}

impl ExecutionHooks {
    pub fn get(&self, event: LifecycleEvent) -> &[HookRef] {
        &self.slots[event.index()]
    }

    pub fn push(&mut self, event: LifecycleEvent, hook: HookRef) {
        self.slots[event.index()].push(hook);
    }

    /// Every slot with its hooks, in event order (empty slots included).
    pub fn iter(&self) -> impl Iterator<Item = (LifecycleEvent, &[HookRef])> {
        LifecycleEvent::ALL
            .into_iter()
            .map(move |e| (e, self.slots[e.index()].as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}

/// Control hooks, at most one per control operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlHooks {
    slots: [Option<HookRef>; ControlOperation::ALL.len()],
}

impl ControlHooks {
    pub fn get(&self, op: ControlOperation) -> Option<&HookRef> {
        self.slots[op.index()].as_ref()
    }

    pub fn set(&mut self, op: ControlOperation, hook: HookRef) {
        self.slots[op.index()] = Some(hook);
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlOperation, Option<&HookRef>)> {
        ControlOperation::ALL
            .into_iter()
            .map(move |op| (op, self.slots[op.index()].as_ref()))
    }
}

/// A deferred call.
///
/// Built with [`CallRequest::builder`]. After construction only the hook
/// registration methods mutate it; once submitted the dispatcher owns its
/// copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    callable: CallableRef,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    resources: BTreeMap<String, Operation>,
    weight: u32,
    tags: Vec<String>,
    asynchronous: bool,
    archive: bool,
    execution_hooks: ExecutionHooks,
    control_hooks: ControlHooks,
}

impl CallRequest {
    pub fn builder(callable: impl Into<String>) -> CallRequestBuilder {
        CallRequestBuilder::new(callable)
    }

    pub fn callable(&self) -> &CallableRef {
        &self.callable
    }

    pub fn callable_name(&self) -> &str {
        self.callable.as_str()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    pub fn resources(&self) -> &BTreeMap<String, Operation> {
        &self.resources
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn archive(&self) -> bool {
        self.archive
    }

    pub fn execution_hooks(&self) -> &ExecutionHooks {
        &self.execution_hooks
    }

    pub fn control_hooks(&self) -> &ControlHooks {
        &self.control_hooks
    }

    /// Append an observer hook for `event`.
    pub fn add_lifecycle_hook(&mut self, event: LifecycleEvent, hook: HookRef) {
        self.execution_hooks.push(event, hook);
    }

    /// String-keyed variant of [`add_lifecycle_hook`](Self::add_lifecycle_hook).
    pub fn add_lifecycle_hook_by_key(&mut self, key: &str, hook: HookRef) -> CallResult<()> {
        let event = key.parse()?;
        self.add_lifecycle_hook(event, hook);
        Ok(())
    }

    /// Install the hook for `op`, replacing any previous one.
    pub fn add_control_hook(&mut self, op: ControlOperation, hook: HookRef) {
        self.control_hooks.set(op, hook);
    }

    /// String-keyed variant of [`add_control_hook`](Self::add_control_hook).
    pub fn add_control_hook_by_key(&mut self, key: &str, hook: HookRef) -> CallResult<()> {
        let op = key.parse()?;
        self.add_control_hook(op, hook);
        Ok(())
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}

impl fmt::Display for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallRequest: {}(", self.callable)?;
        let args = self.args.iter().map(|a| a.to_string());
        let kwargs = self.kwargs.iter().map(|(k, v)| format!("{k}={v}"));
        let all: Vec<String> = args.chain(kwargs).collect();
        write!(f, "{})", all.join(", "))
    }
}

/// Builder for [`CallRequest`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct CallRequestBuilder {
    callable: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    resources: BTreeMap<String, Operation>,
    weight: i64,
    tags: Vec<String>,
    asynchronous: bool,
    archive: bool,
    execution_hooks: Vec<(LifecycleEvent, String)>,
    control_hooks: Vec<(ControlOperation, String)>,
}

impl CallRequestBuilder {
    fn new(callable: impl Into<String>) -> Self {
        Self {
            callable: callable.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            resources: BTreeMap::new(),
            weight: 1,
            tags: Vec::new(),
            asynchronous: false,
            archive: false,
            execution_hooks: Vec::new(),
            control_hooks: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>, op: Operation) -> Self {
        self.resources.insert(resource_id.into(), op);
        self
    }

    pub fn weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn lifecycle_hook(mut self, event: LifecycleEvent, hook: impl Into<String>) -> Self {
        self.execution_hooks.push((event, hook.into()));
        self
    }

    pub fn control_hook(mut self, op: ControlOperation, hook: impl Into<String>) -> Self {
        self.control_hooks.push((op, hook.into()));
        self
    }

    pub fn build(self) -> CallResult<CallRequest> {
        let callable = CallableRef::new(self.callable)?;

        let weight = u32::try_from(self.weight).map_err(|_| {
            CallError::invalid_descriptor(format!(
                "weight must be within 0..={}, got {}",
                u32::MAX,
                self.weight
            ))
        })?;

        if self.resources.keys().any(|r| r.is_empty()) {
            return Err(CallError::invalid_descriptor("resource ids must be non-empty"));
        }
        if self.kwargs.keys().any(|k| k.is_empty()) {
            return Err(CallError::invalid_descriptor("keyword names must be non-empty"));
        }

        let mut execution_hooks = ExecutionHooks::default();
        for (event, name) in self.execution_hooks {
            execution_hooks.push(event, HookRef::new(name)?);
        }
        let mut control_hooks = ControlHooks::default();
        for (op, name) in self.control_hooks {
            control_hooks.set(op, HookRef::new(name)?);
        }

        Ok(CallRequest {
            callable,
            args: self.args,
            kwargs: self.kwargs,
            resources: self.resources,
            weight,
            tags: self.tags,
            asynchronous: self.asynchronous,
            archive: self.archive,
            execution_hooks,
            control_hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(name: &str) -> HookRef {
        HookRef::new(name).unwrap()
    }

    #[test]
    fn qualified_names() {
        assert!(is_qualified_name("sync"));
        assert!(is_qualified_name("repo.sync.run"));
        assert!(is_qualified_name("repo::Importer.sync_units"));
        assert!(!is_qualified_name(""));
        assert!(!is_qualified_name("repo..sync"));
        assert!(!is_qualified_name("1repo"));
        assert!(!is_qualified_name("repo sync"));
        assert!(!is_qualified_name("lambda: x"));
    }

    #[test]
    fn builder_applies_defaults() {
        let call = CallRequest::builder("repo.sync").build().unwrap();
        assert_eq!(call.weight(), 1);
        assert!(call.args().is_empty());
        assert!(call.kwargs().is_empty());
        assert!(call.resources().is_empty());
        assert!(!call.asynchronous());
        assert!(!call.archive());
        assert!(call.execution_hooks().is_empty());
        assert_eq!(call.execution_hooks().iter().count(), LifecycleEvent::ALL.len());
        assert_eq!(call.control_hooks().iter().count(), ControlOperation::ALL.len());
    }

    #[test]
    fn negative_weight_is_invalid() {
        let err = CallRequest::builder("repo.sync").weight(-1).build().unwrap_err();
        assert!(matches!(err, CallError::InvalidDescriptor(msg) if msg.contains("weight")));
    }

    #[test]
    fn malformed_callable_is_invalid() {
        let err = CallRequest::builder("<lambda>").build().unwrap_err();
        assert!(matches!(err, CallError::InvalidDescriptor(_)));
    }

    #[test]
    fn empty_resource_id_is_invalid() {
        let err = CallRequest::builder("repo.sync")
            .resource("", Operation::Read)
            .build()
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidDescriptor(_)));
    }

    #[test]
    fn malformed_hook_name_is_invalid() {
        let err = CallRequest::builder("repo.sync")
            .lifecycle_hook(LifecycleEvent::Run, "not a name")
            .build()
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidDescriptor(_)));
    }

    #[test]
    fn lifecycle_hooks_keep_registration_order() {
        let mut call = CallRequest::builder("repo.sync").build().unwrap();
        call.add_lifecycle_hook(LifecycleEvent::Run, hook("audit.first"));
        call.add_lifecycle_hook_by_key("run", hook("audit.second")).unwrap();

        let names: Vec<&str> = call
            .execution_hooks()
            .get(LifecycleEvent::Run)
            .iter()
            .map(HookRef::as_str)
            .collect();
        assert_eq!(names, vec!["audit.first", "audit.second"]);
        assert!(call.execution_hooks().get(LifecycleEvent::Success).is_empty());
    }

    #[test]
    fn unknown_lifecycle_key_is_rejected() {
        let mut call = CallRequest::builder("repo.sync").build().unwrap();
        let err = call
            .add_lifecycle_hook_by_key("explode", hook("audit.first"))
            .unwrap_err();
        assert_eq!(err, CallError::UnknownLifecycleEvent("explode".to_string()));
        assert!(call.execution_hooks().is_empty());
    }

    #[test]
    fn control_hook_last_write_wins() {
        let mut call = CallRequest::builder("repo.sync").build().unwrap();
        call.add_control_hook(ControlOperation::Cancel, hook("sync.cancel_v1"));
        call.add_control_hook_by_key("cancel", hook("sync.cancel_v2")).unwrap();
        assert_eq!(
            call.control_hooks().get(ControlOperation::Cancel),
            Some(&hook("sync.cancel_v2"))
        );

        let err = call.add_control_hook_by_key("pause", hook("sync.pause")).unwrap_err();
        assert_eq!(err, CallError::UnknownControlOperation("pause".to_string()));
    }

    #[test]
    fn display_lists_arguments() {
        let call = CallRequest::builder("repo.sync")
            .arg("repo-1")
            .arg(3)
            .kwarg("force", true)
            .build()
            .unwrap();
        assert_eq!(call.to_string(), r#"CallRequest: repo.sync("repo-1", 3, force=true)"#);
    }

    #[test]
    fn write_and_exclusive_are_exclusive() {
        assert!(!Operation::Read.is_exclusive());
        assert!(Operation::Write.is_exclusive());
        assert!(Operation::Exclusive.is_exclusive());
        assert_eq!("exclusive".parse::<Operation>().unwrap(), Operation::Exclusive);
        assert!("delete".parse::<Operation>().is_err());
    }
}
