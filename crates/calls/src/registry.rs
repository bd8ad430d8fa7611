//! Name-based registry of callables and hooks.
//!
//! Durable records only carry names; this registry turns them back into code.
//! It is constructed explicitly and passed to whoever needs it (dispatcher,
//! codec), never held in a global.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use conductor_core::{CallResult, Value};

use crate::call::{CallableRef, ControlOperation, HookRef, LifecycleEvent};
use crate::context::{CallContext, CallFailure};
use crate::report::CallReport;

/// A dispatchable function.
pub type Callable = Arc<
    dyn Fn(&CallContext, &[Value], &BTreeMap<String, Value>) -> Result<Value, CallFailure>
        + Send
        + Sync,
>;

/// Observer fired on a lifecycle transition. Errors are logged, never propagated.
pub type LifecycleHook =
    Arc<dyn Fn(LifecycleEvent, &CallReport) -> Result<(), String> + Send + Sync>;

/// Control operation implementation (e.g. stop the work behind a cancel).
pub type ControlHook =
    Arc<dyn Fn(ControlOperation, &CallReport) -> Result<(), String> + Send + Sync>;

#[derive(Default, Clone)]
pub struct CallRegistry {
    callables: HashMap<String, Callable>,
    lifecycle_hooks: HashMap<String, LifecycleHook>,
    control_hooks: HashMap<String, ControlHook>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any previous registration.
    pub fn register_callable<F>(&mut self, name: &str, f: F) -> CallResult<CallableRef>
    where
        F: Fn(&CallContext, &[Value], &BTreeMap<String, Value>) -> Result<Value, CallFailure>
            + Send
            + Sync
            + 'static,
    {
        let callable = CallableRef::new(name)?;
        debug!(callable = %callable, "registered callable");
        self.callables
            .insert(callable.as_str().to_string(), Arc::new(f));
        Ok(callable)
    }

    pub fn register_lifecycle_hook<F>(&mut self, name: &str, f: F) -> CallResult<HookRef>
    where
        F: Fn(LifecycleEvent, &CallReport) -> Result<(), String> + Send + Sync + 'static,
    {
        let hook = HookRef::new(name)?;
        debug!(hook = %hook, "registered lifecycle hook");
        self.lifecycle_hooks
            .insert(hook.as_str().to_string(), Arc::new(f));
        Ok(hook)
    }

    pub fn register_control_hook<F>(&mut self, name: &str, f: F) -> CallResult<HookRef>
    where
        F: Fn(ControlOperation, &CallReport) -> Result<(), String> + Send + Sync + 'static,
    {
        let hook = HookRef::new(name)?;
        debug!(hook = %hook, "registered control hook");
        self.control_hooks
            .insert(hook.as_str().to_string(), Arc::new(f));
        Ok(hook)
    }

    pub fn callable(&self, callable: &CallableRef) -> Option<Callable> {
        self.callables.get(callable.as_str()).cloned()
    }

    pub fn lifecycle_hook(&self, hook: &HookRef) -> Option<LifecycleHook> {
        self.lifecycle_hooks.get(hook.as_str()).cloned()
    }

    pub fn control_hook(&self, hook: &HookRef) -> Option<ControlHook> {
        self.control_hooks.get(hook.as_str()).cloned()
    }

    pub fn has_callable(&self, callable: &CallableRef) -> bool {
        self.callables.contains_key(callable.as_str())
    }

    pub fn has_lifecycle_hook(&self, hook: &HookRef) -> bool {
        self.lifecycle_hooks.contains_key(hook.as_str())
    }

    pub fn has_control_hook(&self, hook: &HookRef) -> bool {
        self.control_hooks.contains_key(hook.as_str())
    }
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut callables: Vec<&String> = self.callables.keys().collect();
        callables.sort();
        f.debug_struct("CallRegistry")
            .field("callables", &callables)
            .field("lifecycle_hooks", &self.lifecycle_hooks.len())
            .field("control_hooks", &self.control_hooks.len())
            .finish()
    }
}
