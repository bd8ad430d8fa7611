//! Dispatcher configuration.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::coordinator::ResourceBudgets;

pub const ENV_GLOBAL_WEIGHT_BUDGET: &str = "CONDUCTOR_GLOBAL_WEIGHT_BUDGET";
pub const ENV_DEFAULT_RESOURCE_BUDGET: &str = "CONDUCTOR_DEFAULT_RESOURCE_BUDGET";
/// Comma separated `resource=budget` pairs.
pub const ENV_RESOURCE_BUDGETS: &str = "CONDUCTOR_RESOURCE_BUDGETS";
pub const ENV_SYNC_WAIT_TIMEOUT_MS: &str = "CONDUCTOR_SYNC_WAIT_TIMEOUT_MS";
pub const ENV_RETENTION_SECS: &str = "CONDUCTOR_RETENTION_SECS";
pub const ENV_COLLECT_INTERVAL_SECS: &str = "CONDUCTOR_COLLECT_INTERVAL_SECS";
pub const ENV_WORKER_THREADS: &str = "CONDUCTOR_WORKER_THREADS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Total weight of all running calls; `None` is unbounded.
    pub global_weight_budget: Option<u32>,
    /// Budget for resources without an explicit entry; `None` is unbounded.
    pub default_resource_budget: Option<u32>,
    pub resource_budgets: BTreeMap<String, u32>,
    /// How long a synchronous `submit` blocks. `None` waits until terminal.
    pub sync_wait_timeout: Option<Duration>,
    /// Terminal, non-archived calls older than this are collected.
    pub retention: Duration,
    pub collect_interval: Duration,
    pub worker_threads: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            global_weight_budget: None,
            default_resource_budget: None,
            resource_budgets: BTreeMap::new(),
            sync_wait_timeout: None,
            retention: Duration::from_secs(24 * 60 * 60),
            collect_interval: Duration::from_secs(60),
            worker_threads: 4,
        }
    }
}

impl DispatchConfig {
    pub fn with_global_weight_budget(mut self, budget: u32) -> Self {
        self.global_weight_budget = Some(budget);
        self
    }

    pub fn with_default_resource_budget(mut self, budget: u32) -> Self {
        self.default_resource_budget = Some(budget);
        self
    }

    pub fn with_resource_budget(mut self, resource_id: impl Into<String>, budget: u32) -> Self {
        self.resource_budgets.insert(resource_id.into(), budget);
        self
    }

    pub fn with_sync_wait_timeout(mut self, timeout: Duration) -> Self {
        self.sync_wait_timeout = Some(timeout);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_collect_interval(mut self, interval: Duration) -> Self {
        self.collect_interval = interval;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn budgets(&self) -> ResourceBudgets {
        ResourceBudgets {
            global: self.global_weight_budget,
            default_per_resource: self.default_resource_budget,
            per_resource: self.resource_budgets.clone(),
        }
    }

    /// Defaults overridden by `CONDUCTOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32>(&lookup, ENV_GLOBAL_WEIGHT_BUDGET) {
            config.global_weight_budget = Some(v);
        }
        if let Some(v) = parse_var::<u32>(&lookup, ENV_DEFAULT_RESOURCE_BUDGET) {
            config.default_resource_budget = Some(v);
        }
        if let Some(raw) = lookup(ENV_RESOURCE_BUDGETS) {
            for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match parse_budget_pair(pair) {
                    Some((id, budget)) => {
                        config.resource_budgets.insert(id, budget);
                    }
                    None => warn!(
                        var = ENV_RESOURCE_BUDGETS,
                        entry = pair,
                        "ignoring malformed resource budget"
                    ),
                }
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_SYNC_WAIT_TIMEOUT_MS) {
            config.sync_wait_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_RETENTION_SECS) {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_COLLECT_INTERVAL_SECS) {
            if secs == 0 {
                warn!(
                    var = ENV_COLLECT_INTERVAL_SECS,
                    "collect interval must be positive; keeping default"
                );
            } else {
                config.collect_interval = Duration::from_secs(secs);
            }
        }
        if let Some(n) = parse_var::<usize>(&lookup, ENV_WORKER_THREADS) {
            if n == 0 {
                warn!(
                    var = ENV_WORKER_THREADS,
                    "worker thread count must be positive; keeping default"
                );
            } else {
                config.worker_threads = n;
            }
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}

fn parse_budget_pair(pair: &str) -> Option<(String, u32)> {
    let (id, budget) = pair.split_once('=')?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), budget.trim().parse().ok()?))
}
