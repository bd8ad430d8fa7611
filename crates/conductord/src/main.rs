//! Runs a dispatcher wired from `CONDUCTOR_*` variables and drives a small
//! batch of repository calls through it.
//!
//! Usage: `conductord [REPO...]` (defaults to three demo repositories).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use conductor_calls::{
    CallFailure, CallRegistry, CallRequest, ControlOperation, LifecycleEvent, Operation,
};
use conductor_core::Value;
use conductor_infra::{
    DispatchConfig, Dispatcher, InMemoryCallStore, Submission, ThreadPoolConfig, ThreadWorkerPool,
};

fn registry() -> anyhow::Result<CallRegistry> {
    let mut registry = CallRegistry::new();

    registry.register_callable("repo.sync", |ctx, args, _kwargs| {
        let repo = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| CallFailure::new("repo.sync expects a repository id"))?;
        for unit in 1..=5i64 {
            if ctx.is_canceled() {
                return Err(CallFailure::new(format!("sync of {repo} canceled")));
            }
            thread::sleep(Duration::from_millis(20));
            ctx.report_progress("units_done", unit);
        }
        Ok(Value::from(format!("{repo} synced")))
    })?;

    registry.register_callable("repo.publish", |_ctx, args, kwargs| {
        let repo = args.first().and_then(Value::as_str).unwrap_or("unknown");
        let target = kwargs.get("target").and_then(Value::as_str).unwrap_or("default");
        Ok(Value::from(format!("{repo} published to {target}")))
    })?;

    registry.register_lifecycle_hook("audit.log", |event, report| {
        tracing::info!(
            task_id = %report.task_id(),
            event = %event,
            state = %report.state(),
            "lifecycle"
        );
        Ok(())
    })?;

    registry.register_control_hook("repo.stop", |op, report| {
        tracing::info!(task_id = %report.task_id(), operation = %op, "stop requested");
        Ok(())
    })?;

    Ok(registry)
}

fn repo_calls(repo: &str) -> anyhow::Result<Vec<CallRequest>> {
    let sync = CallRequest::builder("repo.sync")
        .arg(repo)
        .resource(repo, Operation::Write)
        .weight(2)
        .tag(format!("repository:{repo}"))
        .asynchronous(true)
        .lifecycle_hook(LifecycleEvent::Complete, "audit.log")
        .control_hook(ControlOperation::Cancel, "repo.stop")
        .build()?;
    let publish = CallRequest::builder("repo.publish")
        .arg(repo)
        .kwarg("target", "cdn")
        .resource(repo, Operation::Read)
        .tag(format!("repository:{repo}"))
        .asynchronous(true)
        .lifecycle_hook(LifecycleEvent::Complete, "audit.log")
        .build()?;
    Ok(vec![sync, publish])
}

fn main() -> anyhow::Result<()> {
    conductor_observability::init();

    let config = DispatchConfig::from_env();
    tracing::info!(config = ?config, "starting conductord");

    let pool_config = ThreadPoolConfig::default().with_threads(config.worker_threads);
    let pool = ThreadWorkerPool::spawn(pool_config).context("failed to spawn worker pool")?;
    let pool = Arc::new(pool);
    let store = InMemoryCallStore::arc();

    let callables = Arc::new(registry()?);
    let (dispatcher, recovery) = Dispatcher::start(store, pool.clone(), callables, config)
        .context("failed to start dispatcher")?;
    tracing::info!(
        resumed = recovery.resumed.len(),
        dropped = recovery.dropped.len(),
        "dispatcher ready"
    );
    let collector = dispatcher
        .spawn_collector()
        .context("failed to spawn collector")?;

    let repos: Vec<String> = std::env::args().skip(1).collect();
    let repos = if repos.is_empty() {
        vec!["repo-1".to_string(), "repo-2".to_string(), "repo-3".to_string()]
    } else {
        repos
    };

    let mut requests = Vec::new();
    for repo in &repos {
        requests.extend(repo_calls(repo)?);
    }
    let (job_id, submitted) = dispatcher.submit_job(requests)?;
    tracing::info!(job_id = %job_id, calls = submitted.len(), "job submitted");

    for report in &submitted {
        match dispatcher.wait(report.task_id(), Some(Duration::from_secs(30)))? {
            Submission::Finished(done) => {
                let summary = serde_json::json!({
                    "task_id": done.task_id().to_string(),
                    "state": done.state().as_str(),
                    "result": done.result().map(|r| r.to_string()),
                    "exception": done.exception(),
                });
                println!("{summary}");
            }
            other => tracing::warn!(
                task_id = %other.task_id(),
                state = %other.report().state(),
                "call did not finish in time"
            ),
        }
    }

    let stats = dispatcher.stats();
    tracing::info!(
        waiting = stats.waiting,
        running = stats.running,
        finished = stats.finished,
        pool = ?pool.stats(),
        "job complete"
    );

    dispatcher.shutdown();
    collector.shutdown();
    pool.shutdown();
    Ok(())
}
