//! Fixed-size pool of named OS threads fed through an mpsc queue.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info};

use super::{Execution, WorkerPool, WorkerPoolError};

/// Thread pool configuration.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads
    pub threads: usize,
    /// Thread name prefix, also used in logs
    pub name: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            name: "conductor-worker".to_string(),
        }
    }
}

impl ThreadPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub executions_started: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Execution>>>;

#[derive(Debug)]
pub struct ThreadWorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Execution>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<Mutex<PoolStats>>,
    started: Instant,
}

impl ThreadWorkerPool {
    /// Spawn `config.threads` workers (at least one).
    pub fn spawn(config: ThreadPoolConfig) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Execution>();
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let stats = Arc::new(Mutex::new(PoolStats::default()));

        let mut workers = Vec::with_capacity(config.threads.max(1));
        for idx in 0..config.threads.max(1) {
            let rx = rx.clone();
            let stats = stats.clone();
            let name = format!("{}-{idx}", config.name);
            let join = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(name, rx, stats))?;
            workers.push(join);
        }

        info!(pool = %config.name, threads = workers.len(), "worker pool started");

        Ok(Self {
            name: config.name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
            started: Instant::now(),
        })
    }

    /// Stop accepting work, let queued executions drain, and join every worker.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for join in workers {
            // A worker can drop the last dispatcher reference and land here.
            if join.thread().id() == current {
                continue;
            }
            if join.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

impl WorkerPool for ThreadWorkerPool {
    fn execute(&self, execution: Execution) -> Result<(), WorkerPoolError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(execution).map_err(|_| WorkerPoolError::ShutDown),
            None => Err(WorkerPoolError::ShutDown),
        }
    }
}

impl Drop for ThreadWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(name: String, rx: SharedReceiver, stats: Arc<Mutex<PoolStats>>) {
    debug!(worker = %name, "worker started");

    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(execution) = next else {
            break;
        };

        let task_id = execution.task_id();
        debug!(
            worker = %name,
            task_id = %task_id,
            callable = %execution.callable_name(),
            "running call"
        );

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.executions_started += 1;
            s.current_running += 1;
        }

        let succeeded = execution.run();

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.current_running = s.current_running.saturating_sub(1);
            if succeeded {
                s.executions_succeeded += 1;
            } else {
                s.executions_failed += 1;
            }
        }

        debug!(worker = %name, task_id = %task_id, succeeded, "call finished");
    }

    debug!(worker = %name, "worker stopped");
}
