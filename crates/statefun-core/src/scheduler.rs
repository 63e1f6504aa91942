// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Elastic worker pool.
//!
//! Tasks go through a bounded queue. A worker is spawned on submit when none
//! is idle and the pool is below `max_workers`; a worker idle for
//! `idle_timeout` exits unless that would leave fewer than `min_workers`.
//! Stopping lets running tasks finish and drops queued ones.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{ConfigError, env_parse};
use crate::error::{Result, StatefunError};
use crate::lock_unpoisoned as lock;

/// Unit of work run by the pool.
pub type Task = BoxFuture<'static, ()>;

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Workers kept alive while idle.
    pub min_workers: usize,
    /// Upper bound on workers.
    pub max_workers: usize,
    /// Idle time after which a surplus worker exits.
    pub idle_timeout: Duration,
    /// Capacity of the task queue.
    pub task_queue_len: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 20,
            max_workers: 10_000,
            idle_timeout: Duration::from_millis(5000),
            task_queue_len: 10_000,
        }
    }
}

/// Named pool sizing tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadProfile {
    /// 2..100 workers, 2 s idle timeout, 1000 queued tasks.
    Light,
    /// Sizing from `WP_*` environment variables.
    #[default]
    Default,
    /// 50..20000 workers, 10 s idle timeout, 20000 queued tasks.
    Heavy,
}

impl WorkerPoolConfig {
    /// Load sizing from environment variables.
    ///
    /// - `WP_WORKERS_MIN` (default: 20)
    /// - `WP_WORKERS_MAX` (default: 10000)
    /// - `WP_WORKERS_IDLE_TIMEOUT_MS` (default: 5000)
    /// - `WP_TASK_QUEUE_LEN` (default: 10000)
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            min_workers: env_parse("WP_WORKERS_MIN", 20, "must be a non-negative integer")?,
            max_workers: env_parse("WP_WORKERS_MAX", 10_000, "must be a positive integer")?,
            idle_timeout: Duration::from_millis(env_parse(
                "WP_WORKERS_IDLE_TIMEOUT_MS",
                5000,
                "must be a number of milliseconds",
            )?),
            task_queue_len: env_parse("WP_TASK_QUEUE_LEN", 10_000, "must be a positive integer")?,
        })
    }

    /// Sizing of a named tier.
    pub fn from_profile(profile: LoadProfile) -> std::result::Result<Self, ConfigError> {
        match profile {
            LoadProfile::Light => Ok(Self {
                min_workers: 2,
                max_workers: 100,
                idle_timeout: Duration::from_secs(2),
                task_queue_len: 1000,
            }),
            LoadProfile::Default => Self::from_env(),
            LoadProfile::Heavy => Ok(Self {
                min_workers: 50,
                max_workers: 20_000,
                idle_timeout: Duration::from_secs(10),
                task_queue_len: 20_000,
            }),
        }
    }

    /// Clamp to a usable shape: at least one worker and one queue slot, and
    /// `min_workers <= max_workers`.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self.min_workers = self.min_workers.min(self.max_workers);
        self.task_queue_len = self.task_queue_len.max(1);
        self
    }
}

/// Elastic pool of task-running workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    config: WorkerPoolConfig,
    sender: mpsc::Sender<Task>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    state: Mutex<PoolState>,
    workers: watch::Sender<usize>,
    stop: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    workers: usize,
    idle: usize,
    busy: usize,
    stopped: bool,
}

impl PoolInner {
    /// Tasks sent but not yet taken by a worker.
    fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

enum Next {
    Task(Task),
    Idle,
    Stop,
}

impl WorkerPool {
    /// Create a pool. No worker runs until the first submit.
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        let config = config.normalized();
        let (sender, receiver) = mpsc::channel(config.task_queue_len);
        let (workers, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                state: Mutex::new(PoolState::default()),
                workers,
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Pool sizing.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Queue a task, growing the pool while queued tasks outnumber idle workers.
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.is_stopped() {
            return Err(StatefunError::PoolStopped(self.inner.name.clone()));
        }
        self.inner.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StatefunError::PoolFull(self.inner.name.clone()),
            mpsc::error::TrySendError::Closed(_) => {
                StatefunError::PoolStopped(self.inner.name.clone())
            }
        })?;

        let spawn = {
            let mut state = lock(&self.inner.state);
            let grow = !state.stopped
                && self.inner.pending() > state.idle
                && state.workers < self.inner.config.max_workers;
            if grow {
                state.workers += 1;
                self.inner.workers.send_replace(state.workers);
            }
            grow
        };
        if spawn {
            debug!(pool = %self.inner.name, workers = self.workers(), "Worker pool grew");
            tokio::spawn(worker(self.inner.clone()));
        }
        Ok(())
    }

    /// Free slots in the task queue.
    pub fn free_slots(&self) -> usize {
        self.inner.sender.capacity()
    }

    /// Live workers.
    pub fn workers(&self) -> usize {
        lock(&self.inner.state).workers
    }

    /// Workers waiting for a task.
    pub fn idle_workers(&self) -> usize {
        lock(&self.inner.state).idle
    }

    /// Busy workers as a share of `max_workers`, 0-100.
    pub fn load_percentage(&self) -> u8 {
        let busy = lock(&self.inner.state).busy;
        ((busy * 100) / self.inner.config.max_workers).min(100) as u8
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.state).stopped
    }

    /// Stop accepting tasks and wait for running ones to finish.
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.inner.stop.cancel();

        let mut workers = self.inner.workers.subscribe();
        // The sender lives in `inner`, so this only ends when the count hits 0.
        let _ = workers.wait_for(|n| *n == 0).await;
        debug!(pool = %self.inner.name, "Worker pool stopped");
    }
}

async fn worker(inner: Arc<PoolInner>) {
    loop {
        lock(&inner.state).idle += 1;

        let next = tokio::select! {
            biased;

            _ = inner.stop.cancelled() => Next::Stop,

            received = tokio::time::timeout(inner.config.idle_timeout, async {
                inner.receiver.lock().await.recv().await
            }) => match received {
                Ok(Some(task)) => Next::Task(task),
                Ok(None) => Next::Stop,
                Err(_) => Next::Idle,
            },
        };

        let task = {
            let mut state = lock(&inner.state);
            state.idle -= 1;
            match next {
                Next::Task(task) => {
                    state.busy += 1;
                    task
                }
                // Queued work keeps the worker even above `min_workers`.
                Next::Idle
                    if state.workers <= inner.config.min_workers || inner.pending() > 0 =>
                {
                    continue;
                }
                Next::Idle | Next::Stop => {
                    state.workers -= 1;
                    inner.workers.send_replace(state.workers);
                    debug!(pool = %inner.name, workers = state.workers, "Worker exited");
                    return;
                }
            }
        };

        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(pool = %inner.name, "Task panicked");
        }
        lock(&inner.state).busy -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{ENV_MUTEX, EnvGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn small(min: usize, max: usize, queue: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: min,
            max_workers: max,
            idle_timeout: Duration::from_millis(50),
            task_queue_len: queue,
        }
    }

    #[test]
    fn test_profiles() {
        let light = WorkerPoolConfig::from_profile(LoadProfile::Light).unwrap();
        assert_eq!(light.max_workers, 100);
        let heavy = WorkerPoolConfig::from_profile(LoadProfile::Heavy).unwrap();
        assert_eq!(heavy.min_workers, 50);
        assert_eq!(heavy.task_queue_len, 20_000);
    }

    #[test]
    fn test_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("WP_WORKERS_MAX");
        guard.set("WP_WORKERS_MIN", "3");
        guard.set("WP_WORKERS_IDLE_TIMEOUT_MS", "250");
        guard.remove("WP_TASK_QUEUE_LEN");

        let config = WorkerPoolConfig::from_env().unwrap();
        assert_eq!(config.min_workers, 3);
        assert_eq!(config.max_workers, 10_000);
        assert_eq!(config.idle_timeout, Duration::from_millis(250));

        guard.set("WP_TASK_QUEUE_LEN", "lots");
        assert!(matches!(
            WorkerPoolConfig::from_env(),
            Err(ConfigError::Invalid("WP_TASK_QUEUE_LEN", _))
        ));
    }

    #[tokio::test]
    async fn test_runs_tasks() {
        let pool = WorkerPool::new("test", small(0, 4, 16));
        let done = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        for _ in 0..10 {
            let done = done.clone();
            let tx = tx.clone();
            pool.submit(Box::pin(async move {
                if done.fetch_add(1, Ordering::SeqCst) + 1 == 10
                    && let Some(tx) = tx.lock().unwrap().take()
                {
                    let _ = tx.send(());
                }
            }))
            .unwrap();
        }
        rx.await.unwrap();
        assert!(pool.workers() <= 4);
        pool.stop().await;
        assert_eq!(pool.workers(), 0);
    }

    #[tokio::test]
    async fn test_idle_workers_shrink_to_min() {
        let pool = WorkerPool::new("test", small(1, 8, 16));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        for _ in 0..3 {
            let mut release = release_rx.clone();
            pool.submit(Box::pin(async move {
                let _ = release.wait_for(|r| *r).await;
            }))
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.workers(), 3);
        assert_eq!(pool.load_percentage(), 37);

        release_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.workers(), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_and_stopped_pool() {
        let pool = WorkerPool::new("test", small(0, 1, 1));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let blocker = |mut release: watch::Receiver<bool>| -> Task {
            Box::pin(async move {
                let _ = release.wait_for(|r| *r).await;
            })
        };

        pool.submit(blocker(release_rx.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.submit(blocker(release_rx.clone())).unwrap();
        assert_eq!(pool.free_slots(), 0);
        assert!(matches!(
            pool.submit(blocker(release_rx.clone())),
            Err(StatefunError::PoolFull(_))
        ));

        release_tx.send_replace(true);
        pool.stop().await;
        assert!(matches!(
            pool.submit(Box::pin(async {})),
            Err(StatefunError::PoolStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_panicking_task_keeps_worker() {
        let pool = WorkerPool::new("test", small(1, 1, 4));
        pool.submit(Box::pin(async { panic!("boom") })).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(Box::pin(async move {
            let _ = tx.send(());
        }))
        .unwrap();
        rx.await.unwrap();
        assert_eq!(pool.workers(), 1);
        pool.stop().await;
    }
}
