use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::sync;

const DEFAULT_QUEUE_SIZE: usize = 256;
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid thread pool configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("thread pool is stopped")]
    Stopped,
    #[error("restart requires a stopped pool")]
    NotStopped,
}

/// Advisory placement hint for heterogeneous hardware. Ignored silently when
/// the platform offers no way to honor it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityHint {
    #[default]
    None,
    Performance,
    Efficiency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub queue_size: usize,
    pub stack_size: usize,
    pub affinity: AffinityHint,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            min_threads: 2.min(cores),
            max_threads: cores,
            queue_size: DEFAULT_QUEUE_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            affinity: AffinityHint::None,
        }
    }
}

impl PoolConfig {
    pub fn fixed(threads: usize, queue_size: usize) -> Self {
        Self {
            min_threads: threads.max(1),
            max_threads: threads.max(1),
            queue_size: queue_size.max(1),
            stack_size: DEFAULT_STACK_SIZE,
            affinity: AffinityHint::None,
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_threads == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "min_threads must be at least 1".into(),
            });
        }
        if self.min_threads > self.max_threads {
            return Err(PoolError::InvalidConfig {
                reason: format!(
                    "min_threads {} exceeds max_threads {}",
                    self.min_threads, self.max_threads
                ),
            });
        }
        if self.queue_size == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "queue_size must be at least 1".into(),
            });
        }
        if self.stack_size == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "stack_size must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub active_threads: usize,
    pub queue_size: usize,
    pub total_threads: usize,
    pub panicked_tasks: u64,
}

struct PoolState {
    queue: VecDeque<Job>,
    active: usize,
    total: usize,
    target: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    job_ready: Condvar,
    space_ready: Condvar,
    idle: Condvar,
    stopped: AtomicBool,
    queue_capacity: Mutex<usize>,
    panicked: AtomicU64,
}

/// Worker pool draining a bounded FIFO queue of closures.
///
/// Priority is enforced above the pool, at the kernel task queue; within the
/// pool order is strictly FIFO. The worker set is elastic between
/// `min_threads` and `max_threads`: enqueue pressure grows it, idle workers
/// retire down to the target.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: Mutex<PoolConfig>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        apply_affinity_hint(config.affinity);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                total: 0,
                target: config.min_threads,
            }),
            job_ready: Condvar::new(),
            space_ready: Condvar::new(),
            idle: Condvar::new(),
            stopped: AtomicBool::new(false),
            queue_capacity: Mutex::new(config.queue_size),
            panicked: AtomicU64::new(0),
        });
        let pool = Self {
            shared,
            workers: Mutex::new(Vec::new()),
            config: Mutex::new(config),
        };
        pool.spawn_to_target();
        Ok(pool)
    }

    /// Enqueue a closure without blocking; `QueueFull` when the queue already
    /// holds `queue_size` items.
    pub fn enqueue<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        let capacity = *sync::lock(&self.shared.queue_capacity);
        {
            let mut state = sync::lock(&self.shared.state);
            if state.queue.len() >= capacity {
                return Err(PoolError::QueueFull { capacity });
            }
            state.queue.push_back(Box::new(job));
        }
        self.shared.job_ready.notify_one();
        self.grow_if_backlogged();
        Ok(())
    }

    /// Enqueue, waiting for queue space instead of failing. Used by kernel
    /// dispatchers that must preserve dispatch order under backpressure.
    pub fn enqueue_blocking<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let capacity = *sync::lock(&self.shared.queue_capacity);
        let mut state = sync::lock(&self.shared.state);
        loop {
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(PoolError::Stopped);
            }
            if state.queue.len() < capacity {
                state.queue.push_back(Box::new(job));
                drop(state);
                self.shared.job_ready.notify_one();
                self.grow_if_backlogged();
                return Ok(());
            }
            state = self
                .shared
                .space_ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block until the queue is empty and no worker is mid-task.
    pub fn wait_for_completion(&self) {
        let mut state = sync::lock(&self.shared.state);
        while !(state.queue.is_empty() && state.active == 0) {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Stop the pool: running tasks finish, queued closures are discarded,
    /// workers drain and are joined. Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let discarded = {
            let mut state = sync::lock(&self.shared.state);
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        if discarded > 0 {
            debug!(discarded, "thread pool stop discarded queued tasks");
        }
        self.shared.job_ready.notify_all();
        self.shared.space_ready.notify_all();
        let handles: Vec<JoinHandle<()>> = sync::lock(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.idle.notify_all();
    }

    /// Bring a stopped pool back up, honoring any reconfiguration applied
    /// since `stop`.
    pub fn restart(&self) -> Result<(), PoolError> {
        if !self.shared.stopped.load(Ordering::Acquire) {
            return Err(PoolError::NotStopped);
        }
        let config = sync::lock(&self.config).clone();
        config.validate()?;
        {
            let mut state = sync::lock(&self.shared.state);
            state.target = config.min_threads;
        }
        *sync::lock(&self.shared.queue_capacity) = config.queue_size;
        self.shared.stopped.store(false, Ordering::Release);
        self.spawn_to_target();
        Ok(())
    }

    /// Reconfigure; only honored fully once the pool is restarted, except
    /// for the worker target which elastic sizing applies immediately.
    pub fn set_configuration(&self, config: PoolConfig) -> Result<(), PoolError> {
        config.validate()?;
        *sync::lock(&self.config) = config;
        Ok(())
    }

    pub fn configuration(&self) -> PoolConfig {
        sync::lock(&self.config).clone()
    }

    /// Clamp the desired worker count into `[min_threads, max_threads]` and
    /// converge towards it: missing workers are spawned, surplus workers
    /// retire as they go idle.
    pub fn set_target_threads(&self, desired: usize) {
        let (min, max) = {
            let config = sync::lock(&self.config);
            (config.min_threads, config.max_threads)
        };
        let target = desired.clamp(min, max);
        {
            let mut state = sync::lock(&self.shared.state);
            state.target = target;
        }
        self.shared.job_ready.notify_all();
        self.spawn_to_target();
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = sync::lock(&self.shared.state);
        PoolMetrics {
            active_threads: state.active,
            queue_size: state.queue.len(),
            total_threads: state.total,
            panicked_tasks: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    fn grow_if_backlogged(&self) {
        let max = sync::lock(&self.config).max_threads;
        let should_grow = {
            let mut state = sync::lock(&self.shared.state);
            if state.queue.len() > state.total.saturating_sub(state.active)
                && state.target < max
            {
                state.target += 1;
                true
            } else {
                false
            }
        };
        if should_grow {
            self.spawn_to_target();
        }
    }

    fn spawn_to_target(&self) {
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let stack_size = sync::lock(&self.config).stack_size;
        loop {
            {
                let mut state = sync::lock(&self.shared.state);
                if state.total >= state.target {
                    break;
                }
                state.total += 1;
            }
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("fabric-worker".into())
                .stack_size(stack_size)
                .spawn(move || worker_loop(shared));
            match spawned {
                Ok(handle) => sync::lock(&self.workers).push(handle),
                Err(err) => {
                    sync::lock(&self.shared.state).total -= 1;
                    warn!(%err, "failed to spawn pool worker");
                    break;
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = sync::lock(&shared.state);
            loop {
                if shared.stopped.load(Ordering::Acquire) {
                    state.total -= 1;
                    return;
                }
                if state.total > state.target && state.queue.is_empty() {
                    state.total -= 1;
                    trace!("surplus pool worker retiring");
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break job;
                }
                state = shared
                    .job_ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        shared.space_ready.notify_one();

        let outcome = catch_unwind(AssertUnwindSafe(job));
        if let Err(panic) = outcome {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            error!(%message, "worker task panicked; pool continues");
        }

        let mut state = sync::lock(&shared.state);
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            shared.idle.notify_all();
        }
    }
}

fn apply_affinity_hint(hint: AffinityHint) {
    if hint != AffinityHint::None {
        trace!(?hint, "core affinity hint is advisory and not applied on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn rejects_invalid_configuration() {
        let config = PoolConfig {
            min_threads: 4,
            max_threads: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(
            ThreadPool::new(config),
            Err(PoolError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn executes_enqueued_tasks() {
        let pool = ThreadPool::new(PoolConfig::fixed(2, 16)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait_for_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn enqueue_fails_when_queue_is_full() {
        let pool = ThreadPool::new(PoolConfig::fixed(1, 2)).unwrap();
        let gate = Arc::new(AtomicUsize::new(0));
        let blocker = Arc::clone(&gate);
        pool.enqueue(move || {
            while blocker.load(Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        pool.enqueue(|| {}).unwrap();
        pool.enqueue(|| {}).unwrap();
        let err = pool.enqueue(|| {}).unwrap_err();
        assert_eq!(err, PoolError::QueueFull { capacity: 2 });

        gate.store(1, Ordering::SeqCst);
        pool.wait_for_completion();
    }

    #[test]
    fn stop_is_idempotent_and_gates_enqueue() {
        let pool = ThreadPool::new(PoolConfig::fixed(1, 16)).unwrap();
        assert_eq!(pool.restart().unwrap_err(), PoolError::NotStopped);
        pool.stop();
        pool.stop();
        assert_eq!(pool.enqueue(|| {}).unwrap_err(), PoolError::Stopped);
    }

    #[test]
    fn restart_after_stop_accepts_work_again() {
        let pool = ThreadPool::new(PoolConfig::fixed(1, 16)).unwrap();
        pool.stop();
        pool.restart().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.enqueue(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.wait_for_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_order_is_fifo_with_single_worker() {
        let pool = ThreadPool::new(PoolConfig::fixed(1, 32)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..6usize {
            let seen = Arc::clone(&seen);
            pool.enqueue(move || {
                sync::lock(&seen).push(i);
            })
            .unwrap();
        }
        pool.wait_for_completion();
        assert_eq!(*sync::lock(&seen), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let pool = ThreadPool::new(PoolConfig::fixed(1, 16)).unwrap();
        pool.enqueue(|| panic!("worker blew up")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.enqueue(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.wait_for_completion();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().panicked_tasks, 1);
    }

    #[test]
    fn metrics_report_thread_counts() {
        let pool = ThreadPool::new(PoolConfig::fixed(3, 8)).unwrap();
        pool.wait_for_completion();
        let metrics = pool.metrics();
        assert_eq!(metrics.total_threads, 3);
        assert_eq!(metrics.active_threads, 0);
        assert_eq!(metrics.queue_size, 0);
    }
}
