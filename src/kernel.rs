use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::balancer::{Assignment, BalancerError, LoadBalancer};
use crate::cache::DynamicCache;
use crate::events::{EventRegistry, KernelEvent};
use crate::metrics::{derive_metrics, PerformanceSample};
use crate::pool::{PoolConfig, PoolError, ThreadPool};
use crate::preload::PreloadManager;
use crate::sync;
use crate::task::{KernelMetrics, TaskDescriptor, TaskId, MAX_PRIORITY};

const DEFAULT_CACHE_CAPACITY: usize = 128;
const PARENT_POOL_GROW_LOAD: f64 = 0.8;
const PARENT_POOL_SHRINK_LOAD: f64 = 0.3;
const PARENT_POOL_FLOOR: usize = 2;
const PARENT_CACHE_FLOOR: usize = 16;

static KERNEL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel {id} is not running (state: {state})")]
    NotRunning { id: String, state: &'static str },
    #[error("kernel {id} is not a parent kernel")]
    NotParent { id: String },
    #[error("kernel {parent} has no child kernel {child}")]
    UnknownChild { parent: String, child: String },
    #[error("kernel {id} has no load balancer attached")]
    NoBalancer { id: String },
    #[error("kernel {id} has no preload manager attached")]
    NoPreload { id: String },
    #[error("task processing failed on kernel {id}: {reason}")]
    ProcessingFailed { id: String, reason: String },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

/// Engine specialization; drives the workload-efficiency multipliers and
/// gates parent-only operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    Parent,
    Micro,
    Smart,
    Computational,
    Architectural,
    Orchestration,
    Crypto,
}

impl KernelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelKind::Parent => "parent",
            KernelKind::Micro => "micro",
            KernelKind::Smart => "smart",
            KernelKind::Computational => "computational",
            KernelKind::Architectural => "architectural",
            KernelKind::Orchestration => "orchestration",
            KernelKind::Crypto => "crypto",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(KernelKind::Parent),
            "micro" => Some(KernelKind::Micro),
            "smart" => Some(KernelKind::Smart),
            "computational" | "core" => Some(KernelKind::Computational),
            "architectural" => Some(KernelKind::Architectural),
            "orchestration" => Some(KernelKind::Orchestration),
            "crypto" => Some(KernelKind::Crypto),
            _ => None,
        }
    }

    /// Per-class efficiency multipliers (cpu, io, memory, network).
    pub fn workload_multipliers(&self) -> (f64, f64, f64, f64) {
        match self {
            KernelKind::Computational => (1.2, 1.0, 1.0, 1.0),
            KernelKind::Micro => (0.9, 1.1, 1.0, 1.0),
            KernelKind::Architectural => (1.0, 1.0, 1.15, 1.0),
            KernelKind::Orchestration => (1.0, 1.0, 1.0, 1.25),
            _ => (1.0, 1.0, 1.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Created,
    Initialized,
    Running,
    Paused,
    Stopped,
}

impl KernelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelState::Created => "created",
            KernelState::Initialized => "initialized",
            KernelState::Running => "running",
            KernelState::Paused => "paused",
            KernelState::Stopped => "stopped",
        }
    }
}

pub type TaskCallback = Arc<dyn Fn(&TaskDescriptor) + Send + Sync>;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueEntry {
    priority: u8,
    sequence: u64,
    task_id: TaskId,
    job: Job,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match self.priority.cmp(&other.priority) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

struct KernelShared {
    id: String,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    task_ready: Condvar,
    cancelled: Mutex<HashSet<TaskId>>,
    state: RwLock<KernelState>,
    dispatch_stop: AtomicBool,
}

/// Builder collecting kernel configuration before construction.
pub struct KernelBuilder {
    kind: KernelKind,
    id: Option<String>,
    cache_capacity: usize,
    cache_ttl: Duration,
    pool_config: PoolConfig,
}

impl KernelBuilder {
    pub fn new(kind: KernelKind) -> Self {
        Self {
            kind,
            id: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: Duration::ZERO,
            pool_config: PoolConfig::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn build(self) -> Result<Arc<Kernel>, KernelError> {
        let id = self.id.unwrap_or_else(|| {
            format!(
                "{}_{}",
                self.kind.as_str(),
                KERNEL_SEQ.fetch_add(1, Ordering::Relaxed)
            )
        });
        let pool = Arc::new(ThreadPool::new(self.pool_config)?);
        let cache = Arc::new(DynamicCache::with_default_ttl(
            self.cache_capacity,
            self.cache_ttl,
        ));
        Ok(Arc::new(Kernel {
            shared: Arc::new(KernelShared {
                id,
                queue: Mutex::new(BinaryHeap::new()),
                task_ready: Condvar::new(),
                cancelled: Mutex::new(HashSet::new()),
                state: RwLock::new(KernelState::Created),
                dispatch_stop: AtomicBool::new(false),
            }),
            kind: self.kind,
            cache,
            pool,
            preload: RwLock::new(None),
            balancer: RwLock::new(None),
            events: EventRegistry::new(),
            task_callback: RwLock::new(None),
            perf: Mutex::new(PerformanceSample::default()),
            last_metrics: Mutex::new(KernelMetrics::default()),
            next_task_id: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
            processed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            children: RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        }))
    }
}

/// Specialized worker engine owning a cache, a thread pool, and a
/// prioritized task queue with tombstone cancellation.
///
/// Lifecycle: `Created → Initialized → Running ⇄ Paused → Stopped`;
/// `pause` gates new task starts only, already-running closures finish.
pub struct Kernel {
    shared: Arc<KernelShared>,
    kind: KernelKind,
    cache: Arc<DynamicCache<String, Vec<u8>>>,
    pool: Arc<ThreadPool>,
    preload: RwLock<Option<Arc<PreloadManager>>>,
    balancer: RwLock<Option<Weak<LoadBalancer>>>,
    events: EventRegistry,
    task_callback: RwLock<Option<TaskCallback>>,
    perf: Mutex<PerformanceSample>,
    last_metrics: Mutex<KernelMetrics>,
    next_task_id: AtomicU64,
    next_sequence: AtomicU64,
    processed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    children: RwLock<Vec<Arc<Kernel>>>,
    pending: Mutex<Vec<TaskDescriptor>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    pub fn builder(kind: KernelKind) -> KernelBuilder {
        KernelBuilder::new(kind)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn state(&self) -> KernelState {
        *sync::read(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == KernelState::Running
    }

    pub fn cache(&self) -> &Arc<DynamicCache<String, Vec<u8>>> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn processed_tasks(&self) -> u64 {
        self.processed_tasks.load(Ordering::Relaxed)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks.load(Ordering::Relaxed)
    }

    /// Bring the kernel to `Running`, starting the dispatcher and the cache
    /// sweeper. Safe to call on a stopped kernel (used by `reset`).
    pub fn initialize(&self) -> Result<(), KernelError> {
        {
            let mut state = sync::write(&self.shared.state);
            match *state {
                KernelState::Created | KernelState::Stopped => {
                    *state = KernelState::Initialized;
                }
                _ => return Ok(()),
            }
        }
        if self.pool.is_stopped() {
            self.pool.restart()?;
        }
        self.cache.start_cleanup();
        self.spawn_dispatcher();
        *sync::write(&self.shared.state) = KernelState::Running;
        info!(kernel = %self.shared.id, kind = self.kind.as_str(), "kernel running");
        Ok(())
    }

    /// Stop accepting and dispatching work, drain running tasks, release the
    /// dispatcher and sweeper threads. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = sync::write(&self.shared.state);
            if *state == KernelState::Stopped {
                return;
            }
            *state = KernelState::Stopped;
        }
        self.shared.dispatch_stop.store(true, Ordering::Release);
        self.shared.task_ready.notify_all();
        // The pool wakes a dispatcher blocked on queue backpressure.
        self.pool.stop();
        if let Some(handle) = sync::lock(&self.dispatcher).take() {
            let _ = handle.join();
        }
        self.cache.stop_cleanup();
        sync::lock(&self.shared.queue).clear();
        sync::lock(&self.shared.cancelled).clear();
        info!(kernel = %self.shared.id, "kernel stopped");
    }

    /// `shutdown` followed by `initialize`, preserving the id. The cache is
    /// cleared; counters and callbacks survive.
    pub fn reset(&self) -> Result<(), KernelError> {
        self.shutdown();
        self.cache.clear();
        self.initialize()
    }

    /// Block new task starts; queueing stays open and running tasks finish.
    pub fn pause(&self) -> Result<(), KernelError> {
        let mut state = sync::write(&self.shared.state);
        match *state {
            KernelState::Running => {
                *state = KernelState::Paused;
                debug!(kernel = %self.shared.id, "kernel paused");
                Ok(())
            }
            other => Err(KernelError::NotRunning {
                id: self.shared.id.clone(),
                state: other.as_str(),
            }),
        }
    }

    pub fn resume(&self) -> Result<(), KernelError> {
        {
            let mut state = sync::write(&self.shared.state);
            match *state {
                KernelState::Paused => *state = KernelState::Running,
                other => {
                    return Err(KernelError::NotRunning {
                        id: self.shared.id.clone(),
                        state: other.as_str(),
                    })
                }
            }
        }
        self.shared.task_ready.notify_all();
        debug!(kernel = %self.shared.id, "kernel resumed");
        Ok(())
    }

    /// Enqueue a raw closure at the given priority. Allowed while paused;
    /// dispatch waits for `resume`.
    pub fn schedule<F>(&self, job: F, priority: u8) -> Result<TaskId, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        if !matches!(state, KernelState::Running | KernelState::Paused) {
            return Err(KernelError::NotRunning {
                id: self.shared.id.clone(),
                state: state.as_str(),
            });
        }
        let task_id = TaskId::new(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        sync::lock(&self.shared.queue).push(QueueEntry {
            priority: priority.min(MAX_PRIORITY),
            sequence,
            task_id,
            job: Box::new(job),
        });
        self.shared.task_ready.notify_one();
        Ok(task_id)
    }

    /// Enqueue a descriptor; its worker closure runs `process_task`.
    pub fn schedule_descriptor(self: &Arc<Self>, task: TaskDescriptor) -> Result<TaskId, KernelError> {
        let kernel = Arc::downgrade(self);
        let priority = task.priority;
        self.schedule(
            move || {
                if let Some(kernel) = kernel.upgrade() {
                    let _ = kernel.process_task(&task);
                }
            },
            priority,
        )
    }

    /// Tombstone a queued task: it will be skipped at dispatch. Does not
    /// interrupt a closure that already started.
    pub fn cancel(&self, task_id: TaskId) {
        sync::lock(&self.shared.cancelled).insert(task_id);
        trace!(kernel = %self.shared.id, task = task_id.raw(), "task cancelled");
    }

    /// Synchronous task handler: invoke the installed callback, store the
    /// payload, refresh metrics, and emit `task_processed` / `task_failed`.
    pub fn process_task(&self, task: &TaskDescriptor) -> Result<(), KernelError> {
        if self.state() != KernelState::Running {
            let error = format!("kernel {} is not running", self.shared.id);
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            self.events
                .emit(&self.shared.id, &KernelEvent::TaskFailed { error });
            return Err(KernelError::NotRunning {
                id: self.shared.id.clone(),
                state: self.state().as_str(),
            });
        }

        let callback = sync::read(&self.task_callback).clone();
        if let Some(callback) = callback {
            let descriptor = task.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(&descriptor))).is_err() {
                let reason = "task callback panicked".to_string();
                self.failed_tasks.fetch_add(1, Ordering::Relaxed);
                self.events.emit(
                    &self.shared.id,
                    &KernelEvent::TaskFailed {
                        error: reason.clone(),
                    },
                );
                return Err(KernelError::ProcessingFailed {
                    id: self.shared.id.clone(),
                    reason,
                });
            }
        }

        self.cache.put(task.cache_key(), task.payload.clone());
        self.refresh_metrics();
        self.processed_tasks.fetch_add(1, Ordering::Relaxed);
        self.events.emit(
            &self.shared.id,
            &KernelEvent::TaskProcessed { task: task.clone() },
        );
        Ok(())
    }

    pub fn set_task_callback<F>(&self, callback: F)
    where
        F: Fn(&TaskDescriptor) + Send + Sync + 'static,
    {
        *sync::write(&self.task_callback) = Some(Arc::new(callback));
    }

    pub fn set_event_callback<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&str, &KernelEvent) + Send + Sync + 'static,
    {
        self.events.set(event, handler);
    }

    pub fn remove_event_callback(&self, event: &str) {
        self.events.remove(event);
    }

    pub fn trigger_event(&self, name: impl Into<String>, detail: serde_json::Value) {
        self.events.emit(
            &self.shared.id,
            &KernelEvent::Custom {
                name: name.into(),
                detail,
            },
        );
    }

    pub fn set_preload(&self, preload: Arc<PreloadManager>) {
        *sync::write(&self.preload) = Some(preload);
        debug!(kernel = %self.shared.id, "preload manager attached");
    }

    /// Prime the cache with every key the preload manager can resolve.
    /// Emits `warmup_completed` with the entry count, or `warmup_failed`.
    pub fn warmup_from_preload(&self) -> Result<usize, KernelError> {
        let preload = match sync::read(&self.preload).clone() {
            Some(preload) => preload,
            None => {
                let error = format!("kernel {} has no preload manager", self.shared.id);
                warn!("{error}");
                self.events
                    .emit(&self.shared.id, &KernelEvent::WarmupFailed { error });
                return Err(KernelError::NoPreload {
                    id: self.shared.id.clone(),
                });
            }
        };

        let keys = preload.get_all_keys();
        let mut loaded = 0usize;
        for key in &keys {
            if let Some(payload) = preload.get_data_for_key(key) {
                self.cache.put(key.clone(), payload);
                loaded += 1;
            }
        }
        info!(kernel = %self.shared.id, loaded, "cache warm-up complete");
        self.events.emit(
            &self.shared.id,
            &KernelEvent::WarmupCompleted { entries: loaded },
        );
        Ok(loaded)
    }

    /// Attach a balancer through a weak handle and announce readiness.
    pub fn set_load_balancer(&self, balancer: &Arc<LoadBalancer>) {
        *sync::write(&self.balancer) = Some(Arc::downgrade(balancer));
        self.events.emit(
            &self.shared.id,
            &KernelEvent::LoadBalancerReady {
                kernel_id: self.shared.id.clone(),
            },
        );
    }

    pub fn load_balancer(&self) -> Option<Arc<LoadBalancer>> {
        sync::read(&self.balancer)
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    /// Inject a fresh performance reading (host probe or test fixture).
    pub fn set_performance_sample(&self, sample: PerformanceSample) {
        *sync::lock(&self.perf) = sample;
    }

    /// Derive a fresh metric snapshot from the live feeds.
    pub fn extended_metrics(&self) -> KernelMetrics {
        self.refresh_metrics()
    }

    /// Last snapshot derived; may lag the live counters by one update.
    pub fn last_metrics(&self) -> KernelMetrics {
        sync::lock(&self.last_metrics).clone()
    }

    fn refresh_metrics(&self) -> KernelMetrics {
        let perf = *sync::lock(&self.perf);
        let queued = sync::lock(&self.shared.queue).len();
        let derived = derive_metrics(
            self.kind,
            &perf,
            &self.cache.metrics(),
            &self.pool.metrics(),
            queued,
        );
        *sync::lock(&self.last_metrics) = derived.clone();
        derived
    }

    // Parent-kernel surface.

    pub fn add_child(&self, child: Arc<Kernel>) -> Result<(), KernelError> {
        self.require_parent()?;
        info!(kernel = %self.shared.id, child = %child.id(), "child kernel attached");
        sync::write(&self.children).push(child);
        Ok(())
    }

    pub fn remove_child(&self, child_id: &str) -> Result<(), KernelError> {
        self.require_parent()?;
        let mut children = sync::write(&self.children);
        let before = children.len();
        children.retain(|child| child.id() != child_id);
        if children.len() == before {
            return Err(KernelError::UnknownChild {
                parent: self.shared.id.clone(),
                child: child_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn children(&self) -> Vec<Arc<Kernel>> {
        sync::read(&self.children).clone()
    }

    /// Queue a descriptor for the next `orchestrate_tasks` round.
    pub fn submit_task(&self, task: TaskDescriptor) -> Result<(), KernelError> {
        self.require_parent()?;
        sync::lock(&self.pending).push(task);
        Ok(())
    }

    /// Route the given tasks across the children via the attached balancer.
    pub fn balance_load(&self, tasks: Vec<TaskDescriptor>) -> Result<Vec<Assignment>, KernelError> {
        self.require_parent()?;
        let balancer = self.load_balancer().ok_or_else(|| KernelError::NoBalancer {
            id: self.shared.id.clone(),
        })?;
        let children = self.children();
        let metrics: Vec<KernelMetrics> = children
            .iter()
            .map(|child| child.extended_metrics())
            .collect();
        Ok(balancer.balance(&children, &tasks, &metrics)?)
    }

    /// Drain the pending descriptors and balance them across the children.
    pub fn orchestrate_tasks(&self) -> Result<Vec<Assignment>, KernelError> {
        self.require_parent()?;
        let tasks = std::mem::take(&mut *sync::lock(&self.pending));
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        self.balance_load(tasks)
    }

    /// Aggregate child metrics and adapt the pool and cache: the pool grows
    /// by two workers above 0.8 average load and gives one back below 0.3
    /// (floor 2); the cache follows its hit rate.
    pub fn update_metrics(&self) -> KernelMetrics {
        if self.kind != KernelKind::Parent {
            return self.refresh_metrics();
        }
        let children = self.children();
        if !children.is_empty() {
            let total_load: f64 = children
                .iter()
                .map(|child| child.extended_metrics().load)
                .sum();
            let avg_load = total_load / children.len() as f64;

            let total_threads = self.pool.metrics().total_threads;
            if avg_load > PARENT_POOL_GROW_LOAD {
                self.pool.set_target_threads(total_threads + 2);
                debug!(kernel = %self.shared.id, avg_load, "parent pool grown");
            } else if avg_load < PARENT_POOL_SHRINK_LOAD && total_threads > PARENT_POOL_FLOOR {
                self.pool
                    .set_target_threads((total_threads - 1).max(PARENT_POOL_FLOOR));
                debug!(kernel = %self.shared.id, avg_load, "parent pool shrunk");
            }

            let cache_metrics = self.cache.metrics();
            let hit_rate = cache_metrics.hit_rate();
            if hit_rate < 0.8 && cache_metrics.hits + cache_metrics.misses > 0 {
                let grown = (cache_metrics.allocated_size as f64 * 1.2).ceil() as usize;
                self.cache.resize(grown);
            } else if hit_rate > 0.95 && cache_metrics.allocated_size > PARENT_CACHE_FLOOR {
                let shrunk = (cache_metrics.allocated_size * 4 / 5).max(PARENT_CACHE_FLOOR);
                self.cache.resize(shrunk);
            }
        }
        self.refresh_metrics()
    }

    fn require_parent(&self) -> Result<(), KernelError> {
        if self.kind != KernelKind::Parent {
            return Err(KernelError::NotParent {
                id: self.shared.id.clone(),
            });
        }
        Ok(())
    }

    fn spawn_dispatcher(&self) {
        let mut slot = sync::lock(&self.dispatcher);
        if slot.is_some() {
            return;
        }
        self.shared.dispatch_stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let pool = Arc::clone(&self.pool);
        *slot = Some(
            std::thread::Builder::new()
                .name(format!("{}-dispatch", self.shared.id))
                .spawn(move || dispatch_loop(shared, pool))
                .expect("spawn kernel dispatcher"),
        );
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pop tasks in priority order (tombstoned ids skipped in O(1)) and forward
/// them to the pool, blocking on queue backpressure to preserve order.
fn dispatch_loop(shared: Arc<KernelShared>, pool: Arc<ThreadPool>) {
    loop {
        let entry = {
            let mut queue = sync::lock(&shared.queue);
            loop {
                if shared.dispatch_stop.load(Ordering::Acquire) {
                    return;
                }
                let paused = *sync::read(&shared.state) == KernelState::Paused;
                if !paused {
                    if let Some(entry) = queue.pop() {
                        break entry;
                    }
                }
                queue = shared
                    .task_ready
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        if sync::lock(&shared.cancelled).remove(&entry.task_id) {
            trace!(kernel = %shared.id, task = entry.task_id.raw(), "dropped cancelled task");
            continue;
        }

        if pool.enqueue_blocking(entry.job).is_err() {
            // Pool stopped underneath us; shutdown is in progress.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload::PreloadConfig;
    use crate::task::TaskClass;
    use std::sync::Mutex as StdMutex;

    fn single_worker_kernel(kind: KernelKind) -> Arc<Kernel> {
        let kernel = Kernel::builder(kind)
            .pool_config(PoolConfig::fixed(1, 64))
            .cache_capacity(64)
            .build()
            .unwrap();
        kernel.initialize().unwrap();
        kernel
    }

    fn wait_until(description: &str, predicate: impl Fn() -> bool) {
        for _ in 0..400 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for: {description}");
    }

    #[test]
    fn lifecycle_runs_pauses_and_stops() {
        let kernel = Kernel::builder(KernelKind::Smart).build().unwrap();
        assert_eq!(kernel.state(), KernelState::Created);
        kernel.initialize().unwrap();
        assert!(kernel.is_running());
        kernel.pause().unwrap();
        assert_eq!(kernel.state(), KernelState::Paused);
        kernel.resume().unwrap();
        kernel.shutdown();
        kernel.shutdown();
        assert_eq!(kernel.state(), KernelState::Stopped);
    }

    #[test]
    fn schedule_requires_an_initialized_kernel() {
        let kernel = Kernel::builder(KernelKind::Micro).build().unwrap();
        let err = kernel.schedule(|| {}, 5).unwrap_err();
        assert!(matches!(err, KernelError::NotRunning { .. }));
    }

    #[test]
    fn priority_order_is_respected_with_fifo_ties() {
        let kernel = single_worker_kernel(KernelKind::Computational);
        kernel.pause().unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        for (name, priority) in [("T1", 1u8), ("T2", 9), ("T3", 5)] {
            let order = Arc::clone(&order);
            kernel
                .schedule(
                    move || {
                        order.lock().unwrap().push(name);
                    },
                    priority,
                )
                .unwrap();
        }
        kernel.resume().unwrap();
        wait_until("three tasks executed", || order.lock().unwrap().len() == 3);
        assert_eq!(*order.lock().unwrap(), vec!["T2", "T3", "T1"]);
    }

    #[test]
    fn same_priority_tasks_run_in_enqueue_order() {
        let kernel = single_worker_kernel(KernelKind::Micro);
        kernel.pause().unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5usize {
            let order = Arc::clone(&order);
            kernel
                .schedule(
                    move || {
                        order.lock().unwrap().push(i);
                    },
                    5,
                )
                .unwrap();
        }
        kernel.resume().unwrap();
        wait_until("five tasks executed", || order.lock().unwrap().len() == 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_tasks_are_skipped_at_dispatch() {
        let kernel = single_worker_kernel(KernelKind::Smart);
        kernel.pause().unwrap();
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let first = {
            let hits = Arc::clone(&hits);
            kernel
                .schedule(
                    move || {
                        hits.lock().unwrap().push("first");
                    },
                    5,
                )
                .unwrap()
        };
        {
            let hits = Arc::clone(&hits);
            kernel
                .schedule(
                    move || {
                        hits.lock().unwrap().push("second");
                    },
                    5,
                )
                .unwrap();
        }
        kernel.cancel(first);
        kernel.resume().unwrap();
        wait_until("second task executed", || !hits.lock().unwrap().is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn process_task_stores_payload_and_emits_event() {
        let kernel = single_worker_kernel(KernelKind::Computational);
        let processed = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&processed);
        kernel.set_event_callback(crate::events::TASK_PROCESSED, move |kernel_id, event| {
            if let KernelEvent::TaskProcessed { task } = event {
                sink.lock().unwrap().push((kernel_id.to_string(), task.priority));
            }
        });

        let task = TaskDescriptor::new(vec![0xAB, 0xCD])
            .with_priority(6)
            .with_class(TaskClass::Cpu)
            .with_enqueued_at_ms(42);
        kernel.process_task(&task).unwrap();

        assert_eq!(kernel.cache().get(&"task_6_42".to_string()), Some(vec![0xAB, 0xCD]));
        assert_eq!(kernel.processed_tasks(), 1);
        let events = processed.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, 6);
    }

    #[test]
    fn process_task_on_stopped_kernel_fails_with_event() {
        let kernel = Kernel::builder(KernelKind::Micro).build().unwrap();
        let failures = Arc::new(StdMutex::new(0usize));
        let sink = Arc::clone(&failures);
        kernel.set_event_callback(crate::events::TASK_FAILED, move |_, _| {
            *sink.lock().unwrap() += 1;
        });

        let err = kernel.process_task(&TaskDescriptor::new(vec![1])).unwrap_err();
        assert!(matches!(err, KernelError::NotRunning { .. }));
        assert_eq!(*failures.lock().unwrap(), 1);
        assert_eq!(kernel.failed_tasks(), 1);
    }

    #[test]
    fn task_callback_panic_is_contained() {
        let kernel = single_worker_kernel(KernelKind::Smart);
        kernel.set_task_callback(|_| panic!("handler exploded"));
        let err = kernel.process_task(&TaskDescriptor::new(vec![1])).unwrap_err();
        assert!(matches!(err, KernelError::ProcessingFailed { .. }));
        assert!(kernel.is_running(), "kernel survives a panicking callback");
    }

    #[test]
    fn warmup_primes_cache_from_preload() {
        let kernel = Kernel::builder(KernelKind::Architectural)
            .cache_capacity(16)
            .pool_config(PoolConfig::fixed(1, 16))
            .build()
            .unwrap();
        kernel.initialize().unwrap();

        let preload = Arc::new(PreloadManager::new(PreloadConfig {
            max_queue_size: 32,
            ..PreloadConfig::default()
        }));
        let mut payloads = Vec::new();
        for i in 0..10 {
            let payload = vec![i as u8; 100];
            preload
                .preload(format!("test_key_{i}"), payload.clone())
                .unwrap();
            payloads.push(payload);
        }
        kernel.set_preload(preload);

        let loaded = kernel.warmup_from_preload().unwrap();
        assert_eq!(loaded, 10);
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(
                kernel.cache().get(&format!("test_key_{i}")),
                Some(payload.clone()),
                "warm entry {i}"
            );
        }
    }

    #[test]
    fn warmup_without_preload_fails_with_event() {
        let kernel = single_worker_kernel(KernelKind::Crypto);
        let failed = Arc::new(StdMutex::new(false));
        let sink = Arc::clone(&failed);
        kernel.set_event_callback(crate::events::WARMUP_FAILED, move |_, _| {
            *sink.lock().unwrap() = true;
        });
        let err = kernel.warmup_from_preload().unwrap_err();
        assert!(matches!(err, KernelError::NoPreload { .. }));
        assert!(*failed.lock().unwrap());
    }

    #[test]
    fn load_balancer_attachment_announces_readiness() {
        let kernel = single_worker_kernel(KernelKind::Orchestration);
        let ready = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&ready);
        kernel.set_event_callback(crate::events::LOADBALANCER_READY, move |_, event| {
            if let KernelEvent::LoadBalancerReady { kernel_id } = event {
                *sink.lock().unwrap() = Some(kernel_id.clone());
            }
        });

        let balancer = Arc::new(LoadBalancer::new());
        kernel.set_load_balancer(&balancer);
        assert_eq!(ready.lock().unwrap().as_deref(), Some(kernel.id()));
        assert!(kernel.load_balancer().is_some());
    }

    #[test]
    fn child_management_is_parent_only() {
        let parent = single_worker_kernel(KernelKind::Parent);
        let worker = single_worker_kernel(KernelKind::Computational);
        assert!(matches!(
            worker.add_child(Arc::clone(&parent)),
            Err(KernelError::NotParent { .. })
        ));

        parent.add_child(Arc::clone(&worker)).unwrap();
        assert_eq!(parent.children().len(), 1);
        parent.remove_child(worker.id()).unwrap();
        assert!(parent.children().is_empty());
    }

    #[test]
    fn parent_orchestrates_pending_tasks_onto_children() {
        let parent = single_worker_kernel(KernelKind::Parent);
        let child_a = single_worker_kernel(KernelKind::Computational);
        let child_b = single_worker_kernel(KernelKind::Micro);
        parent.add_child(Arc::clone(&child_a)).unwrap();
        parent.add_child(Arc::clone(&child_b)).unwrap();

        let balancer = Arc::new(LoadBalancer::new());
        parent.set_load_balancer(&balancer);

        for i in 0..4u8 {
            parent
                .submit_task(TaskDescriptor::new(vec![i]).with_priority(5))
                .unwrap();
        }
        let assignments = parent.orchestrate_tasks().unwrap();
        assert_eq!(assignments.len(), 4);

        wait_until("children processed the tasks", || {
            child_a.processed_tasks() + child_b.processed_tasks() == 4
        });
    }

    #[test]
    fn parent_update_metrics_adapts_the_pool() {
        let parent = Kernel::builder(KernelKind::Parent)
            .pool_config(PoolConfig {
                min_threads: 2,
                max_threads: 16,
                queue_size: 32,
                stack_size: 2 * 1024 * 1024,
                affinity: crate::pool::AffinityHint::None,
            })
            .build()
            .unwrap();
        parent.initialize().unwrap();
        let child = single_worker_kernel(KernelKind::Computational);
        child.set_performance_sample(PerformanceSample {
            cpu_usage: 0.95,
            ..PerformanceSample::default()
        });
        parent.add_child(child).unwrap();

        let before = parent.pool().metrics().total_threads;
        parent.update_metrics();
        wait_until("pool grew", || {
            parent.pool().metrics().total_threads > before
        });
    }

    #[test]
    fn reset_preserves_identity_and_recovers() {
        let kernel = single_worker_kernel(KernelKind::Smart);
        let id = kernel.id().to_string();
        kernel.cache().put("stale".into(), vec![1]);
        kernel.reset().unwrap();
        assert_eq!(kernel.id(), id);
        assert!(kernel.is_running());
        assert_eq!(kernel.cache().get(&"stale".to_string()), None);
        kernel.schedule(|| {}, 5).unwrap();
    }

    #[test]
    fn custom_events_reach_registered_handlers() {
        let kernel = single_worker_kernel(KernelKind::Crypto);
        let seen = Arc::new(StdMutex::new(None));
        let sink = Arc::clone(&seen);
        kernel.set_event_callback("tunnel_probe", move |_, event| {
            if let KernelEvent::Custom { detail, .. } = event {
                *sink.lock().unwrap() = Some(detail.clone());
            }
        });
        kernel.trigger_event("tunnel_probe", serde_json::json!({"rtt_ms": 3}));
        assert_eq!(
            *seen.lock().unwrap(),
            Some(serde_json::json!({"rtt_ms": 3}))
        );
    }
}
