use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::clock::FabricClock;
use crate::sync;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreloadError {
    #[error("invalid preload configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("preload queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadConfig {
    pub max_queue_size: usize,
    pub max_concurrent_tasks: usize,
    pub prediction_threshold: f64,
    pub adaptive_prediction: bool,
    pub metrics_collection: bool,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 128,
            max_concurrent_tasks: 1,
            prediction_threshold: 0.5,
            adaptive_prediction: true,
            metrics_collection: true,
        }
    }
}

impl PreloadConfig {
    pub fn validate(&self) -> Result<(), PreloadError> {
        if self.max_queue_size == 0 {
            return Err(PreloadError::InvalidConfig {
                reason: "max_queue_size must be at least 1".into(),
            });
        }
        if self.max_concurrent_tasks == 0 {
            return Err(PreloadError::InvalidConfig {
                reason: "max_concurrent_tasks must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.prediction_threshold) {
            return Err(PreloadError::InvalidConfig {
                reason: "prediction_threshold must be within [0, 1]".into(),
            });
        }
        Ok(())
    }
}

/// Queued preload job awaiting materialization.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub created_at_ms: u64,
    pub priority: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreloadMetrics {
    pub queue_size: usize,
    pub active_tasks: usize,
    pub efficiency: f64,
    pub prediction_accuracy: f64,
}

#[derive(Default)]
struct PreloadState {
    queue: VecDeque<PreloadEntry>,
    store: HashMap<String, Vec<u8>>,
    history: HashSet<String>,
    active_tasks: usize,
    total_jobs: u64,
    successful_jobs: u64,
    prediction_count: u64,
    correct_predictions: u64,
}

struct PreloadShared {
    state: Mutex<PreloadState>,
    job_ready: Condvar,
    stop: AtomicBool,
}

/// Key→data store fed by a bounded job queue and one background worker that
/// materializes future cache entries and learns the access history used for
/// predictions.
pub struct PreloadManager {
    shared: Arc<PreloadShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: PreloadConfig,
    clock: FabricClock,
}

impl PreloadManager {
    pub fn new(config: PreloadConfig) -> Self {
        Self {
            shared: Arc::new(PreloadShared {
                state: Mutex::new(PreloadState::default()),
                job_ready: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            config,
            clock: FabricClock::new(),
        }
    }

    /// Validate configuration and spawn the background worker. Idempotent.
    pub fn initialize(&self) -> Result<(), PreloadError> {
        self.config.validate()?;
        let mut slot = sync::lock(&self.worker);
        if slot.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *slot = Some(
            std::thread::Builder::new()
                .name("preload-worker".into())
                .spawn(move || worker_loop(shared))
                .expect("spawn preload worker"),
        );
        debug!("preload manager initialized");
        Ok(())
    }

    /// Queue a key/payload pair at the default priority (1.0).
    pub fn preload(&self, key: impl Into<String>, payload: Vec<u8>) -> Result<(), PreloadError> {
        self.preload_with_priority(key, payload, 1.0)
    }

    /// Alias kept for callers that feed the store directly.
    pub fn add_data(&self, key: impl Into<String>, payload: Vec<u8>) -> Result<(), PreloadError> {
        self.preload(key, payload)
    }

    /// Queue a job; on a full queue, a strictly higher-priority job displaces
    /// the lowest-priority queued entry (FIFO tiebreak), otherwise the caller
    /// gets `QueueFull` and decides whether to retry or drop.
    pub fn preload_with_priority(
        &self,
        key: impl Into<String>,
        payload: Vec<u8>,
        priority: f64,
    ) -> Result<(), PreloadError> {
        let key = key.into();
        let entry = PreloadEntry {
            key,
            payload,
            created_at_ms: self.clock.now_ms(),
            priority,
        };
        {
            let mut state = sync::lock(&self.shared.state);
            if state.queue.len() >= self.config.max_queue_size {
                let victim = state
                    .queue
                    .iter()
                    .enumerate()
                    .min_by(|(ia, a), (ib, b)| {
                        a.priority
                            .partial_cmp(&b.priority)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(ia.cmp(ib))
                    })
                    .map(|(index, queued)| (index, queued.priority));
                match victim {
                    Some((index, lowest)) if entry.priority > lowest => {
                        let dropped = state.queue.remove(index);
                        trace!(key = ?dropped.map(|d| d.key), "preload queue displaced entry");
                    }
                    _ => {
                        return Err(PreloadError::QueueFull {
                            capacity: self.config.max_queue_size,
                        })
                    }
                }
            }
            trace!(key = %entry.key, size = entry.payload.len(), "preload job queued");
            state.queue.push_back(entry);
        }
        self.shared.job_ready.notify_one();
        Ok(())
    }

    /// Would the given key be accessed next, judged by the access history.
    /// Every call feeds the accuracy counters.
    pub fn predict_next_access(&self, key: &str) -> bool {
        let mut state = sync::lock(&self.shared.state);
        state.prediction_count += 1;
        let predicted = state.history.contains(key);
        if predicted {
            state.correct_predictions += 1;
        }
        predicted
    }

    /// Union of queued keys, materialized keys, and the access history.
    pub fn get_all_keys(&self) -> Vec<String> {
        let state = sync::lock(&self.shared.state);
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for entry in &state.queue {
            if seen.insert(entry.key.clone()) {
                keys.push(entry.key.clone());
            }
        }
        for key in state.store.keys() {
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
        for key in &state.history {
            if seen.insert(key.clone()) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Resolve a key: queued payload first, then the materialized store, and
    /// finally the synthesized loader.
    pub fn get_data_for_key(&self, key: &str) -> Option<Vec<u8>> {
        let mut state = sync::lock(&self.shared.state);
        if let Some(entry) = state.queue.iter().find(|entry| entry.key == key) {
            return Some(entry.payload.clone());
        }
        if let Some(payload) = state.store.get(key) {
            return Some(payload.clone());
        }
        let payload = load_data(&mut state, key);
        Some(payload)
    }

    pub fn metrics(&self) -> PreloadMetrics {
        let state = sync::lock(&self.shared.state);
        let efficiency = if state.total_jobs == 0 {
            0.0
        } else {
            state.successful_jobs as f64 / state.total_jobs as f64
        };
        let prediction_accuracy = if state.prediction_count == 0 {
            0.0
        } else {
            state.correct_predictions as f64 / state.prediction_count as f64
        };
        PreloadMetrics {
            queue_size: state.queue.len(),
            active_tasks: state.active_tasks,
            efficiency,
            prediction_accuracy,
        }
    }

    pub fn configuration(&self) -> &PreloadConfig {
        &self.config
    }

    /// Stop and join the worker; queued jobs already dequeued finish first.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.job_ready.notify_all();
        if let Some(handle) = sync::lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PreloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Produce the payload for a key when nothing was staged: synthesized from
/// the key bytes, recorded into the history and counters.
fn load_data(state: &mut PreloadState, key: &str) -> Vec<u8> {
    let payload = key.as_bytes().to_vec();
    state.history.insert(key.to_string());
    state.total_jobs += 1;
    state.successful_jobs += 1;
    payload
}

fn worker_loop(shared: Arc<PreloadShared>) {
    loop {
        let entry = {
            let mut state = sync::lock(&shared.state);
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                if let Some(entry) = state.queue.pop_front() {
                    state.active_tasks += 1;
                    break entry;
                }
                state = shared
                    .job_ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        let mut state = sync::lock(&shared.state);
        if entry.payload.is_empty() {
            warn!(key = %entry.key, "preload job had no payload; synthesizing");
            let _ = load_data(&mut state, &entry.key);
        } else {
            state.store.insert(entry.key.clone(), entry.payload);
            state.history.insert(entry.key.clone());
            state.total_jobs += 1;
            state.successful_jobs += 1;
        }
        state.active_tasks -= 1;
        trace!(key = %entry.key, "preload job materialized");
    }
}
