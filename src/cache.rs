use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::FabricClock;
use crate::sync;

/// Default housekeeping interval for expired-entry sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

const SHRINK_HIT_RATE: f64 = 0.95;
const GROW_HIT_RATE: f64 = 0.80;
const GROW_FACTOR: f64 = 1.2;

pub type EvictionCallback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

/// Counters exposed for balancing and auto-resize decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheMetrics {
    pub len: usize,
    pub allocated_size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    // TTL is anchored at the insert; reads advance recency, not lifetime.
    expires_at_ms: Option<u64>,
    stamp: AtomicU64,
}

impl<V> Entry<V> {
    fn is_live(&self, now_ms: u64) -> bool {
        match self.expires_at_ms {
            None => true,
            Some(deadline) => now_ms < deadline,
        }
    }
}

struct CacheState<K, V> {
    map: HashMap<K, Entry<V>>,
    allocated: usize,
}

#[derive(Debug, Clone, Copy)]
struct AutoResizePolicy {
    enabled: bool,
    min_size: usize,
    max_size: usize,
}

struct CacheShared<K, V> {
    state: RwLock<CacheState<K, V>>,
    // Approximate recency queue: stale (key, stamp) pairs are skipped at
    // eviction so reads never need the exclusive map lock.
    order: Mutex<VecDeque<(K, u64)>>,
    next_stamp: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    policy: Mutex<AutoResizePolicy>,
    eviction: RwLock<Option<EvictionCallback<K, V>>>,
    cleanup_interval: Mutex<Duration>,
    default_ttl: Option<Duration>,
    stop: AtomicBool,
    sweeper_gate: Mutex<()>,
    sweeper_wake: Condvar,
    clock: FabricClock,
}

impl<K, V> CacheShared<K, V>
where
    K: Eq + Hash + Clone,
{
    fn next_stamp(&self) -> u64 {
        self.next_stamp.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn callback(&self) -> Option<EvictionCallback<K, V>> {
        sync::read(&self.eviction).clone()
    }

    fn insert_locked(
        &self,
        state: &mut CacheState<K, V>,
        key: K,
        value: V,
        expires_at_ms: Option<u64>,
    ) {
        let stamp = self.next_stamp();
        state.map.insert(
            key.clone(),
            Entry {
                value,
                expires_at_ms,
                stamp: AtomicU64::new(stamp),
            },
        );
        sync::lock(&self.order).push_back((key, stamp));
        self.evict_to_capacity_locked(state);
    }

    /// Pop LRU victims until the map fits `allocated`, firing the eviction
    /// callback under the writer lock for each one.
    fn evict_to_capacity_locked(&self, state: &mut CacheState<K, V>) {
        if state.map.len() <= state.allocated {
            return;
        }
        let callback = self.callback();
        let mut order = sync::lock(&self.order);
        while state.map.len() > state.allocated {
            let Some((key, stamp)) = order.pop_front() else {
                break;
            };
            let current = state
                .map
                .get(&key)
                .map(|entry| entry.stamp.load(Ordering::Relaxed));
            if current != Some(stamp) {
                continue; // stale recency record
            }
            if let Some(entry) = state.map.remove(&key) {
                trace!("lru entry evicted");
                if let Some(cb) = &callback {
                    cb(&key, &entry.value);
                }
            }
        }
    }

    fn remove_expired_locked(&self, state: &mut CacheState<K, V>, now_ms: u64) -> usize {
        let expired: Vec<K> = state
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_live(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        let callback = self.callback();
        for key in &expired {
            if let Some(entry) = state.map.remove(key) {
                if let Some(cb) = &callback {
                    cb(key, &entry.value);
                }
            }
        }
        expired.len()
    }
}

/// Key/value store with LRU eviction, per-entry TTL, hit-rate driven
/// auto-resize, an eviction callback, and cross-cache sync/migrate.
///
/// Reads take the shared lock and record recency through per-entry atomic
/// stamps plus the approximate order queue; writers hold the exclusive lock.
/// A background sweeper removes expired entries every `cleanup_interval`.
pub struct DynamicCache<K, V> {
    shared: Arc<CacheShared<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> DynamicCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(initial_size: usize) -> Self {
        Self::with_default_ttl(initial_size, Duration::ZERO)
    }

    /// `default_ttl` of zero means entries are immortal unless a `put`
    /// overrides it.
    pub fn with_default_ttl(initial_size: usize, default_ttl: Duration) -> Self {
        let shared = Arc::new(CacheShared {
            state: RwLock::new(CacheState {
                map: HashMap::new(),
                allocated: initial_size.max(1),
            }),
            order: Mutex::new(VecDeque::new()),
            next_stamp: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            policy: Mutex::new(AutoResizePolicy {
                enabled: false,
                min_size: 16,
                max_size: 4096,
            }),
            eviction: RwLock::new(None),
            cleanup_interval: Mutex::new(DEFAULT_CLEANUP_INTERVAL),
            default_ttl: (!default_ttl.is_zero()).then_some(default_ttl),
            stop: AtomicBool::new(false),
            sweeper_gate: Mutex::new(()),
            sweeper_wake: Condvar::new(),
            clock: FabricClock::new(),
        });
        let cache = Self {
            shared,
            sweeper: Mutex::new(None),
        };
        cache.start_cleanup();
        cache
    }

    /// Fetch a value, advancing LRU recency. An expired entry behaves as
    /// absent and is removed (firing the eviction callback).
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.shared.clock.now_ms();
        {
            let state = sync::read(&self.shared.state);
            match state.map.get(key) {
                Some(entry) if entry.is_live(now) => {
                    let stamp = self.shared.next_stamp();
                    entry.stamp.store(stamp, Ordering::Relaxed);
                    sync::lock(&self.shared.order).push_back((key.clone(), stamp));
                    self.shared.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {} // expired, remove below under the writer lock
                None => {
                    self.shared.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let mut state = sync::write(&self.shared.state);
        let expired = state
            .map
            .get(key)
            .map(|entry| !entry.is_live(now))
            .unwrap_or(false);
        if expired {
            if let Some(entry) = state.map.remove(key) {
                if let Some(cb) = self.shared.callback() {
                    cb(key, &entry.value);
                }
            }
        }
        self.shared.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: K, value: V) {
        let ttl = self.shared.default_ttl.unwrap_or(Duration::ZERO);
        self.put_with_ttl(key, value, ttl);
    }

    /// Insert or overwrite; a zero TTL makes the entry immortal. Never fails
    /// on capacity: the LRU tail is evicted instead.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = self.shared.clock.now_ms();
        let expires_at_ms = (!ttl.is_zero()).then(|| now + ttl.as_millis() as u64);
        let mut state = sync::write(&self.shared.state);
        self.shared.insert_locked(&mut state, key, value, expires_at_ms);
    }

    pub fn batch_put<I>(&self, entries: I, ttl: Duration)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let now = self.shared.clock.now_ms();
        let expires_at_ms = (!ttl.is_zero()).then(|| now + ttl.as_millis() as u64);
        let mut state = sync::write(&self.shared.state);
        for (key, value) in entries {
            self.shared.insert_locked(&mut state, key, value, expires_at_ms);
        }
    }

    pub fn remove(&self, key: &K) {
        let mut state = sync::write(&self.shared.state);
        state.map.remove(key);
    }

    pub fn clear(&self) {
        let mut state = sync::write(&self.shared.state);
        state.map.clear();
        sync::lock(&self.shared.order).clear();
    }

    pub fn len(&self) -> usize {
        sync::read(&self.shared.state).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocated_size(&self) -> usize {
        sync::read(&self.shared.state).allocated
    }

    /// Change capacity; shrinking below the current population forces
    /// immediate LRU eviction down to the new size.
    pub fn resize(&self, new_size: usize) {
        let mut state = sync::write(&self.shared.state);
        state.allocated = new_size.max(1);
        self.shared.evict_to_capacity_locked(&mut state);
    }

    pub fn set_eviction_callback<F>(&self, callback: F)
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        *sync::write(&self.shared.eviction) = Some(Arc::new(callback));
    }

    pub fn set_auto_resize(&self, enabled: bool, min_size: usize, max_size: usize) {
        let mut policy = sync::lock(&self.shared.policy);
        policy.enabled = enabled;
        policy.min_size = min_size.max(1);
        policy.max_size = max_size.max(policy.min_size);
    }

    pub fn set_cleanup_interval(&self, interval: Duration) {
        *sync::lock(&self.shared.cleanup_interval) = interval.max(Duration::from_millis(1));
        self.shared.sweeper_wake.notify_all();
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = sync::read(&self.shared.state);
        CacheMetrics {
            len: state.map.len(),
            allocated_size: state.allocated,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        self.metrics().hit_rate()
    }

    /// Copy every live entry of `other` into `self`, overwriting on
    /// conflict. Both exclusive locks are taken in pointer order so
    /// concurrent `sync_with`/`migrate_to` pairs cannot deadlock.
    pub fn sync_with(&self, other: &DynamicCache<K, V>) {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return;
        }
        let now = self.shared.clock.now_ms();
        let (mut dst, src) = lock_pair(&self.shared, &other.shared);
        let imported: Vec<(K, V, Option<u64>)> = src
            .map
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.expires_at_ms))
            .collect();
        drop(src);
        for (key, value, expires_at_ms) in imported {
            self.shared.insert_locked(&mut dst, key, value, expires_at_ms);
        }
    }

    /// Move every live entry into `target`, then clear `self`.
    pub fn migrate_to(&self, target: &DynamicCache<K, V>) {
        if Arc::ptr_eq(&self.shared, &target.shared) {
            return;
        }
        target.sync_with(self);
        self.clear();
    }

    /// Spawn the housekeeping sweeper if it is not already running.
    pub fn start_cleanup(&self) {
        let mut slot = sync::lock(&self.sweeper);
        if slot.is_some() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *slot = Some(
            std::thread::Builder::new()
                .name("cache-sweeper".into())
                .spawn(move || sweeper_loop(shared))
                .expect("spawn cache sweeper"),
        );
    }

    /// Stop and join the sweeper. Idempotent; entries are untouched.
    pub fn stop_cleanup(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.sweeper_wake.notify_all();
        if let Some(handle) = sync::lock(&self.sweeper).take() {
            let _ = handle.join();
        }
    }
}

impl<K, V> Drop for DynamicCache<K, V> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.sweeper_wake.notify_all();
        let slot = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }
    }
}

type StatePair<'a, K, V> = (
    std::sync::RwLockWriteGuard<'a, CacheState<K, V>>,
    std::sync::RwLockWriteGuard<'a, CacheState<K, V>>,
);

fn lock_pair<'a, K, V>(
    dst: &'a CacheShared<K, V>,
    src: &'a CacheShared<K, V>,
) -> StatePair<'a, K, V> {
    let dst_addr = dst as *const _ as usize;
    let src_addr = src as *const _ as usize;
    if dst_addr < src_addr {
        let d = sync::write(&dst.state);
        let s = sync::write(&src.state);
        (d, s)
    } else {
        let s = sync::write(&src.state);
        let d = sync::write(&dst.state);
        (d, s)
    }
}

fn sweeper_loop<K, V>(shared: Arc<CacheShared<K, V>>)
where
    K: Eq + Hash + Clone,
{
    let mut prev_hits = 0u64;
    let mut prev_misses = 0u64;
    let mut consecutive_high = 0u32;

    loop {
        let interval = *sync::lock(&shared.cleanup_interval);
        {
            let gate = sync::lock(&shared.sweeper_gate);
            let _unused = shared
                .sweeper_wake
                .wait_timeout(gate, interval)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let now = shared.clock.now_ms();
        {
            let mut state = sync::write(&shared.state);
            let removed = shared.remove_expired_locked(&mut state, now);
            if removed > 0 {
                debug!(removed, "cache sweep removed expired entries");
            }
            // Drop stale recency records so the order queue stays bounded.
            let mut order = sync::lock(&shared.order);
            order.retain(|(key, stamp)| {
                state
                    .map
                    .get(key)
                    .map(|entry| entry.stamp.load(Ordering::Relaxed) == *stamp)
                    .unwrap_or(false)
            });
        }

        auto_resize_tick(&shared, &mut prev_hits, &mut prev_misses, &mut consecutive_high);
    }
}

/// Hit-rate driven capacity adjustment over a two-interval window: a single
/// hot tick never shrinks the cache.
fn auto_resize_tick<K, V>(
    shared: &CacheShared<K, V>,
    prev_hits: &mut u64,
    prev_misses: &mut u64,
    consecutive_high: &mut u32,
) where
    K: Eq + Hash + Clone,
{
    let policy = *sync::lock(&shared.policy);
    let hits = shared.hits.load(Ordering::Relaxed);
    let misses = shared.misses.load(Ordering::Relaxed);
    let window_hits = hits - *prev_hits;
    let window_total = window_hits + (misses - *prev_misses);
    *prev_hits = hits;
    *prev_misses = misses;

    if !policy.enabled || window_total == 0 {
        *consecutive_high = 0;
        return;
    }

    let rate = window_hits as f64 / window_total as f64;
    if rate > SHRINK_HIT_RATE {
        *consecutive_high += 1;
        if *consecutive_high >= 2 {
            let mut state = sync::write(&shared.state);
            let target = (state.allocated / 2).max(policy.min_size);
            if target < state.allocated {
                debug!(from = state.allocated, to = target, "cache auto-shrink");
                state.allocated = target;
                shared.evict_to_capacity_locked(&mut state);
            }
            *consecutive_high = 0;
        }
    } else {
        *consecutive_high = 0;
        if rate < GROW_HIT_RATE {
            let mut state = sync::write(&shared.state);
            let target = ((state.allocated as f64 * GROW_FACTOR).ceil() as usize)
                .min(policy.max_size);
            if target > state.allocated {
                debug!(from = state.allocated, to = target, "cache auto-grow");
                state.allocated = target;
            }
        }
    }
}
