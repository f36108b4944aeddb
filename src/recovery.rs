use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::sync;

/// Smoothing factor for the average-restore-time EWMA.
const RECOVERY_TIME_ALPHA: f64 = 0.2;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("invalid recovery configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error("recovery manager has no {callback} callback installed")]
    NotInitialized { callback: &'static str },
    #[error("recovery point {id} not found")]
    NotFound { id: String },
    #[error("recovery point {id} failed integrity validation: {reason}")]
    Integrity { id: String, reason: String },
    #[error("state restore callback rejected recovery point {id}")]
    RestoreRejected { id: String },
    #[error("state of {size} bytes exceeds max_point_size {max}")]
    PointTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub max_recovery_points: usize,
    pub checkpoint_interval: Option<Duration>,
    pub auto_recovery: bool,
    pub state_validation: bool,
    pub compression: bool,
    pub storage_path: PathBuf,
    pub retention_period: Option<Duration>,
    /// Zero disables the size guard.
    pub max_point_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_points: 10,
            checkpoint_interval: None,
            auto_recovery: false,
            state_validation: true,
            compression: false,
            storage_path: PathBuf::from("recovery_points"),
            retention_period: None,
            max_point_size: 0,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), RecoveryError> {
        if self.max_recovery_points == 0 {
            return Err(RecoveryError::InvalidConfig {
                reason: "max_recovery_points must be at least 1".into(),
            });
        }
        if self.storage_path.as_os_str().is_empty() {
            return Err(RecoveryError::InvalidConfig {
                reason: "storage_path must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// In-memory view of one validated checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub id: String,
    pub timestamp_ms: u64,
    pub size: usize,
    pub is_consistent: bool,
    pub checksum: String,
    pub metadata: BTreeMap<String, String>,
}

/// Persisted record: the metadata object plus the (optionally gzipped)
/// state embedded as base64. One file per point, written atomically.
#[derive(Debug, Serialize, Deserialize)]
struct PointRecord {
    id: String,
    timestamp_ms: u64,
    size: usize,
    is_consistent: bool,
    checksum: String,
    metadata: BTreeMap<String, String>,
    compressed: bool,
    state_b64: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryMetrics {
    pub total_points: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub average_recovery_time_ms: f64,
    pub last_recovery_ms: Option<u64>,
}

pub type StateCapture = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;
pub type StateRestore = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;
pub type RecoveryErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Periodic snapshot store: captures opaque state through a callback,
/// checksums and persists it, and restores it on demand with integrity
/// re-validation.
pub struct RecoveryManager {
    config: RecoveryConfig,
    points: Mutex<BTreeMap<String, RecoveryPoint>>,
    capture: RwLock<Option<StateCapture>>,
    restore: RwLock<Option<StateRestore>>,
    on_error: RwLock<Option<RecoveryErrorCallback>>,
    metrics: Mutex<RecoveryMetrics>,
    rng: Mutex<StdRng>,
    stop: Arc<AtomicBool>,
    timer_gate: Arc<(Mutex<()>, Condvar)>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            points: Mutex::new(BTreeMap::new()),
            capture: RwLock::new(None),
            restore: RwLock::new(None),
            on_error: RwLock::new(None),
            metrics: Mutex::new(RecoveryMetrics::default()),
            rng: Mutex::new(StdRng::from_entropy()),
            stop: Arc::new(AtomicBool::new(false)),
            timer_gate: Arc::new((Mutex::new(()), Condvar::new())),
            timer: Mutex::new(None),
        }
    }

    /// Validate configuration, create the storage directory, and start the
    /// checkpoint timer when auto recovery is configured.
    pub fn initialize(self: &Arc<Self>) -> Result<(), RecoveryError> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.storage_path)?;
        if self.config.auto_recovery {
            if let Some(interval) = self.config.checkpoint_interval {
                self.start_timer(interval);
            }
        }
        info!(path = %self.config.storage_path.display(), "recovery manager initialized");
        Ok(())
    }

    pub fn set_state_capture<F>(&self, capture: F)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        *sync::write(&self.capture) = Some(Arc::new(capture));
    }

    pub fn set_state_restore<F>(&self, restore: F)
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        *sync::write(&self.restore) = Some(Arc::new(restore));
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *sync::write(&self.on_error) = Some(Arc::new(callback));
    }

    /// Capture, checksum, optionally compress, and persist the current
    /// state. Returns the new point id.
    pub fn create_recovery_point(&self) -> Result<String, RecoveryError> {
        let result = self.try_create_point();
        if let Err(err) = &result {
            self.report_error(&format!("failed to create recovery point: {err}"));
        }
        result
    }

    fn try_create_point(&self) -> Result<String, RecoveryError> {
        let capture = sync::read(&self.capture)
            .clone()
            .ok_or(RecoveryError::NotInitialized { callback: "state capture" })?;
        let state = capture();
        if self.config.max_point_size > 0 && state.len() > self.config.max_point_size {
            return Err(RecoveryError::PointTooLarge {
                size: state.len(),
                max: self.config.max_point_size,
            });
        }

        let checksum = sha256_hex(&state);
        let is_consistent = !self.config.state_validation || !state.is_empty();
        let payload = if self.config.compression {
            gzip(&state)?
        } else {
            state.clone()
        };

        let id = self.generate_point_id();
        let point = RecoveryPoint {
            id: id.clone(),
            timestamp_ms: clock::epoch_ms(),
            size: state.len(),
            is_consistent,
            checksum,
            metadata: BTreeMap::new(),
        };
        let record = PointRecord {
            id: id.clone(),
            timestamp_ms: point.timestamp_ms,
            size: point.size,
            is_consistent,
            checksum: point.checksum.clone(),
            metadata: point.metadata.clone(),
            compressed: self.config.compression,
            state_b64: BASE64.encode(payload),
        };
        self.write_record(&record)?;

        {
            let mut points = sync::lock(&self.points);
            points.insert(id.clone(), point);
        }
        sync::lock(&self.metrics).total_points += 1;
        self.enforce_retention();
        debug!(%id, "recovery point created");
        Ok(id)
    }

    /// Load, validate, and hand the state to the restore callback.
    pub fn restore_from_point(&self, id: &str) -> Result<(), RecoveryError> {
        let started = Instant::now();
        let result = self.try_restore(id);
        let mut metrics = sync::lock(&self.metrics);
        match &result {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                metrics.successful_recoveries += 1;
                metrics.average_recovery_time_ms = if metrics.successful_recoveries == 1 {
                    elapsed_ms
                } else {
                    RECOVERY_TIME_ALPHA * elapsed_ms
                        + (1.0 - RECOVERY_TIME_ALPHA) * metrics.average_recovery_time_ms
                };
                metrics.last_recovery_ms = Some(clock::epoch_ms());
                info!(%id, elapsed_ms, "state restored from recovery point");
            }
            Err(err) => {
                metrics.failed_recoveries += 1;
                drop(metrics);
                self.report_error(&format!("failed to restore from point {id}: {err}"));
            }
        }
        result
    }

    fn try_restore(&self, id: &str) -> Result<(), RecoveryError> {
        let restore = sync::read(&self.restore)
            .clone()
            .ok_or(RecoveryError::NotInitialized { callback: "state restore" })?;

        let path = self.point_path(id);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RecoveryError::NotFound { id: id.to_string() })
            }
            Err(err) => return Err(err.into()),
        };

        let record: PointRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(err) => {
                self.quarantine(&path);
                return Err(RecoveryError::Integrity {
                    id: id.to_string(),
                    reason: format!("unreadable record: {err}"),
                });
            }
        };

        let payload = match BASE64.decode(record.state_b64.as_bytes()) {
            Ok(payload) => payload,
            Err(err) => {
                self.quarantine(&path);
                return Err(RecoveryError::Integrity {
                    id: id.to_string(),
                    reason: format!("invalid state encoding: {err}"),
                });
            }
        };

        let state = if record.compressed {
            match gunzip(&payload) {
                Ok(state) => state,
                Err(err) => {
                    self.quarantine(&path);
                    return Err(RecoveryError::Integrity {
                        id: id.to_string(),
                        reason: format!("decompression failed: {err}"),
                    });
                }
            }
        } else {
            payload
        };

        let checksum = sha256_hex(&state);
        if checksum != record.checksum {
            self.quarantine(&path);
            return Err(RecoveryError::Integrity {
                id: id.to_string(),
                reason: format!("checksum mismatch (expected {}, got {checksum})", record.checksum),
            });
        }

        if !restore(&state) {
            return Err(RecoveryError::RestoreRejected { id: id.to_string() });
        }
        Ok(())
    }

    pub fn delete_recovery_point(&self, id: &str) -> Result<(), RecoveryError> {
        let removed = sync::lock(&self.points).remove(id);
        if removed.is_none() {
            return Err(RecoveryError::NotFound { id: id.to_string() });
        }
        match std::fs::remove_file(self.point_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Known points, oldest first.
    pub fn list_points(&self) -> Vec<RecoveryPoint> {
        let points = sync::lock(&self.points);
        let mut listed: Vec<RecoveryPoint> = points.values().cloned().collect();
        listed.sort_by_key(|point| point.timestamp_ms);
        listed
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        sync::lock(&self.metrics).clone()
    }

    /// Stop the checkpoint timer. Idempotent; persisted points remain.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.timer_gate.1.notify_all();
        if let Some(handle) = sync::lock(&self.timer).take() {
            let _ = handle.join();
        }
    }

    fn start_timer(self: &Arc<Self>, interval: Duration) {
        let mut slot = sync::lock(&self.timer);
        if slot.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        let manager = Arc::clone(self);
        *slot = Some(
            std::thread::Builder::new()
                .name("recovery-timer".into())
                .spawn(move || {
                    loop {
                        {
                            let (gate, wake) = (&manager.timer_gate.0, &manager.timer_gate.1);
                            let guard = sync::lock(gate);
                            let _unused = wake
                                .wait_timeout(guard, interval)
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                        }
                        if manager.stop.load(Ordering::Acquire) {
                            break;
                        }
                        if let Err(err) = manager.create_recovery_point() {
                            warn!(%err, "periodic checkpoint failed; continuing");
                        }
                    }
                })
                .expect("spawn recovery timer"),
        );
    }

    /// Oldest points beyond `max_recovery_points`, and points older than the
    /// retention period, are evicted together with their files.
    fn enforce_retention(&self) {
        let mut evicted: Vec<String> = Vec::new();
        {
            let mut points = sync::lock(&self.points);
            if let Some(retention) = self.config.retention_period {
                let cutoff = clock::epoch_ms().saturating_sub(retention.as_millis() as u64);
                let expired: Vec<String> = points
                    .values()
                    .filter(|point| point.timestamp_ms < cutoff)
                    .map(|point| point.id.clone())
                    .collect();
                for id in expired {
                    points.remove(&id);
                    evicted.push(id);
                }
            }
            while points.len() > self.config.max_recovery_points {
                let oldest = points
                    .values()
                    .min_by_key(|point| point.timestamp_ms)
                    .map(|point| point.id.clone());
                match oldest {
                    Some(id) => {
                        points.remove(&id);
                        evicted.push(id);
                    }
                    None => break,
                }
            }
        }
        for id in evicted {
            debug!(%id, "recovery point evicted by retention");
            if let Err(err) = std::fs::remove_file(self.point_path(&id)) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%id, %err, "failed to remove evicted recovery point");
                }
            }
        }
    }

    fn write_record(&self, record: &PointRecord) -> Result<(), RecoveryError> {
        let path = self.point_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let body = serde_json::to_vec_pretty(record)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn point_path(&self, id: &str) -> PathBuf {
        self.config.storage_path.join(format!("{id}.json"))
    }

    /// Sideline a corrupted file so later scans and restores skip it.
    fn quarantine(&self, path: &Path) {
        let bad = path.with_extension("json.bad");
        match std::fs::rename(path, &bad) {
            Ok(()) => warn!(from = %path.display(), to = %bad.display(), "quarantined corrupted recovery point"),
            Err(err) => error!(%err, path = %path.display(), "failed to quarantine corrupted recovery point"),
        }
    }

    fn generate_point_id(&self) -> String {
        let mut bytes = [0u8; 8];
        sync::lock(&self.rng).fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn report_error(&self, message: &str) {
        error!("{message}");
        if let Some(callback) = sync::read(&self.on_error).clone() {
            callback(message);
        }
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn manager_in(dir: &Path, mutate: impl FnOnce(&mut RecoveryConfig)) -> Arc<RecoveryManager> {
        let mut config = RecoveryConfig {
            storage_path: dir.to_path_buf(),
            ..RecoveryConfig::default()
        };
        mutate(&mut config);
        let manager = Arc::new(RecoveryManager::new(config));
        manager.initialize().unwrap();
        manager
    }

    #[test]
    fn checkpoint_round_trip_restores_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |config| {
            config.compression = true;
            config.state_validation = true;
        });

        let state: Vec<u8> = (0..=255u8).collect();
        let expected = state.clone();
        manager.set_state_capture(move || state.clone());

        let restored = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&restored);
        manager.set_state_restore(move |bytes| {
            *sink.lock().unwrap() = bytes.to_vec();
            true
        });

        let id = manager.create_recovery_point().unwrap();
        manager.restore_from_point(&id).unwrap();

        assert_eq!(*restored.lock().unwrap(), expected);
        let metrics = manager.metrics();
        assert_eq!(metrics.total_points, 1);
        assert_eq!(metrics.successful_recoveries, 1);
        assert!(metrics.last_recovery_ms.is_some());
    }

    #[test]
    fn restore_of_unknown_point_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |_| {});
        manager.set_state_restore(|_| true);
        let err = manager.restore_from_point("deadbeef00000000").unwrap_err();
        assert!(matches!(err, RecoveryError::NotFound { .. }));
        assert_eq!(manager.metrics().failed_recoveries, 1);
    }

    #[test]
    fn corrupted_state_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |_| {});
        manager.set_state_capture(|| vec![1, 2, 3]);
        manager.set_state_restore(|_| true);

        let id = manager.create_recovery_point().unwrap();
        let path = dir.path().join(format!("{id}.json"));
        let mut record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        record["state_b64"] = serde_json::Value::String(BASE64.encode([9, 9, 9]));
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        manager.set_error_callback(move |message| {
            sink.lock().unwrap().push(message.to_string());
        });

        let err = manager.restore_from_point(&id).unwrap_err();
        assert!(matches!(err, RecoveryError::Integrity { .. }));
        assert!(!path.exists(), "corrupted file moved aside");
        assert!(dir.path().join(format!("{id}.json.bad")).exists());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn retention_evicts_oldest_points_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |config| {
            config.max_recovery_points = 2;
        });
        manager.set_state_capture(|| vec![7]);

        let first = manager.create_recovery_point().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = manager.create_recovery_point().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let third = manager.create_recovery_point().unwrap();

        let ids: Vec<String> = manager.list_points().into_iter().map(|p| p.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&first));
        assert!(ids.contains(&second));
        assert!(ids.contains(&third));
        assert!(!dir.path().join(format!("{first}.json")).exists());
    }

    #[test]
    fn missing_capture_callback_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |_| {});
        let err = manager.create_recovery_point().unwrap_err();
        assert!(matches!(err, RecoveryError::NotInitialized { .. }));
    }

    #[test]
    fn oversized_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |config| {
            config.max_point_size = 4;
        });
        manager.set_state_capture(|| vec![0; 16]);
        let err = manager.create_recovery_point().unwrap_err();
        assert!(matches!(err, RecoveryError::PointTooLarge { size: 16, max: 4 }));
    }

    #[test]
    fn auto_checkpoint_timer_creates_points() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), |config| {
            config.auto_recovery = true;
            config.checkpoint_interval = Some(Duration::from_millis(10));
        });
        manager.set_state_capture(|| vec![1]);
        std::thread::sleep(Duration::from_millis(60));
        manager.shutdown();
        assert!(manager.metrics().total_points >= 1);
    }
}
