//! Single-host compute-dispatch fabric: specialized kernels behind a hybrid
//! adaptive load balancer, with a shared dynamic cache, predictive preload,
//! and checkpoint-based recovery.

pub mod accel;
pub mod balancer;
pub mod cache;
pub mod clock;
pub mod config;
pub mod events;
pub mod kernel;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod preload;
pub mod recovery;
mod sync;
pub mod task;

pub use accel::{AccelError, Accelerator, AcceleratorCaps};
pub use balancer::{
    Assignment, BalancerError, BalancingStrategy, LoadBalancer, ResourceWeights,
};
pub use cache::{CacheMetrics, DynamicCache, EvictionCallback};
pub use clock::{epoch_ms, monotonic_ms, FabricClock};
pub use config::{ConfigError, FabricConfig};
pub use events::{EventRegistry, KernelEvent};
pub use kernel::{Kernel, KernelBuilder, KernelError, KernelKind, KernelState, TaskCallback};
pub use metrics::{derive_metrics, PerformanceSample};
pub use orchestrator::TaskOrchestrator;
pub use pool::{AffinityHint, PoolConfig, PoolError, PoolMetrics, ThreadPool};
pub use preload::{PreloadConfig, PreloadEntry, PreloadError, PreloadManager, PreloadMetrics};
pub use recovery::{
    RecoveryConfig, RecoveryError, RecoveryManager, RecoveryMetrics, RecoveryPoint,
};
pub use task::{KernelMetrics, TaskClass, TaskDescriptor, TaskId};
