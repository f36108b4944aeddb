use serde::{Deserialize, Serialize};

use crate::cache::CacheMetrics;
use crate::kernel::KernelKind;
use crate::pool::PoolMetrics;
use crate::task::KernelMetrics;

/// Raw performance feed for one kernel, normalized to `[0, 1]` usages and
/// absolute bandwidths. Supplied by the host (or a probe) and combined with
/// cache and pool counters into `KernelMetrics`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub latency_ms: f64,
    pub tunnel_bandwidth: f64,
    pub network_bandwidth: f64,
    pub disk_io: f64,
    pub energy_consumption: f64,
}

impl Default for PerformanceSample {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            latency_ms: 0.0,
            tunnel_bandwidth: 0.0,
            network_bandwidth: 1000.0,
            disk_io: 1000.0,
            energy_consumption: 0.0,
        }
    }
}

/// Derive the balancer-facing metric snapshot from the live counters.
///
/// The baseline efficiency blends cache effectiveness with CPU headroom;
/// the kernel kind then skews the per-class efficiencies toward the
/// workloads that kind specializes in.
pub fn derive_metrics(
    kind: KernelKind,
    perf: &PerformanceSample,
    cache: &CacheMetrics,
    pool: &PoolMetrics,
    queued_tasks: usize,
) -> KernelMetrics {
    let cache_efficiency = cache.hit_rate();
    let base_efficiency = clamp01(0.5 * cache_efficiency + 0.5 * (1.0 - perf.cpu_usage));

    let (cpu_mul, io_mul, memory_mul, network_mul) = kind.workload_multipliers();

    KernelMetrics {
        load: perf.cpu_usage,
        latency: perf.latency_ms,
        cache_efficiency,
        tunnel_bandwidth: perf.tunnel_bandwidth,
        active_tasks: queued_tasks + pool.active_threads + pool.queue_size,
        cpu_usage: perf.cpu_usage,
        memory_usage: perf.memory_usage,
        network_bandwidth: perf.network_bandwidth,
        disk_io: perf.disk_io,
        energy_consumption: perf.energy_consumption,
        cpu_task_efficiency: clamp01(base_efficiency * cpu_mul),
        io_task_efficiency: clamp01(base_efficiency * io_mul),
        memory_task_efficiency: clamp01(base_efficiency * memory_mul),
        network_task_efficiency: clamp01(base_efficiency * network_mul),
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64) -> PerformanceSample {
        PerformanceSample {
            cpu_usage: cpu,
            ..PerformanceSample::default()
        }
    }

    fn cache_with_rate(hits: u64, misses: u64) -> CacheMetrics {
        CacheMetrics {
            len: 0,
            allocated_size: 16,
            hits,
            misses,
        }
    }

    #[test]
    fn computational_kernels_skew_toward_cpu_work() {
        let metrics = derive_metrics(
            KernelKind::Computational,
            &sample(0.2),
            &cache_with_rate(8, 2),
            &PoolMetrics::default(),
            0,
        );
        assert!(metrics.cpu_task_efficiency > metrics.io_task_efficiency);
        assert!(metrics.cpu_task_efficiency > metrics.memory_task_efficiency);
    }

    #[test]
    fn micro_kernels_trade_cpu_for_io() {
        let metrics = derive_metrics(
            KernelKind::Micro,
            &sample(0.5),
            &cache_with_rate(1, 1),
            &PoolMetrics::default(),
            0,
        );
        assert!(metrics.io_task_efficiency > metrics.network_task_efficiency);
        assert!(metrics.cpu_task_efficiency < metrics.network_task_efficiency);
    }

    #[test]
    fn crypto_kernels_are_even_across_classes() {
        let metrics = derive_metrics(
            KernelKind::Crypto,
            &sample(0.4),
            &cache_with_rate(3, 1),
            &PoolMetrics::default(),
            0,
        );
        assert_eq!(metrics.cpu_task_efficiency, metrics.io_task_efficiency);
        assert_eq!(metrics.memory_task_efficiency, metrics.network_task_efficiency);
    }

    #[test]
    fn efficiencies_stay_within_unit_range() {
        let metrics = derive_metrics(
            KernelKind::Orchestration,
            &sample(0.0),
            &cache_with_rate(100, 0),
            &PoolMetrics::default(),
            0,
        );
        assert!(metrics.network_task_efficiency <= 1.0);
        assert!(metrics.load >= 0.0);
    }

    #[test]
    fn active_tasks_counts_queue_and_workers() {
        let pool = PoolMetrics {
            active_threads: 2,
            queue_size: 3,
            total_threads: 4,
            panicked_tasks: 0,
        };
        let metrics = derive_metrics(
            KernelKind::Smart,
            &sample(0.1),
            &cache_with_rate(0, 0),
            &pool,
            5,
        );
        assert_eq!(metrics.active_tasks, 10);
    }
}
