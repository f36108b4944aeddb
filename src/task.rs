use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::clock::FabricClock;

/// Priority assigned to tasks that do not request one explicitly.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Upper bound of the priority scale; higher runs first.
pub const MAX_PRIORITY: u8 = 10;

/// Priority at or above which the balancer treats a task as high priority.
pub const HIGH_PRIORITY_THRESHOLD: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Workload class used by workload-specific balancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskClass {
    Cpu,
    Io,
    Memory,
    Network,
    Mixed,
}

impl TaskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskClass::Cpu => "cpu_intensive",
            TaskClass::Io => "io_intensive",
            TaskClass::Memory => "memory_intensive",
            TaskClass::Network => "network_intensive",
            TaskClass::Mixed => "mixed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cpu_intensive" | "cpu" => Some(TaskClass::Cpu),
            "io_intensive" | "io" => Some(TaskClass::Io),
            "memory_intensive" | "memory" => Some(TaskClass::Memory),
            "network_intensive" | "network" => Some(TaskClass::Network),
            "mixed" => Some(TaskClass::Mixed),
            _ => None,
        }
    }
}

impl Default for TaskClass {
    fn default() -> Self {
        TaskClass::Mixed
    }
}

/// Descriptor for one unit of work entering the fabric.
///
/// Created by the orchestrator, immutable after enqueue, dropped when the
/// worker closure completes or the task is cancelled before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub payload: Vec<u8>,
    pub priority: u8,
    pub enqueued_at_ms: u64,
    pub class: TaskClass,
    pub estimated_memory_bytes: u64,
    pub estimated_cpu_time_ms: u64,
}

impl TaskDescriptor {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            priority: DEFAULT_PRIORITY,
            enqueued_at_ms: FabricClock::new().now_ms(),
            class: TaskClass::Mixed,
            estimated_memory_bytes: 0,
            estimated_cpu_time_ms: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_class(mut self, class: TaskClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_enqueued_at_ms(mut self, timestamp: u64) -> Self {
        self.enqueued_at_ms = timestamp;
        self
    }

    pub fn with_estimated_memory(mut self, bytes: u64) -> Self {
        self.estimated_memory_bytes = bytes;
        self
    }

    pub fn with_estimated_cpu_time(mut self, millis: u64) -> Self {
        self.estimated_cpu_time_ms = millis;
        self
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority >= HIGH_PRIORITY_THRESHOLD
    }

    /// Cache key under which a processed task's payload is stored.
    pub fn cache_key(&self) -> String {
        format!("task_{}_{}", self.priority, self.enqueued_at_ms)
    }
}

/// Ordering used by kernel task queues: higher priority first, then older
/// enqueue timestamp first.
pub fn dispatch_order(a: &TaskDescriptor, b: &TaskDescriptor) -> Ordering {
    match a.priority.cmp(&b.priority) {
        Ordering::Equal => b.enqueued_at_ms.cmp(&a.enqueued_at_ms),
        other => other,
    }
}

/// Point-in-time metric snapshot a kernel reports to the balancer.
///
/// Usage and efficiency axes are in `[0, 1]`; bandwidths are absolute
/// (MB/s and IOPS); `active_tasks` is a count. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelMetrics {
    pub load: f64,
    pub latency: f64,
    pub cache_efficiency: f64,
    pub tunnel_bandwidth: f64,
    pub active_tasks: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_bandwidth: f64,
    pub disk_io: f64,
    pub energy_consumption: f64,
    pub cpu_task_efficiency: f64,
    pub io_task_efficiency: f64,
    pub memory_task_efficiency: f64,
    pub network_task_efficiency: f64,
}

impl KernelMetrics {
    /// Efficiency for one workload class; MIXED averages the four axes.
    pub fn efficiency_for(&self, class: TaskClass) -> f64 {
        match class {
            TaskClass::Cpu => self.cpu_task_efficiency,
            TaskClass::Io => self.io_task_efficiency,
            TaskClass::Memory => self.memory_task_efficiency,
            TaskClass::Network => self.network_task_efficiency,
            TaskClass::Mixed => {
                (self.cpu_task_efficiency
                    + self.io_task_efficiency
                    + self.memory_task_efficiency
                    + self.network_task_efficiency)
                    / 4.0
            }
        }
    }
}
