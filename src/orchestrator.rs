use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::balancer::{Assignment, BalancerError, LoadBalancer};
use crate::clock::FabricClock;
use crate::kernel::Kernel;
use crate::sync;
use crate::task::{KernelMetrics, TaskClass, TaskDescriptor, DEFAULT_PRIORITY};

/// External task intake: stamps descriptors, holds them until a balancing
/// round, and hands them to the balancer against the live kernel set.
pub struct TaskOrchestrator {
    queue: Mutex<Vec<TaskDescriptor>>,
    clock: FabricClock,
}

impl TaskOrchestrator {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            clock: FabricClock::new(),
        }
    }

    /// Accept an opaque payload at the default priority.
    pub fn enqueue(&self, payload: Vec<u8>) -> TaskDescriptor {
        self.enqueue_with(payload, DEFAULT_PRIORITY, TaskClass::Mixed)
    }

    pub fn enqueue_with(&self, payload: Vec<u8>, priority: u8, class: TaskClass) -> TaskDescriptor {
        let task = TaskDescriptor::new(payload)
            .with_priority(priority)
            .with_class(class)
            .with_enqueued_at_ms(self.clock.now_ms());
        sync::lock(&self.queue).push(task.clone());
        debug!(priority = task.priority, class = task.class.as_str(), "task accepted");
        task
    }

    pub fn enqueue_descriptor(&self, task: TaskDescriptor) {
        sync::lock(&self.queue).push(task);
    }

    /// FIFO drain entry for callers that bypass balancing.
    pub fn dequeue(&self) -> Option<TaskDescriptor> {
        let mut queue = sync::lock(&self.queue);
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    pub fn queue_len(&self) -> usize {
        sync::lock(&self.queue).len()
    }

    /// Legacy assignment: sort by priority and greedily hand each task to
    /// the kernel with the lowest tracked load, bumping that load by 0.1 per
    /// assignment to model saturation within the round.
    pub fn balance_tasks(&self, kernels: &[Arc<Kernel>]) {
        if kernels.is_empty() {
            return;
        }
        let mut tasks = std::mem::take(&mut *sync::lock(&self.queue));
        if tasks.is_empty() {
            return;
        }
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut tracked_load: Vec<f64> = kernels
            .iter()
            .map(|kernel| kernel.extended_metrics().load)
            .collect();

        for task in tasks {
            let mut best = 0usize;
            for (index, load) in tracked_load.iter().enumerate() {
                if *load < tracked_load[best] {
                    best = index;
                }
            }
            if let Err(err) = kernels[best].schedule_descriptor(task) {
                warn!(kernel = %kernels[best].id(), %err, "legacy assignment rejected");
                continue;
            }
            tracked_load[best] += 0.1;
        }
    }

    /// Delegate to the balancer with fresh kernel metrics; the local
    /// descriptor list is cleared whether or not every dispatch succeeds.
    pub fn orchestrate(
        &self,
        kernels: &[Arc<Kernel>],
        balancer: &LoadBalancer,
    ) -> Result<Vec<Assignment>, BalancerError> {
        let tasks = std::mem::take(&mut *sync::lock(&self.queue));
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let metrics: Vec<KernelMetrics> = kernels
            .iter()
            .map(|kernel| kernel.extended_metrics())
            .collect();
        balancer.balance(kernels, &tasks, &metrics)
    }
}

impl Default for TaskOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelKind;
    use crate::pool::PoolConfig;
    use std::time::Duration;

    fn worker_kernel() -> Arc<Kernel> {
        let kernel = Kernel::builder(KernelKind::Computational)
            .pool_config(PoolConfig::fixed(1, 64))
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
    fn enqueue_stamps_priority_and_time() {
        let orchestrator = TaskOrchestrator::new();
        let task = orchestrator.enqueue(vec![1, 2, 3]);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(orchestrator.queue_len(), 1);
    }

    #[test]
    fn dequeue_is_fifo() {
        let orchestrator = TaskOrchestrator::new();
        orchestrator.enqueue(vec![1]);
        orchestrator.enqueue(vec![2]);
        assert_eq!(orchestrator.dequeue().unwrap().payload, vec![1]);
        assert_eq!(orchestrator.dequeue().unwrap().payload, vec![2]);
        assert!(orchestrator.dequeue().is_none());
    }

    #[test]
    fn orchestrate_clears_the_local_queue() {
        let orchestrator = TaskOrchestrator::new();
        let kernel = worker_kernel();
        let balancer = LoadBalancer::new();

        orchestrator.enqueue_with(vec![1], 8, TaskClass::Cpu);
        orchestrator.enqueue_with(vec![2], 2, TaskClass::Io);
        let assignments = orchestrator
            .orchestrate(std::slice::from_ref(&kernel), &balancer)
            .unwrap();

        assert_eq!(assignments.len(), 2);
        assert_eq!(orchestrator.queue_len(), 0);
        wait_until("tasks processed", || kernel.processed_tasks() == 2);
    }

    #[test]
    fn legacy_balance_spreads_over_least_loaded_kernels() {
        let orchestrator = TaskOrchestrator::new();
        let kernels = vec![worker_kernel(), worker_kernel()];
        for i in 0..6u8 {
            orchestrator.enqueue_with(vec![i], i, TaskClass::Mixed);
        }
        orchestrator.balance_tasks(&kernels);
        assert_eq!(orchestrator.queue_len(), 0);
        wait_until("all tasks processed", || {
            kernels[0].processed_tasks() + kernels[1].processed_tasks() == 6
        });
        // The +0.1 bump alternates assignments, so both kernels saw work.
        assert!(kernels[0].processed_tasks() > 0);
        assert!(kernels[1].processed_tasks() > 0);
    }
}
