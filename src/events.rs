use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::sync;
use crate::task::TaskDescriptor;

pub const WARMUP_COMPLETED: &str = "warmup_completed";
pub const WARMUP_FAILED: &str = "warmup_failed";
pub const TASK_PROCESSED: &str = "task_processed";
pub const TASK_FAILED: &str = "task_failed";
pub const LOADBALANCER_READY: &str = "loadbalancer_ready";

/// Notification emitted by a kernel; the variant enumerates the payload
/// shape each event carries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum KernelEvent {
    WarmupCompleted { entries: usize },
    WarmupFailed { error: String },
    TaskProcessed { task: TaskDescriptor },
    TaskFailed { error: String },
    LoadBalancerReady { kernel_id: String },
    Custom { name: String, detail: serde_json::Value },
}

impl KernelEvent {
    /// Registration name handlers subscribe under.
    pub fn name(&self) -> &str {
        match self {
            KernelEvent::WarmupCompleted { .. } => WARMUP_COMPLETED,
            KernelEvent::WarmupFailed { .. } => WARMUP_FAILED,
            KernelEvent::TaskProcessed { .. } => TASK_PROCESSED,
            KernelEvent::TaskFailed { .. } => TASK_FAILED,
            KernelEvent::LoadBalancerReady { .. } => LOADBALANCER_READY,
            KernelEvent::Custom { name, .. } => name,
        }
    }
}

/// Handler invoked synchronously on the emitting thread with the kernel id
/// and the event. Handlers must be fast and must not block or call back into
/// lock-taking kernel operations.
pub type EventHandler = Arc<dyn Fn(&str, &KernelEvent) + Send + Sync>;

/// Per-kernel table of named event handlers.
#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<HashMap<String, EventHandler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&str, &KernelEvent) + Send + Sync + 'static,
    {
        sync::write(&self.handlers).insert(event.into(), Arc::new(handler));
    }

    pub fn remove(&self, event: &str) {
        sync::write(&self.handlers).remove(event);
    }

    /// Dispatch to the handler registered for the event's name, if any.
    pub fn emit(&self, kernel_id: &str, event: &KernelEvent) {
        let handler = sync::read(&self.handlers).get(event.name()).cloned();
        if let Some(handler) = handler {
            handler(kernel_id, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registered_handler_receives_matching_events() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        registry.set(WARMUP_COMPLETED, move |kernel_id, event| {
            assert_eq!(kernel_id, "k0");
            assert!(matches!(event, KernelEvent::WarmupCompleted { entries: 3 }));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit("k0", &KernelEvent::WarmupCompleted { entries: 3 });
        registry.emit("k0", &KernelEvent::TaskFailed { error: "x".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_handler_is_not_invoked() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        registry.set(TASK_FAILED, move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        registry.remove(TASK_FAILED);
        registry.emit("k0", &KernelEvent::TaskFailed { error: "x".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_events_dispatch_by_their_own_name() {
        let registry = EventRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        registry.set("tunnel_opened", move |_, event| {
            assert_eq!(event.name(), "tunnel_opened");
            seen.fetch_add(1, Ordering::SeqCst);
        });
        registry.emit(
            "k1",
            &KernelEvent::Custom {
                name: "tunnel_opened".into(),
                detail: serde_json::json!({"peer": "k2"}),
            },
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
