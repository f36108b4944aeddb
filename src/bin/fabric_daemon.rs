use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, process};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use taskfabric::{
    FabricConfig, Kernel, KernelKind, LoadBalancer, PreloadManager, RecoveryManager, TaskClass,
    TaskOrchestrator,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let config_path = args
        .next()
        .ok_or_else(|| anyhow!("missing configuration path. usage: fabric_daemon <config> [report.json]"))?;
    let report_path = args.next().map(PathBuf::from);

    let raw = std::fs::read(&config_path)
        .with_context(|| format!("reading configuration {config_path}"))?;
    let document: serde_json::Value = serde_json::from_slice(&raw)?;
    let config: FabricConfig = serde_json::from_value(document.clone())?;
    config.validate()?;
    let extras: DaemonExtras = serde_json::from_value(document)?;

    init_logging(&config);

    let balancer = Arc::new(LoadBalancer::new());
    // Unknown names log a warning and fall back to hybrid_adaptive.
    let _ = balancer.set_strategy_named(&config.load_balancer.strategy);
    let weights = &config.load_balancer.resource_weights;
    balancer.set_resource_weights(weights.cpu, weights.memory, weights.network, weights.energy);
    let thresholds = &config.load_balancer.adaptive_thresholds;
    balancer.set_adaptive_thresholds(thresholds.resource, thresholds.workload);

    let kernels = build_kernels(&config, &balancer)?;
    if kernels.is_empty() {
        return Err(anyhow!("configuration defines no kernels"));
    }

    let preload = Arc::new(PreloadManager::new(config.preload.resolve()));
    preload
        .initialize()
        .map_err(|err| anyhow!("preload manager: {err}"))?;
    for seed in &extras.preload_seed {
        if let Err(err) = preload.preload(seed.key.clone(), seed.data.clone().into_bytes()) {
            warn!(key = %seed.key, %err, "preload seed rejected");
        }
    }
    for kernel in &kernels {
        kernel.set_preload(Arc::clone(&preload));
        if let Err(err) = kernel.warmup_from_preload() {
            warn!(kernel = %kernel.id(), %err, "cache warm-up failed");
        }
    }

    let recovery = Arc::new(RecoveryManager::new(config.recovery.resolve()));
    recovery
        .initialize()
        .map_err(|err| anyhow!("recovery manager: {err}"))?;
    {
        let kernels = kernels.clone();
        recovery.set_state_capture(move || capture_fabric_state(&kernels));
    }
    recovery.set_state_restore(|_state| true);

    let orchestrator = TaskOrchestrator::new();
    for spec in &extras.tasks {
        let class = TaskClass::parse(&spec.class).unwrap_or(TaskClass::Mixed);
        orchestrator.enqueue_with(spec.data.clone().into_bytes(), spec.priority, class);
    }

    let dispatched = orchestrator
        .orchestrate(&kernels, &balancer)
        .map_err(|err| anyhow!("balancing failed: {err}"))?;
    info!(tasks = dispatched.len(), kernels = kernels.len(), "tasks dispatched");

    wait_for_processing(&kernels, dispatched.len());

    let recovery_point = match recovery.create_recovery_point() {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(%err, "checkpoint after dispatch failed");
            None
        }
    };

    print_summary(&kernels, &balancer, dispatched.len(), recovery_point.as_deref());

    if let Some(path) = report_path {
        write_report(&path, &kernels, dispatched.len(), recovery_point.as_deref())?;
    }

    for kernel in &kernels {
        kernel.shutdown();
    }
    preload.shutdown();
    recovery.shutdown();
    Ok(())
}

fn init_logging(config: &FabricConfig) {
    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_kernels(config: &FabricConfig, balancer: &Arc<LoadBalancer>) -> Result<Vec<Arc<Kernel>>> {
    let pool_config = config.thread_pool.resolve();
    let cache = &config.cache.dynamic;
    let groups = [
        (&config.kernels.core, KernelKind::Computational),
        (&config.kernels.micro, KernelKind::Micro),
        (&config.kernels.orchestration, KernelKind::Orchestration),
    ];

    let mut kernels = Vec::new();
    for (group, kind) in groups {
        for index in 0..group.count {
            let kernel = Kernel::builder(kind)
                .id(format!("{}_{index}", group.id_prefix))
                .cache_capacity(cache.initial_size)
                .cache_ttl(Duration::from_millis(cache.ttl_ms))
                .pool_config(pool_config.clone())
                .build()
                .map_err(|err| anyhow!("building kernel: {err}"))?;
            kernel
                .initialize()
                .map_err(|err| anyhow!("initializing kernel: {err}"))?;
            kernel.set_load_balancer(balancer);
            kernels.push(kernel);
        }
    }
    Ok(kernels)
}

fn wait_for_processing(kernels: &[Arc<Kernel>], expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let done: u64 = kernels
            .iter()
            .map(|kernel| kernel.processed_tasks() + kernel.failed_tasks())
            .sum();
        if done as usize >= expected || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn capture_fabric_state(kernels: &[Arc<Kernel>]) -> Vec<u8> {
    let state = serde_json::json!({
        "kernels": kernels
            .iter()
            .map(|kernel| {
                serde_json::json!({
                    "id": kernel.id(),
                    "kind": kernel.kind().as_str(),
                    "processed": kernel.processed_tasks(),
                    "failed": kernel.failed_tasks(),
                    "cache_len": kernel.cache().len(),
                })
            })
            .collect::<Vec<_>>(),
    });
    serde_json::to_vec(&state).unwrap_or_default()
}

fn print_summary(
    kernels: &[Arc<Kernel>],
    balancer: &LoadBalancer,
    dispatched: usize,
    recovery_point: Option<&str>,
) {
    println!("Fabric daemon summary:");
    println!("  strategy: {}", balancer.strategy().as_str());
    println!("  tasks dispatched: {dispatched}");
    for kernel in kernels {
        println!(
            "  kernel {} ({}): processed={} failed={} cache_entries={}",
            kernel.id(),
            kernel.kind().as_str(),
            kernel.processed_tasks(),
            kernel.failed_tasks(),
            kernel.cache().len(),
        );
    }
    let (resource, workload, total) = balancer.decision_stats();
    println!("  decisions: resource_aware={resource} workload_specific={workload} total={total}");
    match recovery_point {
        Some(id) => println!("  recovery point: {id}"),
        None => println!("  recovery point: none"),
    }
}

fn write_report(
    path: &PathBuf,
    kernels: &[Arc<Kernel>],
    dispatched: usize,
    recovery_point: Option<&str>,
) -> Result<()> {
    let report = serde_json::json!({
        "dispatched": dispatched,
        "recovery_point": recovery_point,
        "kernels": kernels
            .iter()
            .map(|kernel| {
                serde_json::json!({
                    "id": kernel.id(),
                    "kind": kernel.kind().as_str(),
                    "processed": kernel.processed_tasks(),
                    "failed": kernel.failed_tasks(),
                })
            })
            .collect::<Vec<_>>(),
    });
    std::fs::write(path, serde_json::to_vec_pretty(&report)?)
        .with_context(|| format!("writing report {}", path.display()))?;
    Ok(())
}

/// Daemon-only sections read from the same configuration file: scripted
/// tasks to dispatch and preload seeds to stage before warm-up.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DaemonExtras {
    tasks: Vec<TaskSpec>,
    preload_seed: Vec<PreloadSpec>,
}

#[derive(Debug, Deserialize)]
struct TaskSpec {
    data: String,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default = "default_class")]
    class: String,
}

fn default_priority() -> u8 {
    5
}

fn default_class() -> String {
    "mixed".into()
}

#[derive(Debug, Deserialize)]
struct PreloadSpec {
    key: String,
    data: String,
}
