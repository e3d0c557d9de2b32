//! In-process fleet simulation
//!
//! Runs several coordinators against one [`MemoryStore`], publishes tasks,
//! lets every node work through them, and finally stops the fleet with
//! `stop` commands. Used by `tc simulate` and as an end-to-end smoke test.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kvstore::{Store, StoreError};
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, send_command};
use crate::config::{Config, StoreConfig};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::error::CoordError;

/// Parameters of one simulation run
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub nodes: usize,
    pub tasks: usize,
    /// Time each task takes to "process" (plus up to 50% jitter)
    pub work: Duration,
    /// Give up waiting for the fleet after this long
    pub timeout: Duration,
    /// Template for every node; the node id is replaced per node
    pub coordinator: CoordinatorConfig,
    pub store: StoreConfig,
}

impl SimulationConfig {
    pub fn from_config(config: &Config, nodes: usize, tasks: usize, work: Duration) -> Self {
        Self {
            nodes,
            tasks,
            work,
            timeout: Duration::from_secs(60),
            coordinator: config.coordinator.clone(),
            store: config.store.clone(),
        }
    }
}

/// What happened during a simulation run
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    /// Tasks finished per node, in completion order
    pub completed: BTreeMap<String, Vec<String>>,
    pub total_tasks: usize,
    pub commands_delivered: usize,
    /// Nodes whose shutdown did not finish cleanly, with the reason
    pub shutdown_errors: Vec<(String, String)>,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn completed_count(&self) -> usize {
        self.completed.values().map(Vec::len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.total_tasks
    }
}

struct Progress {
    done: AtomicUsize,
    all_done: Notify,
    commands: AtomicUsize,
    completed: Mutex<BTreeMap<String, Vec<String>>>,
    shutdown_errors: Mutex<Vec<(String, String)>>,
}

/// Run a fleet of coordinators until every task is done or the timeout hits
pub async fn simulate(config: &SimulationConfig) -> Result<SimulationReport, CoordError> {
    debug!(nodes = config.nodes, tasks = config.tasks, "simulate: called");
    if config.nodes == 0 {
        return Err(CoordError::InvalidConfig("simulation needs at least one node".to_string()));
    }
    config.store.validate()?;

    let started = Instant::now();
    let store: Arc<dyn Store> = Arc::new(config.store.build());

    let mut coordinators = Vec::with_capacity(config.nodes);
    for i in 1..=config.nodes {
        let node_config = CoordinatorConfig {
            node_id: format!("sim-{:02}", i),
            ..config.coordinator.clone()
        };
        let coordinator = Arc::new(Coordinator::new(node_config, store.clone())?);
        coordinator.init().await?;
        coordinators.push(coordinator);
    }
    let namespace = coordinators[0].namespace().clone();
    info!(nodes = config.nodes, root = %namespace.root(), "Simulation fleet started");

    let progress = Arc::new(Progress {
        done: AtomicUsize::new(0),
        all_done: Notify::new(),
        commands: AtomicUsize::new(0),
        completed: Mutex::new(BTreeMap::new()),
        shutdown_errors: Mutex::new(Vec::new()),
    });

    let mut handles = Vec::new();
    for coordinator in &coordinators {
        handles.push(tokio::spawn(work_loop(
            coordinator.clone(),
            progress.clone(),
            config.work,
            config.tasks,
        )));
        handles.push(tokio::spawn(command_loop(coordinator.clone(), progress.clone())));
    }

    for i in 1..=config.tasks {
        let task_id = format!("task-{:04}", i);
        match store.create_dir(&namespace.task_path(&task_id), None).await {
            Ok(_) => debug!(%task_id, "simulate: published"),
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let finished = tokio::time::timeout(config.timeout, async {
        while progress.done.load(Ordering::SeqCst) < config.tasks {
            progress.all_done.notified().await;
        }
    })
    .await;
    if finished.is_err() {
        warn!(
            done = progress.done.load(Ordering::SeqCst),
            total = config.tasks,
            "Simulation timed out, stopping fleet"
        );
    }

    for coordinator in &coordinators {
        send_command(
            store.as_ref(),
            &namespace,
            coordinator.node_id(),
            Command::Stop,
            &config.coordinator.retry,
        )
        .await?;
    }

    let grace = config.coordinator.shutdown_grace() * 2;
    for handle in handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("Simulation worker did not stop in time");
        }
    }
    // Nodes that never saw their stop command are closed here
    for coordinator in &coordinators {
        if let Err(e) = coordinator.close().await {
            record_shutdown_error(&progress, coordinator.node_id(), &e);
        }
    }

    let completed = take(&progress.completed);
    let shutdown_errors = take(&progress.shutdown_errors);
    let report = SimulationReport {
        completed,
        total_tasks: config.tasks,
        commands_delivered: progress.commands.load(Ordering::SeqCst),
        shutdown_errors,
        elapsed: started.elapsed(),
    };
    info!(
        completed = report.completed_count(),
        total = report.total_tasks,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Simulation finished"
    );
    Ok(report)
}

fn take<T: Default>(mutex: &Mutex<T>) -> T {
    std::mem::take(&mut *mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

fn record_shutdown_error(progress: &Progress, node_id: &str, err: &CoordError) {
    warn!(%node_id, error = %err, "Node shutdown incomplete");
    progress
        .shutdown_errors
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push((node_id.to_string(), err.to_string()));
}

async fn work_loop(coordinator: Arc<Coordinator>, progress: Arc<Progress>, work: Duration, total: usize) {
    let node_id = coordinator.node_id().to_string();
    loop {
        let task_id = match coordinator.watch().await {
            Ok(task_id) => task_id,
            Err(CoordError::Closed) => break,
            Err(e) => {
                warn!(%node_id, error = %e, "Worker stopping");
                break;
            }
        };

        let jitter_ms = rand::rng().random_range(0..=(work.as_millis() as u64) / 2);
        tokio::time::sleep(work + Duration::from_millis(jitter_ms)).await;

        match coordinator.complete(&task_id).await {
            Ok(()) => {
                progress
                    .completed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .entry(node_id.clone())
                    .or_default()
                    .push(task_id);
                if progress.done.fetch_add(1, Ordering::SeqCst) + 1 >= total {
                    progress.all_done.notify_one();
                }
            }
            Err(e) => warn!(%node_id, %task_id, error = %e, "Could not complete task"),
        }
    }
    debug!(%node_id, "work_loop: done");
}

async fn command_loop(coordinator: Arc<Coordinator>, progress: Arc<Progress>) {
    let node_id = coordinator.node_id().to_string();
    loop {
        match coordinator.command().await {
            Ok(message) => {
                progress.commands.fetch_add(1, Ordering::SeqCst);
                info!(%node_id, command = %message.command, "Node received command");
                if message.command == Command::Stop {
                    if let Err(e) = coordinator.close().await {
                        record_shutdown_error(&progress, &node_id, &e);
                    }
                    break;
                }
            }
            Err(CoordError::Closed) => break,
            Err(e) => {
                warn!(%node_id, error = %e, "Command loop stopping");
                break;
            }
        }
    }
    debug!(%node_id, "command_loop: done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sim(nodes: usize, tasks: usize) -> SimulationConfig {
        let mut config = Config::default();
        config.coordinator.namespace = "/sim/".to_string();
        config.coordinator.claim_ttl_ms = 1_000;
        config.coordinator.shutdown_grace_ms = 500;
        SimulationConfig {
            timeout: Duration::from_secs(10),
            ..SimulationConfig::from_config(&config, nodes, tasks, Duration::from_millis(5))
        }
    }

    #[tokio::test]
    async fn test_every_task_completed_exactly_once() {
        let report = simulate(&sim(3, 12)).await.unwrap();

        assert!(report.is_complete(), "report: {:?}", report);
        let all: Vec<&String> = report.completed.values().flatten().collect();
        let unique: HashSet<&String> = all.iter().copied().collect();
        assert_eq!(all.len(), 12);
        assert_eq!(unique.len(), 12);
        assert_eq!(report.commands_delivered, 3);
        assert!(report.shutdown_errors.is_empty());
    }

    #[tokio::test]
    async fn test_zero_nodes_rejected() {
        assert!(matches!(
            simulate(&sim(0, 1)).await,
            Err(CoordError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_no_tasks() {
        let report = simulate(&sim(2, 0)).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.completed_count(), 0);
    }
}
