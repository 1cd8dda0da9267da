//! Group-by-group plan execution.
//!
//! The dispatcher owns the plan for the duration of a run:
//!
//! 1. Subtasks are partitioned by `parallel_group`, ascending.
//! 2. Before a group starts, every dependency of every member must already
//!    be `completed`; otherwise the run aborts with
//!    [`DispatchError::DependencyUnmet`]. Nothing is reordered.
//! 3. Each member gets its own worker task. Concurrency is bounded by the
//!    group size, or by `max_parallel` when set.
//! 4. The first failure cancels members that have not started, lets running
//!    ones finish (their results are discarded), and aborts the run.
//! 5. Every status change is persisted before anything else observes it.
//!
//! Backend pools' active indices are only advanced here, between groups.

mod ledger;
pub mod prompt;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::backend::{BackendPool, EngineRoutes, PoolError, RetryPolicy};
use crate::memory::ContextStore;
use crate::plan::{PersistenceError, Plan, PlanStore, SubtaskStatus};
use crate::ui::{StatusLevel, UiSink};

use ledger::PlanLedger;
use prompt::Prerequisite;
use worker::{Worker, WorkerOutcome};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Deadline for each backend call.
    pub call_timeout: Duration,
    pub max_tokens: u32,
    /// Prior exchanges loaded from memory for each subtask.
    pub context_limit: usize,
    /// Cap on concurrent workers within a group. `None` means group size.
    pub max_parallel: Option<usize>,
    /// Agent used when a subtask names an unregistered one.
    pub default_agent: Option<String>,
    pub prefer_streaming: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(120),
            max_tokens: 4096,
            context_limit: 5,
            max_parallel: None,
            default_agent: None,
            prefer_streaming: true,
        }
    }
}

/// Fatal dispatch failures. Each aborts the run.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(
        "subtask {subtask:?} in group {group} depends on {dependency:?}, which is {status} (expected completed)"
    )]
    DependencyUnmet {
        subtask: String,
        group: u32,
        dependency: String,
        status: SubtaskStatus,
    },

    #[error("subtask {subtask:?} depends on unknown subtask {dependency:?}")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("subtask {subtask:?} failed")]
    SubtaskFailed {
        subtask: String,
        #[source]
        source: PoolError,
    },

    #[error("no agent available for subtask {subtask:?}")]
    NoAgent { subtask: String },

    #[error("failed to persist plan while {stage}")]
    Persistence {
        stage: String,
        #[source]
        source: PersistenceError,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("worker for subtask {subtask:?} panicked")]
    WorkerPanicked { subtask: String },
}

impl DispatchError {
    fn persistence(stage: impl Into<String>, source: PersistenceError) -> Self {
        Self::Persistence {
            stage: stage.into(),
            source,
        }
    }

    /// The subtask this error is about, if any.
    pub fn subtask(&self) -> Option<&str> {
        match self {
            Self::DependencyUnmet { subtask, .. }
            | Self::UnknownDependency { subtask, .. }
            | Self::SubtaskFailed { subtask, .. }
            | Self::NoAgent { subtask }
            | Self::WorkerPanicked { subtask } => Some(subtask),
            Self::Persistence { .. } | Self::Cancelled => None,
        }
    }
}

/// `error: cause: cause` rendering of an error and its sources.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The finished plan and the output of every subtask.
#[derive(Debug, Clone)]
pub struct DispatchSummary {
    pub plan: Plan,
    /// Visible output keyed by subtask id.
    pub outputs: HashMap<String, String>,
}

struct WorkerDone {
    subtask_id: String,
    result: Result<WorkerOutcome, DispatchError>,
}

/// Executes validated plans.
pub struct Dispatcher {
    agents: Arc<AgentRegistry>,
    engines: Arc<EngineRoutes>,
    memory: Arc<dyn ContextStore>,
    ui: Arc<dyn UiSink>,
    config: Arc<DispatcherConfig>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("agents", &self.agents)
            .field("engines", &self.engines)
            .field("config", &self.config)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        agents: Arc<AgentRegistry>,
        engines: Arc<EngineRoutes>,
        memory: Arc<dyn ContextStore>,
        ui: Arc<dyn UiSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            agents,
            engines,
            memory,
            ui,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run `plan` to completion, persisting it through `store`.
    ///
    /// `cancel` aborts the run: workers that have not started stay
    /// `pending`, in-flight backend calls are interrupted, and the run
    /// returns [`DispatchError::Cancelled`].
    pub async fn run(
        &self,
        plan: Plan,
        store: &PlanStore,
        cancel: CancellationToken,
    ) -> Result<DispatchSummary, DispatchError> {
        let groups = plan.groups();
        let ledger = PlanLedger::new(plan, store.clone());
        ledger
            .persist()
            .await
            .map_err(|source| DispatchError::persistence("saving the initial plan", source))?;

        let mut outputs: HashMap<String, String> = HashMap::new();
        let group_count = groups.len();

        for (position, (group, ids)) in groups.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(group, "run cancelled before group start");
                return Err(DispatchError::Cancelled);
            }

            let prerequisites = self.check_barrier(&ledger, group, &ids, &outputs).await?;

            info!(group, subtasks = ids.len(), "starting group");
            self.ui.status(
                &format!(
                    "group {group} ({}/{group_count}): {} subtask(s)",
                    position + 1,
                    ids.len()
                ),
                StatusLevel::Info,
            );

            let completed = self
                .run_group(group, &ids, prerequisites, &ledger, &cancel)
                .await?;
            outputs.extend(completed);
        }

        let plan = ledger.snapshot().await;
        self.ui.status(
            &format!("all {} subtask(s) completed", plan.subtasks.len()),
            StatusLevel::Success,
        );
        Ok(DispatchSummary { plan, outputs })
    }

    /// Verify every dependency of the group is completed and collect the
    /// outputs each member will see.
    async fn check_barrier(
        &self,
        ledger: &PlanLedger,
        group: u32,
        ids: &[String],
        outputs: &HashMap<String, String>,
    ) -> Result<HashMap<String, Vec<Prerequisite>>, DispatchError> {
        let plan = ledger.snapshot().await;
        let mut prerequisites = HashMap::new();

        for id in ids {
            let Some(subtask) = plan.subtask(id) else {
                continue;
            };
            let mut inputs = Vec::with_capacity(subtask.depends_on.len());
            for dep in &subtask.depends_on {
                let Some(parent) = plan.subtask(dep) else {
                    return Err(DispatchError::UnknownDependency {
                        subtask: id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if parent.status != SubtaskStatus::Completed {
                    warn!(
                        subtask_id = %id,
                        group,
                        dependency = %dep,
                        status = %parent.status,
                        "dependency not completed, aborting run"
                    );
                    return Err(DispatchError::DependencyUnmet {
                        subtask: id.clone(),
                        group,
                        dependency: dep.clone(),
                        status: parent.status,
                    });
                }
                inputs.push(Prerequisite {
                    id: parent.id.clone(),
                    title: parent.title.clone(),
                    output: outputs.get(dep).cloned().unwrap_or_default(),
                });
            }
            prerequisites.insert(id.clone(), inputs);
        }

        Ok(prerequisites)
    }

    async fn run_group(
        &self,
        group: u32,
        ids: &[String],
        mut prerequisites: HashMap<String, Vec<Prerequisite>>,
        ledger: &PlanLedger,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, DispatchError> {
        let group_cancel = cancel.child_token();
        let permits = self
            .config
            .max_parallel
            .unwrap_or(ids.len())
            .clamp(1, ids.len().max(1));
        let semaphore = Arc::new(Semaphore::new(permits));
        let (tx, mut rx) = mpsc::channel::<WorkerDone>(ids.len().max(1));

        let snapshot = ledger.snapshot().await;
        for id in ids {
            let Some(subtask) = snapshot.subtask(id).cloned() else {
                continue;
            };
            let worker = Worker {
                agents: Arc::clone(&self.agents),
                engines: Arc::clone(&self.engines),
                memory: Arc::clone(&self.memory),
                ui: Arc::clone(&self.ui),
                config: Arc::clone(&self.config),
                ledger: ledger.clone(),
                semaphore: Arc::clone(&semaphore),
                group_cancel: group_cancel.clone(),
                run_cancel: cancel.clone(),
                group,
            };
            let inputs = prerequisites.remove(id).unwrap_or_default();
            let tx = tx.clone();
            let subtask_id = id.clone();

            tokio::spawn(async move {
                let result = worker.run(subtask, inputs).await;
                if let Err(e) = tx.send(WorkerDone { subtask_id, result }).await {
                    debug!(subtask_id = %e.0.subtask_id, "coordinator gone, dropping worker report");
                }
            });
        }
        drop(tx);

        let mut reported = HashSet::new();
        let mut first_error: Option<DispatchError> = None;
        let mut completed = HashMap::new();
        let mut winners: Vec<(Arc<BackendPool>, usize)> = Vec::new();

        while let Some(done) = rx.recv().await {
            reported.insert(done.subtask_id.clone());
            match done.result {
                Ok(WorkerOutcome::Completed {
                    output,
                    pool,
                    backend_index,
                }) => {
                    completed.insert(done.subtask_id, output);
                    winners.push((pool, backend_index));
                }
                Ok(WorkerOutcome::Skipped) | Ok(WorkerOutcome::Discarded) => {}
                Err(e) => {
                    group_cancel.cancel();
                    if first_error.is_none() {
                        warn!(group, subtask_id = %done.subtask_id, "cancelling rest of group");
                        first_error = Some(e);
                    }
                }
            }
        }

        // A worker that never reported panicked.
        for id in ids {
            if reported.contains(id) || snapshot.subtask(id).is_none() {
                continue;
            }
            tracing::error!(subtask_id = %id, "worker panicked");
            ledger
                .mark_failed(id, "worker panicked".to_string())
                .await
                .map_err(|source| DispatchError::persistence(format!("marking {id} failed"), source))?;
            self.ui.mark_subtask_complete(id, false);
            if first_error.is_none() {
                first_error = Some(DispatchError::WorkerPanicked {
                    subtask: id.clone(),
                });
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        commit_active_backends(&winners);
        info!(group, "group completed");
        Ok(completed)
    }
}

/// Advance each pool to the first backend, in completion order, that
/// succeeded somewhere other than the pool's active backend.
fn commit_active_backends(winners: &[(Arc<BackendPool>, usize)]) {
    let mut committed: Vec<&Arc<BackendPool>> = Vec::new();
    for (pool, index) in winners {
        if committed.iter().any(|p| Arc::ptr_eq(p, pool)) {
            continue;
        }
        if *index != pool.active_index() {
            pool.set_active(*index);
            committed.push(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, PoolError};

    #[test]
    fn error_chain_includes_sources() {
        let err = DispatchError::SubtaskFailed {
            subtask: "s1".to_string(),
            source: PoolError::Exhausted {
                backends: 1,
                attempts: 2,
                last_backend: "a".to_string(),
                source: BackendError::Request("boom".to_string()),
            },
        };
        let chain = error_chain(&err);
        assert!(chain.starts_with("subtask \"s1\" failed: all 1 backend(s)"), "{chain}");
        assert!(chain.ends_with("request failed: boom"), "{chain}");
        assert_eq!(err.subtask(), Some("s1"));
    }

    #[test]
    fn config_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.retry.total_attempts(), 3);
        assert_eq!(config.context_limit, 5);
        assert!(config.max_parallel.is_none());
        assert!(config.prefer_streaming);
    }
}
