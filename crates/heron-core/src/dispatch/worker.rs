//! One subtask, from permit to persisted result.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DispatchError;
use super::DispatcherConfig;
use super::error_chain;
use super::ledger::PlanLedger;
use super::prompt::{Prerequisite, compose_task_prompt};
use crate::agent::AgentRegistry;
use crate::backend::{BackendPool, CallOptions, EngineRoutes, GenerateRequest, PoolError};
use crate::memory::ContextStore;
use crate::plan::Subtask;
use crate::ui::{StatusLevel, UiSink};

/// How a worker ended, when it did not fail.
pub(crate) enum WorkerOutcome {
    Completed {
        output: String,
        pool: Arc<BackendPool>,
        backend_index: usize,
    },
    /// Never started because the group was cancelled first.
    Skipped,
    /// Finished after the group was cancelled; the result was dropped.
    Discarded,
}

pub(crate) struct Worker {
    pub(crate) agents: Arc<AgentRegistry>,
    pub(crate) engines: Arc<EngineRoutes>,
    pub(crate) memory: Arc<dyn ContextStore>,
    pub(crate) ui: Arc<dyn UiSink>,
    pub(crate) config: Arc<DispatcherConfig>,
    pub(crate) ledger: PlanLedger,
    pub(crate) semaphore: Arc<Semaphore>,
    /// Stops workers that have not started yet.
    pub(crate) group_cancel: CancellationToken,
    /// Interrupts in-flight backend calls.
    pub(crate) run_cancel: CancellationToken,
    pub(crate) group: u32,
}

impl Worker {
    pub(crate) async fn run(
        self,
        subtask: Subtask,
        prerequisites: Vec<Prerequisite>,
    ) -> Result<WorkerOutcome, DispatchError> {
        let id = subtask.id.clone();

        let permit = tokio::select! {
            biased;
            _ = self.group_cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            debug!(subtask_id = %id, group = self.group, "group cancelled before start");
            return Ok(WorkerOutcome::Skipped);
        };
        if self.group_cancel.is_cancelled() {
            debug!(subtask_id = %id, group = self.group, "group cancelled before start");
            return Ok(WorkerOutcome::Skipped);
        }

        let Some(agent) = self
            .agents
            .resolve(&subtask.agent_key, self.config.default_agent.as_deref())
            .cloned()
        else {
            let message = "no agents registered".to_string();
            self.group_cancel.cancel();
            self.ledger
                .mark_failed(&id, message)
                .await
                .map_err(|source| DispatchError::persistence(format!("marking {id} failed"), source))?;
            self.ui.mark_subtask_complete(&id, false);
            return Err(DispatchError::NoAgent { subtask: id });
        };

        self.ledger
            .mark_running(&id)
            .await
            .map_err(|source| DispatchError::persistence(format!("marking {id} running"), source))?;
        info!(
            subtask_id = %id,
            group = self.group,
            agent = %agent.key,
            engine = %subtask.engine,
            "subtask running"
        );
        self.ui
            .stream_prefix(&format!("[{}] {} ({})", id, subtask.title, agent.key));

        let history = match self
            .memory
            .load_relevant_context(&agent.key, &subtask.objective, self.config.context_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(subtask_id = %id, error = %e, "could not load prior context, continuing without it");
                Vec::new()
            }
        };

        let prompt = compose_task_prompt(&subtask, &prerequisites);
        let request = GenerateRequest::new(agent.system_prompt.clone(), prompt.clone())
            .with_history(history)
            .with_timeout(self.config.call_timeout)
            .with_max_tokens(self.config.max_tokens);

        let pool = Arc::clone(self.engines.resolve(&subtask.engine));
        let ui = Arc::clone(&self.ui);
        let sink = move |chunk: &str| ui.streaming_chunk(chunk);
        let options = CallOptions::new(self.config.retry)
            .with_stream(self.config.prefer_streaming)
            .with_cancel(self.run_cancel.clone())
            .with_chunk_sink(&sink);

        match pool.invoke_from(pool.active_index(), &request, &options).await {
            Ok(invocation) => {
                if self.group_cancel.is_cancelled() {
                    info!(subtask_id = %id, "group cancelled while running, discarding result");
                    self.ledger.reset_pending(&id).await.map_err(|source| {
                        DispatchError::persistence(format!("resetting {id}"), source)
                    })?;
                    return Ok(WorkerOutcome::Discarded);
                }

                let result_ref = match self
                    .memory
                    .save_conversation(&agent.key, &prompt, &invocation.text)
                    .await
                {
                    Ok(result_ref) => Some(result_ref),
                    Err(e) => {
                        warn!(subtask_id = %id, error = %e, "could not save conversation, continuing");
                        None
                    }
                };

                self.ledger
                    .mark_completed(&id, result_ref)
                    .await
                    .map_err(|source| {
                        DispatchError::persistence(format!("marking {id} completed"), source)
                    })?;
                self.ui.mark_subtask_complete(&id, true);
                info!(
                    subtask_id = %id,
                    backend = %invocation.backend_name,
                    streamed = invocation.streamed,
                    "subtask completed"
                );

                Ok(WorkerOutcome::Completed {
                    output: invocation.text,
                    pool,
                    backend_index: invocation.backend_index,
                })
            }
            Err(PoolError::Cancelled) => {
                self.ledger.reset_pending(&id).await.map_err(|source| {
                    DispatchError::persistence(format!("resetting {id}"), source)
                })?;
                info!(subtask_id = %id, "subtask interrupted");
                Err(DispatchError::Cancelled)
            }
            Err(e) => {
                let message = error_chain(&e);
                error!(subtask_id = %id, error = %message, "subtask failed");
                // Siblings waiting for a permit must see this before ours is released.
                self.group_cancel.cancel();
                self.ledger
                    .mark_failed(&id, message.clone())
                    .await
                    .map_err(|source| {
                        DispatchError::persistence(format!("marking {id} failed"), source)
                    })?;
                self.ui.mark_subtask_complete(&id, false);
                self.ui
                    .status(&format!("subtask {id} failed: {message}"), StatusLevel::Error);
                Err(DispatchError::SubtaskFailed {
                    subtask: id,
                    source: e,
                })
            }
        }
    }
}
