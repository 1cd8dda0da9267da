//! Decompose, execute, merge.
//!
//! [`Pipeline`] wires a [`Planner`], the validators, a [`Dispatcher`] and a
//! [`MergeCoordinator`] into a single call per goal.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::memory::ContextStore;
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::plan::{
    LogicalWarning, Plan, PlanStore, StructuralError, ValidationPolicy, validate_logic,
    validate_structure,
};
use crate::planner::{Planner, PlannerContext, PlannerError};
use crate::ui::{StatusLevel, UiSink};

/// What to do when the plan heuristics raise warnings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WarningPolicy {
    /// Report the warnings and run anyway.
    #[default]
    Proceed,
    /// Refuse to run.
    Abort,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("planning failed")]
    Planner(#[from] PlannerError),

    #[error("plan rejected")]
    Structure(#[from] StructuralError),

    #[error("plan rejected with {} warning(s)", .0.len())]
    Rejected(Vec<LogicalWarning>),

    #[error("execution aborted")]
    Dispatch(#[from] DispatchError),
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final plan, every subtask completed.
    pub plan: Plan,
    pub answer: String,
    pub warnings: Vec<LogicalWarning>,
    pub merge: MergeOutcome,
}

pub struct Pipeline {
    planner: Arc<dyn Planner>,
    agents: Arc<AgentRegistry>,
    memory: Arc<dyn ContextStore>,
    ui: Arc<dyn UiSink>,
    dispatcher: Dispatcher,
    merger: MergeCoordinator,
    policy: ValidationPolicy,
    warnings: WarningPolicy,
    store: PlanStore,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("dispatcher", &self.dispatcher)
            .field("merger", &self.merger)
            .field("policy", &self.policy)
            .field("warnings", &self.warnings)
            .field("store", &self.store)
            .finish()
    }
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: Arc<dyn Planner>,
        agents: Arc<AgentRegistry>,
        memory: Arc<dyn ContextStore>,
        ui: Arc<dyn UiSink>,
        dispatcher: Dispatcher,
        merger: MergeCoordinator,
        policy: ValidationPolicy,
        store: PlanStore,
    ) -> Self {
        Self {
            planner,
            agents,
            memory,
            ui,
            dispatcher,
            merger,
            policy,
            warnings: WarningPolicy::default(),
            store,
        }
    }

    pub fn with_warning_policy(mut self, warnings: WarningPolicy) -> Self {
        self.warnings = warnings;
        self
    }

    /// Plan, validate, execute and merge one goal.
    pub async fn run(
        &self,
        goal: &str,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let context = PlannerContext {
            agents: self.agents.summaries(),
            memory_summary: self.memory.memory_summary().await,
        };
        let plan = self.planner.plan(goal, &context).await?;
        info!(subtasks = plan.subtasks.len(), "plan received");
        self.execute(goal, plan, cancel).await
    }

    /// Validate, execute and merge an existing plan.
    pub async fn execute(
        &self,
        goal: &str,
        mut plan: Plan,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        validate_structure(&plan, &self.policy)?;

        let warnings = validate_logic(&plan);
        for warning in &warnings {
            warn!(%warning, "plan warning");
            self.ui.status(&warning.to_string(), StatusLevel::Warning);
        }
        if !warnings.is_empty() && self.warnings == WarningPolicy::Abort {
            return Err(PipelineError::Rejected(warnings));
        }

        plan.metadata
            .entry("goal")
            .or_insert_with(|| serde_json::Value::String(goal.to_string()));

        let summary = self.dispatcher.run(plan, &self.store, cancel.clone()).await?;
        let merge = self
            .merger
            .merge(goal, &summary.plan, &summary.outputs, &cancel)
            .await;
        if let Some(warning) = merge.warning() {
            warn!(%warning, "merge degraded");
        }

        Ok(RunReport {
            plan: summary.plan,
            answer: merge.answer.clone(),
            warnings,
            merge,
        })
    }
}
