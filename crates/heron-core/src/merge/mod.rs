//! Final synthesis of subtask outputs.
//!
//! The coordinator asks a backend pool to combine every subtask output into
//! one answer. When that fails, or the answer is empty once think blocks are
//! stripped, it falls back to a deterministic concatenation. Merging never
//! fails a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendPool, CallOptions, GenerateRequest, PoolError, RetryPolicy};
use crate::dispatch::error_chain;
use crate::memory::ContextStore;
use crate::plan::{Plan, Subtask};
use crate::ui::{StatusLevel, UiSink};

const DEFAULT_SYSTEM_PROMPT: &str = "You combine the results of completed subtasks into one \
coherent final answer for the user's goal. Use only the provided results.";

/// Recoverable merge failures. Each one triggers the deterministic fallback.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("synthesis call failed")]
    Backend(#[source] PoolError),

    #[error("synthesis returned no visible text")]
    EmptyResponse,
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub max_tokens: u32,
    pub prefer_streaming: bool,
    pub system_prompt: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(120),
            max_tokens: 4096,
            prefer_streaming: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// How the final answer was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    Synthesized { backend: String },
    /// Fallback concatenation; `reason` explains why synthesis was skipped.
    Deterministic { reason: String },
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub answer: String,
    pub mode: MergeMode,
    pub thoughts: Vec<String>,
}

impl MergeOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self.mode, MergeMode::Deterministic { .. })
    }

    /// Warning to show alongside a degraded answer.
    pub fn warning(&self) -> Option<String> {
        match &self.mode {
            MergeMode::Deterministic { reason } => {
                Some(format!("synthesis unavailable ({reason}); showing concatenated results"))
            }
            MergeMode::Synthesized { .. } => None,
        }
    }
}

pub struct MergeCoordinator {
    pool: Arc<BackendPool>,
    memory: Arc<dyn ContextStore>,
    ui: Arc<dyn UiSink>,
    config: MergeConfig,
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}

impl MergeCoordinator {
    pub fn new(
        pool: Arc<BackendPool>,
        memory: Arc<dyn ContextStore>,
        ui: Arc<dyn UiSink>,
        config: MergeConfig,
    ) -> Self {
        Self {
            pool,
            memory,
            ui,
            config,
        }
    }

    /// Produce the final answer for `goal`.
    ///
    /// Outputs are read through each subtask's `result_ref`; `fallback_outputs`
    /// (keyed by subtask id) covers subtasks whose output was never stored.
    pub async fn merge(
        &self,
        goal: &str,
        plan: &Plan,
        fallback_outputs: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> MergeOutcome {
        let outputs = self.collect_outputs(plan, fallback_outputs).await;

        match self.synthesize(goal, plan, &outputs, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = error_chain(&e);
                warn!(error = %reason, "falling back to deterministic merge");
                self.ui
                    .status(&format!("merge degraded: {reason}"), StatusLevel::Warning);
                MergeOutcome {
                    answer: deterministic_merge(plan, &outputs),
                    mode: MergeMode::Deterministic { reason },
                    thoughts: Vec::new(),
                }
            }
        }
    }

    async fn collect_outputs(
        &self,
        plan: &Plan,
        fallback_outputs: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut outputs = HashMap::new();
        for subtask in &plan.subtasks {
            let stored = match &subtask.result_ref {
                Some(result_ref) => match self.memory.load_result(result_ref).await {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(subtask_id = %subtask.id, error = %e, "could not load stored result");
                        None
                    }
                },
                None => None,
            };
            if let Some(text) = stored.or_else(|| fallback_outputs.get(&subtask.id).cloned()) {
                outputs.insert(subtask.id.clone(), text);
            }
        }
        outputs
    }

    async fn synthesize(
        &self,
        goal: &str,
        plan: &Plan,
        outputs: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome, MergeError> {
        let request = GenerateRequest::new(
            self.config.system_prompt.clone(),
            synthesis_prompt(goal, plan, outputs),
        )
        .with_timeout(self.config.call_timeout)
        .with_max_tokens(self.config.max_tokens);

        self.ui.stream_prefix("merge");
        let ui = Arc::clone(&self.ui);
        let sink = move |chunk: &str| ui.streaming_chunk(chunk);
        let options = CallOptions::new(self.config.retry)
            .with_stream(self.config.prefer_streaming)
            .with_cancel(cancel.clone())
            .with_chunk_sink(&sink);

        let invocation = self
            .pool
            .invoke(&request, &options)
            .await
            .map_err(MergeError::Backend)?;

        let answer = invocation.text.trim();
        if answer.is_empty() {
            return Err(MergeError::EmptyResponse);
        }

        info!(backend = %invocation.backend_name, "merge synthesized");
        Ok(MergeOutcome {
            answer: answer.to_string(),
            mode: MergeMode::Synthesized {
                backend: invocation.backend_name,
            },
            thoughts: invocation.thoughts,
        })
    }
}

fn synthesis_prompt(goal: &str, plan: &Plan, outputs: &HashMap<String, String>) -> String {
    let mut prompt = format!("Goal: {}\n", goal.trim());

    let strategy = plan.merge.strategy.trim();
    if !strategy.is_empty() {
        prompt.push_str(&format!("Merge strategy: {strategy}\n"));
    }
    if !plan.merge.steps.is_empty() {
        prompt.push_str("Merge steps:\n");
        for (index, step) in plan.merge.steps.iter().enumerate() {
            prompt.push_str(&format!("{}. {}: {}", index + 1, step.title, step.description));
            if !step.depends_on.is_empty() {
                prompt.push_str(&format!(" (uses {})", step.depends_on.join(", ")));
            }
            prompt.push('\n');
        }
    }

    prompt.push_str("\nSubtask results:\n");
    for subtask in &plan.subtasks {
        prompt.push_str(&format!(
            "\n### [{}] {}\n{}\n",
            subtask.id,
            subtask.title,
            output_or_placeholder(subtask, outputs)
        ));
    }

    prompt.push_str("\nWrite the final answer to the goal.\n");
    prompt
}

fn output_or_placeholder<'a>(subtask: &Subtask, outputs: &'a HashMap<String, String>) -> &'a str {
    match outputs.get(&subtask.id).map(|o| o.trim()) {
        Some(output) if !output.is_empty() => output,
        _ => "(no output)",
    }
}

/// Concatenate every subtask as a labeled section. Never empty for a plan
/// with at least one subtask, even when all outputs are empty.
pub fn deterministic_merge(plan: &Plan, outputs: &HashMap<String, String>) -> String {
    if plan.subtasks.is_empty() {
        return "(no subtasks)".to_string();
    }
    plan.subtasks
        .iter()
        .map(|subtask| {
            format!(
                "## [{}] {}\nObjective: {}\n\n{}",
                subtask.id,
                subtask.title,
                subtask.objective,
                output_or_placeholder(subtask, outputs)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{MergeSpec, MergeStep};

    fn plan() -> Plan {
        Plan::new(vec![
            Subtask::new("s1", "Survey", "Read the code", "coder", "local", 1),
            Subtask::new("s2", "Patch", "Fix the bug", "coder", "local", 2).with_depends_on(["s1"]),
        ])
        .with_merge(MergeSpec {
            strategy: "Explain the fix".to_string(),
            steps: vec![MergeStep {
                title: "Report".to_string(),
                description: "Summarize the patch".to_string(),
                depends_on: vec!["s2".to_string()],
            }],
        })
    }

    #[test]
    fn deterministic_merge_labels_sections() {
        let outputs = HashMap::from([("s1".to_string(), "found it\n".to_string())]);
        let text = deterministic_merge(&plan(), &outputs);
        assert_eq!(
            text,
            "## [s1] Survey\nObjective: Read the code\n\nfound it\n\n\
             ## [s2] Patch\nObjective: Fix the bug\n\n(no output)"
        );
    }

    #[test]
    fn deterministic_merge_is_never_empty() {
        assert!(!deterministic_merge(&plan(), &HashMap::new()).is_empty());
        assert!(!deterministic_merge(&Plan::new(vec![]), &HashMap::new()).is_empty());
    }

    #[test]
    fn synthesis_prompt_labels_outputs_by_id() {
        let outputs = HashMap::from([
            ("s1".to_string(), "survey notes".to_string()),
            ("s2".to_string(), "patch diff".to_string()),
        ]);
        let prompt = synthesis_prompt("Fix the parser", &plan(), &outputs);
        assert!(prompt.starts_with("Goal: Fix the parser\nMerge strategy: Explain the fix\n"));
        assert!(prompt.contains("1. Report: Summarize the patch (uses s2)\n"));
        assert!(prompt.contains("### [s1] Survey\nsurvey notes\n"));
        assert!(prompt.contains("### [s2] Patch\npatch diff\n"));
    }

    #[test]
    fn degraded_outcome_has_warning() {
        let outcome = MergeOutcome {
            answer: "x".to_string(),
            mode: MergeMode::Deterministic {
                reason: "synthesis returned no visible text".to_string(),
            },
            thoughts: vec![],
        };
        assert!(outcome.is_degraded());
        assert!(outcome.warning().unwrap().contains("no visible text"));
    }
}
