//! The planner seam.
//!
//! How a goal becomes a plan is outside this crate; a [`Planner`] only has
//! to return a [`Plan`]. [`parse_plan_response`] helps implementations that
//! get the plan as raw model output, and [`FilePlanner`] serves a plan
//! written ahead of time.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::AgentSummary;
use crate::plan::Plan;
use crate::stream::strip_think_tags;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("failed to read plan from {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("planner response contains no JSON object")]
    NoJson,

    #[error("planner returned invalid plan JSON")]
    InvalidJson(#[source] serde_json::Error),

    #[error("planner failed: {0}")]
    Other(String),
}

/// What the planner is told about the runtime.
#[derive(Debug, Clone, Default)]
pub struct PlannerContext {
    pub agents: Vec<AgentSummary>,
    pub memory_summary: String,
}

/// Turns a goal into a plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, context: &PlannerContext) -> Result<Plan, PlannerError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Planner) {}
};

/// Extract a plan from raw model output.
///
/// Think blocks are dropped first. A fenced ```json block wins; otherwise
/// the outermost `{ ... }` span is parsed.
pub fn parse_plan_response(text: &str) -> Result<Plan, PlannerError> {
    let visible = strip_think_tags(text).visible;
    let json = fenced_json(&visible)
        .or_else(|| outermost_object(&visible))
        .ok_or(PlannerError::NoJson)?;
    Plan::from_json(json).map_err(PlannerError::InvalidJson)
}

fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    let body = rest[..end].trim();
    (!body.is_empty()).then_some(body)
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Serves the plan stored in a JSON file, whatever the goal.
#[derive(Debug, Clone)]
pub struct FilePlanner {
    path: PathBuf,
}

impl FilePlanner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Planner for FilePlanner {
    async fn plan(&self, goal: &str, context: &PlannerContext) -> Result<Plan, PlannerError> {
        tracing::debug!(
            path = %self.path.display(),
            goal,
            agents = context.agents.len(),
            "loading plan from file"
        );
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PlannerError::Io {
                path: self.path.clone(),
                source,
            })?;
        parse_plan_response(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{"subtasks": [{"id": "s1", "title": "T", "objective": "O",
        "agent_key": "coder", "engine": "local", "parallel_group": 1}]}"#;

    #[test]
    fn parses_bare_json() {
        let plan = parse_plan_response(PLAN).unwrap();
        assert_eq!(plan.subtasks[0].id, "s1");
    }

    #[test]
    fn prefers_fenced_block_and_ignores_thoughts() {
        let text = format!(
            "<think>maybe {{\"subtasks\": []}}</think>Here is the plan:\n```json\n{PLAN}\n```\nDone {{}}"
        );
        let plan = parse_plan_response(&text).unwrap();
        assert_eq!(plan.subtasks.len(), 1);
    }

    #[test]
    fn falls_back_to_outermost_braces() {
        let text = format!("Sure! {PLAN} Let me know.");
        assert!(parse_plan_response(&text).is_ok());
    }

    #[test]
    fn reports_missing_and_invalid_json() {
        assert!(matches!(
            parse_plan_response("no plan here").unwrap_err(),
            PlannerError::NoJson
        ));
        assert!(matches!(
            parse_plan_response("{\"subtasks\": 3}").unwrap_err(),
            PlannerError::InvalidJson(_)
        ));
    }

    #[tokio::test]
    async fn file_planner_reads_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, PLAN).unwrap();

        let plan = FilePlanner::new(&path)
            .plan("anything", &PlannerContext::default())
            .await
            .unwrap();
        assert_eq!(plan.subtasks.len(), 1);

        let err = FilePlanner::new(dir.path().join("missing.json"))
            .plan("anything", &PlannerContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Io { .. }));
    }
}
