//! `heron show` command: print the status table of a persisted plan.

use std::path::Path;

use anyhow::Result;

use heron_core::plan::{Plan, PlanStore, SubtaskStatus};

/// Run the show command.
pub async fn run_show(path: &Path) -> Result<()> {
    let plan = PlanStore::new(path).load().await?;
    print!("{}", render_status(&plan));
    Ok(())
}

fn status_icon(status: SubtaskStatus) -> &'static str {
    match status {
        SubtaskStatus::Pending => ".",
        SubtaskStatus::Running => "*",
        SubtaskStatus::Completed => "+",
        SubtaskStatus::Failed => "!",
    }
}

pub fn render_status(plan: &Plan) -> String {
    let mut out = String::new();

    if let Some(goal) = plan.metadata.get("goal").and_then(|v| v.as_str()) {
        out.push_str(&format!("Goal: {goal}\n"));
    }
    let progress = plan.progress();
    out.push_str(&format!(
        "Progress: {}/{} completed\n",
        progress.completed,
        plan.subtasks.len()
    ));
    out.push_str(&format!(
        "  pending={} running={} completed={} failed={}\n\n",
        progress.pending, progress.running, progress.completed, progress.failed
    ));

    out.push_str(&format!(
        "    {:<12} {:>5} {:<10} {:<12} {:<13} {}\n",
        "ID", "GROUP", "STATUS", "AGENT", "ENGINE", "TITLE"
    ));
    out.push_str(&format!("{}\n", "-".repeat(80)));

    for (group, ids) in plan.groups() {
        for id in ids {
            let Some(subtask) = plan.subtask(&id) else {
                continue;
            };
            let title = if subtask.title.chars().count() > 30 {
                format!("{}...", subtask.title.chars().take(27).collect::<String>())
            } else {
                subtask.title.clone()
            };
            out.push_str(&format!(
                "[{}] {:<12} {:>5} {:<10} {:<12} {:<13} {}\n",
                status_icon(subtask.status),
                subtask.id,
                group,
                subtask.status,
                subtask.agent_key,
                subtask.engine,
                title
            ));
            if let Some(error) = &subtask.error {
                out.push_str(&format!("      error: {error}\n"));
            }
        }
    }
    out
}
