//! `heron validate` command: structural and logical checks without running.

use std::path::Path;

use anyhow::{Context, Result};

use heron_core::plan::{Plan, validate_logic, validate_structure};
use heron_core::planner::parse_plan_response;

use crate::config::HeronConfig;

/// Read a plan document. Raw model output with a fenced or embedded JSON
/// object is accepted as well as a bare plan.
pub fn read_plan(path: &Path) -> Result<Plan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    parse_plan_response(&text).with_context(|| format!("failed to parse plan {}", path.display()))
}

/// Run the validate command. Returns the number of warnings.
pub fn run_validate(config: &HeronConfig, path: &Path) -> Result<usize> {
    let plan = read_plan(path)?;
    validate_structure(&plan, &config.policy)
        .with_context(|| format!("plan {} is invalid", path.display()))?;

    let groups = plan.groups();
    println!(
        "Plan OK: {} subtask(s) in {} group(s)",
        plan.subtasks.len(),
        groups.len()
    );
    for (group, ids) in &groups {
        println!("  group {group}: {}", ids.join(", "));
    }

    let warnings = validate_logic(&plan);
    if !warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &warnings {
            println!("  - {warning}");
        }
    }
    Ok(warnings.len())
}
