//! Task prompt composition.

use crate::plan::Subtask;

/// Output of a completed dependency, as shown to a dependent subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    pub id: String,
    pub title: String,
    pub output: String,
}

pub fn compose_task_prompt(subtask: &Subtask, prerequisites: &[Prerequisite]) -> String {
    let mut prompt = format!(
        "Subtask: {}\nTitle: {}\nObjective: {}\n",
        subtask.id, subtask.title, subtask.objective
    );
    if !subtask.notes.trim().is_empty() {
        prompt.push_str(&format!("Notes: {}\n", subtask.notes.trim()));
    }

    if !prerequisites.is_empty() {
        prompt.push_str("\nResults from prerequisite subtasks:\n");
        for prerequisite in prerequisites {
            let output = prerequisite.output.trim();
            prompt.push_str(&format!(
                "\n### [{}] {}\n{}\n",
                prerequisite.id,
                prerequisite.title,
                if output.is_empty() { "(no output)" } else { output }
            ));
        }
    }

    prompt.push_str("\nComplete the objective above and reply with the result only.\n");
    prompt
}
