//! Plan validation.
//!
//! Two independent passes with different failure policies:
//! - [`validate_structure`] enforces the document invariants. Any violation
//!   is fatal and rejects the plan before execution.
//! - [`validate_logic`] runs heuristics and returns [`LogicalWarning`]s that
//!   the caller may choose to ignore.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use super::{Plan, Subtask};

/// Maximum length, in characters, of single-line plan fields.
pub const MAX_FIELD_CHARS: usize = 160;

/// Merge strategies that carry no information.
const PLACEHOLDER_STRATEGIES: &[&str] = &[
    "",
    "n/a",
    "na",
    "none",
    "tbd",
    "todo",
    "default",
    "merge",
    "merge results",
    "merge all results",
    "combine",
    "combine results",
    "combine all results",
    "combine outputs",
    "concatenate",
    "concatenate results",
    "summarize",
    "summarize results",
];

/// Caller-supplied limits applied by [`validate_structure`].
#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    pub allowed_agents: BTreeSet<String>,
    pub allowed_engines: BTreeSet<String>,
    /// Upper bound on the number of subtasks, if any.
    pub max_subtasks: Option<usize>,
}

impl ValidationPolicy {
    pub fn new<A, E, S, T>(agents: A, engines: E) -> Self
    where
        A: IntoIterator<Item = S>,
        S: Into<String>,
        E: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            allowed_agents: agents.into_iter().map(Into::into).collect(),
            allowed_engines: engines.into_iter().map(Into::into).collect(),
            max_subtasks: None,
        }
    }

    pub fn with_max_subtasks(mut self, max: usize) -> Self {
        self.max_subtasks = Some(max);
        self
    }
}

/// A violated plan invariant. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("plan must contain at least one subtask")]
    NoSubtasks,

    #[error("plan has {count} subtasks, policy allows at most {max}")]
    TooManySubtasks { count: usize, max: usize },

    #[error("duplicate subtask id: {0:?}")]
    DuplicateId(String),

    #[error("subtask {subtask:?} depends on unknown subtask {dependency:?}")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("subtask {0:?} depends on itself")]
    SelfDependency(String),

    #[error("subtask {subtask:?} has parallel_group {group} (must be >= 1)")]
    InvalidGroup { subtask: String, group: u32 },

    #[error("subtask {subtask:?} uses agent {agent:?}, which is not allowed")]
    AgentNotAllowed { subtask: String, agent: String },

    #[error("subtask {subtask:?} uses engine {engine:?}, which is not allowed")]
    EngineNotAllowed { subtask: String, engine: String },

    #[error("subtask {subtask:?} field {field} is {len} chars (max 160)")]
    FieldTooLong {
        subtask: String,
        field: &'static str,
        len: usize,
    },

    #[error("subtask {subtask:?} field {field} contains a line break")]
    FieldHasNewline { subtask: String, field: &'static str },

    #[error("merge strategy is {len} chars (max 160)")]
    StrategyTooLong { len: usize },

    #[error("merge step {step} description is {len} chars (max 160)")]
    MergeStepTooLong { step: usize, len: usize },

    #[error("merge step {step} depends on unknown subtask {dependency:?}")]
    UnknownMergeDependency { step: usize, dependency: String },
}

/// A non-fatal smell in an otherwise valid plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogicalWarning {
    #[error("subtasks {first:?} and {second:?} share the title {title:?}")]
    DuplicateTitle {
        first: String,
        second: String,
        title: String,
    },

    #[error("subtasks {first:?} and {second:?} share the same objective")]
    DuplicateObjective { first: String, second: String },

    #[error("subtask {subtask:?} repeats the objective of its only parent {parent:?}")]
    RedundantHop { subtask: String, parent: String },

    #[error("subtask {subtask:?} declares no dependencies; one may be missing")]
    MissingDependency { subtask: String },

    #[error("merge strategy {strategy:?} is a generic placeholder")]
    PlaceholderMergeStrategy { strategy: String },

    #[error(
        "subtask {subtask:?} (group {group}) depends on {dependency:?} (group {dependency_group}), which does not run earlier"
    )]
    DependencyNotEarlier {
        subtask: String,
        group: u32,
        dependency: String,
        dependency_group: u32,
    },
}

// ---------------------------------------------------------------------------
// Structure
// ---------------------------------------------------------------------------

/// Check every plan invariant against `policy`.
///
/// Pure: the plan is not modified and repeated calls return the same result.
pub fn validate_structure(plan: &Plan, policy: &ValidationPolicy) -> Result<(), StructuralError> {
    if plan.subtasks.is_empty() {
        return Err(StructuralError::NoSubtasks);
    }
    if let Some(max) = policy.max_subtasks {
        if plan.subtasks.len() > max {
            return Err(StructuralError::TooManySubtasks {
                count: plan.subtasks.len(),
                max,
            });
        }
    }

    let mut ids = HashSet::new();
    for subtask in &plan.subtasks {
        if !ids.insert(subtask.id.as_str()) {
            return Err(StructuralError::DuplicateId(subtask.id.clone()));
        }
    }

    for subtask in &plan.subtasks {
        check_subtask(subtask, &ids, policy)?;
    }

    check_merge(plan, &ids)
}

fn check_subtask(
    subtask: &Subtask,
    ids: &HashSet<&str>,
    policy: &ValidationPolicy,
) -> Result<(), StructuralError> {
    for (field, value) in [
        ("title", &subtask.title),
        ("objective", &subtask.objective),
        ("notes", &subtask.notes),
    ] {
        check_line(&subtask.id, field, value)?;
    }

    if subtask.parallel_group < 1 {
        return Err(StructuralError::InvalidGroup {
            subtask: subtask.id.clone(),
            group: subtask.parallel_group,
        });
    }

    if !policy.allowed_agents.contains(&subtask.agent_key) {
        return Err(StructuralError::AgentNotAllowed {
            subtask: subtask.id.clone(),
            agent: subtask.agent_key.clone(),
        });
    }
    if !policy.allowed_engines.contains(&subtask.engine) {
        return Err(StructuralError::EngineNotAllowed {
            subtask: subtask.id.clone(),
            engine: subtask.engine.clone(),
        });
    }

    for dep in &subtask.depends_on {
        if *dep == subtask.id {
            return Err(StructuralError::SelfDependency(subtask.id.clone()));
        }
        if !ids.contains(dep.as_str()) {
            return Err(StructuralError::UnknownDependency {
                subtask: subtask.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    Ok(())
}

fn check_line(subtask: &str, field: &'static str, value: &str) -> Result<(), StructuralError> {
    if value.contains(['\n', '\r']) {
        return Err(StructuralError::FieldHasNewline {
            subtask: subtask.to_owned(),
            field,
        });
    }
    let len = value.chars().count();
    if len > MAX_FIELD_CHARS {
        return Err(StructuralError::FieldTooLong {
            subtask: subtask.to_owned(),
            field,
            len,
        });
    }
    Ok(())
}

fn check_merge(plan: &Plan, ids: &HashSet<&str>) -> Result<(), StructuralError> {
    let len = plan.merge.strategy.chars().count();
    if len > MAX_FIELD_CHARS {
        return Err(StructuralError::StrategyTooLong { len });
    }

    for (index, step) in plan.merge.steps.iter().enumerate() {
        let len = step.description.chars().count();
        if len > MAX_FIELD_CHARS {
            return Err(StructuralError::MergeStepTooLong { step: index, len });
        }
        if let Some(unknown) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(StructuralError::UnknownMergeDependency {
                step: index,
                dependency: unknown.clone(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

/// Run the plan heuristics. Never fails, even on structurally invalid plans.
pub fn validate_logic(plan: &Plan) -> Vec<LogicalWarning> {
    let mut warnings = Vec::new();

    let mut titles: HashMap<String, &str> = HashMap::new();
    let mut objectives: HashMap<String, &str> = HashMap::new();
    for subtask in &plan.subtasks {
        let title = normalize(&subtask.title);
        if !title.is_empty() {
            if let Some(first) = titles.get(&title) {
                warnings.push(LogicalWarning::DuplicateTitle {
                    first: (*first).to_owned(),
                    second: subtask.id.clone(),
                    title: subtask.title.clone(),
                });
            } else {
                titles.insert(title, &subtask.id);
            }
        }

        let objective = normalize(&subtask.objective);
        if !objective.is_empty() {
            if let Some(first) = objectives.get(&objective) {
                warnings.push(LogicalWarning::DuplicateObjective {
                    first: (*first).to_owned(),
                    second: subtask.id.clone(),
                });
            } else {
                objectives.insert(objective, &subtask.id);
            }
        }
    }

    for (index, subtask) in plan.subtasks.iter().enumerate() {
        if let [parent_id] = subtask.depends_on.as_slice() {
            let repeated = plan.subtask(parent_id).filter(|parent| {
                parent.id != subtask.id
                    && normalize(&parent.objective) == normalize(&subtask.objective)
            });
            if let Some(parent) = repeated {
                warnings.push(LogicalWarning::RedundantHop {
                    subtask: subtask.id.clone(),
                    parent: parent.id.clone(),
                });
            }
        }

        if index > 0 && subtask.depends_on.is_empty() {
            warnings.push(LogicalWarning::MissingDependency {
                subtask: subtask.id.clone(),
            });
        }

        for dep in &subtask.depends_on {
            let Some(parent) = plan.subtask(dep) else {
                continue;
            };
            if parent.id != subtask.id && parent.parallel_group >= subtask.parallel_group {
                warnings.push(LogicalWarning::DependencyNotEarlier {
                    subtask: subtask.id.clone(),
                    group: subtask.parallel_group,
                    dependency: parent.id.clone(),
                    dependency_group: parent.parallel_group,
                });
            }
        }
    }

    let strategy = normalize(&plan.merge.strategy);
    let strategy = strategy.trim_end_matches('.');
    if PLACEHOLDER_STRATEGIES.contains(&strategy) {
        warnings.push(LogicalWarning::PlaceholderMergeStrategy {
            strategy: plan.merge.strategy.clone(),
        });
    }

    warnings
}

/// Lowercase and collapse runs of whitespace.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{MergeSpec, MergeStep};

    fn policy() -> ValidationPolicy {
        ValidationPolicy::new(["coder", "reviewer"], ["local", "cloud", "tool-enabled"])
    }

    fn valid_plan() -> Plan {
        Plan::new(vec![
            Subtask::new("s1", "Survey", "Read the parser module", "coder", "local", 1),
            Subtask::new("s2", "Patch", "Fix the tokenizer bug", "coder", "cloud", 2)
                .with_depends_on(["s1"]),
            Subtask::new("s3", "Review", "Review the fix for regressions", "reviewer", "local", 2)
                .with_depends_on(["s1"]),
        ])
        .with_merge(MergeSpec {
            strategy: "Describe the fix and the review findings".to_string(),
            steps: vec![MergeStep {
                title: "Report".to_string(),
                description: "Summarize the patch".to_string(),
                depends_on: vec!["s2".to_string(), "s3".to_string()],
            }],
        })
    }

    #[test]
    fn accepts_valid_plan() {
        validate_structure(&valid_plan(), &policy()).expect("valid plan");
    }

    #[test]
    fn valid_plan_has_no_warnings() {
        assert!(validate_logic(&valid_plan()).is_empty());
    }

    #[test]
    fn rejects_empty_plan() {
        let err = validate_structure(&Plan::new(vec![]), &policy()).unwrap_err();
        assert_eq!(err, StructuralError::NoSubtasks);
    }

    #[test]
    fn enforces_max_subtasks() {
        let err = validate_structure(&valid_plan(), &policy().with_max_subtasks(2)).unwrap_err();
        assert_eq!(err, StructuralError::TooManySubtasks { count: 3, max: 2 });
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut plan = valid_plan();
        plan.subtasks[2].id = "s2".to_string();
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(
            matches!(err, StructuralError::DuplicateId(ref id) if id == "s2"),
            "expected DuplicateId, got: {err}"
        );
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut plan = valid_plan();
        plan.subtasks[1].depends_on = vec!["ghost".to_string()];
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(
            matches!(err, StructuralError::UnknownDependency { ref dependency, .. } if dependency == "ghost"),
            "expected UnknownDependency, got: {err}"
        );
    }

    #[test]
    fn rejects_self_dependency() {
        let mut plan = valid_plan();
        plan.subtasks[1].depends_on = vec!["s2".to_string()];
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert_eq!(err, StructuralError::SelfDependency("s2".to_string()));
    }

    #[test]
    fn rejects_group_zero() {
        let mut plan = valid_plan();
        plan.subtasks[0].parallel_group = 0;
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(
            matches!(err, StructuralError::InvalidGroup { group: 0, .. }),
            "expected InvalidGroup, got: {err}"
        );
    }

    #[test]
    fn rejects_agent_and_engine_outside_whitelist() {
        let mut plan = valid_plan();
        plan.subtasks[0].agent_key = "intruder".to_string();
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(matches!(err, StructuralError::AgentNotAllowed { .. }));

        let mut plan = valid_plan();
        plan.subtasks[0].engine = "quantum".to_string();
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(matches!(err, StructuralError::EngineNotAllowed { .. }));
    }

    #[test]
    fn field_limit_counts_characters_not_bytes() {
        let mut plan = valid_plan();
        plan.subtasks[0].title = "é".repeat(MAX_FIELD_CHARS);
        validate_structure(&plan, &policy()).expect("160 chars is allowed");

        plan.subtasks[0].title.push('é');
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(
            matches!(err, StructuralError::FieldTooLong { field: "title", len: 161, .. }),
            "expected FieldTooLong, got: {err}"
        );
    }

    #[test]
    fn rejects_newlines_in_fields() {
        let mut plan = valid_plan();
        plan.subtasks[2].notes = "line one\nline two".to_string();
        let err = validate_structure(&plan, &policy()).unwrap_err();
        assert!(matches!(
            err,
            StructuralError::FieldHasNewline { field: "notes", .. }
        ));
    }

    #[test]
    fn rejects_bad_merge_spec() {
        let mut plan = valid_plan();
        plan.merge.strategy = "x".repeat(MAX_FIELD_CHARS + 1);
        assert!(matches!(
            validate_structure(&plan, &policy()).unwrap_err(),
            StructuralError::StrategyTooLong { .. }
        ));

        let mut plan = valid_plan();
        plan.merge.steps[0].depends_on.push("s9".to_string());
        assert!(matches!(
            validate_structure(&plan, &policy()).unwrap_err(),
            StructuralError::UnknownMergeDependency { step: 0, .. }
        ));

        let mut plan = valid_plan();
        plan.merge.steps[0].description = "y".repeat(MAX_FIELD_CHARS + 1);
        assert!(matches!(
            validate_structure(&plan, &policy()).unwrap_err(),
            StructuralError::MergeStepTooLong { step: 0, .. }
        ));
    }

    #[test]
    fn structure_check_is_idempotent() {
        let mut plan = valid_plan();
        assert_eq!(
            validate_structure(&plan, &policy()),
            validate_structure(&plan, &policy())
        );
        plan.subtasks[0].engine = "quantum".to_string();
        assert_eq!(
            validate_structure(&plan, &policy()),
            validate_structure(&plan, &policy())
        );
    }

    #[test]
    fn warns_on_duplicates_after_normalizing() {
        let mut plan = valid_plan();
        plan.subtasks[2].title = "  PATCH ".to_string();
        plan.subtasks[2].objective = "fix the   tokenizer BUG".to_string();
        let warnings = validate_logic(&plan);
        assert!(warnings.contains(&LogicalWarning::DuplicateTitle {
            first: "s2".to_string(),
            second: "s3".to_string(),
            title: "  PATCH ".to_string(),
        }));
        assert!(warnings.contains(&LogicalWarning::DuplicateObjective {
            first: "s2".to_string(),
            second: "s3".to_string(),
        }));
    }

    #[test]
    fn warns_on_redundant_hop() {
        let mut plan = valid_plan();
        plan.subtasks[1].objective = plan.subtasks[0].objective.clone();
        let warnings = validate_logic(&plan);
        assert!(warnings.contains(&LogicalWarning::RedundantHop {
            subtask: "s2".to_string(),
            parent: "s1".to_string(),
        }));
    }

    #[test]
    fn warns_on_missing_dependency_after_first() {
        let mut plan = valid_plan();
        plan.subtasks[2].depends_on.clear();
        let warnings = validate_logic(&plan);
        assert_eq!(
            warnings,
            vec![LogicalWarning::MissingDependency {
                subtask: "s3".to_string()
            }]
        );
    }

    #[test]
    fn warns_on_placeholder_strategy() {
        for strategy in ["", "Combine results.", "  TBD  "] {
            let mut plan = valid_plan();
            plan.merge.strategy = strategy.to_string();
            let warnings = validate_logic(&plan);
            assert!(
                matches!(
                    warnings.as_slice(),
                    [LogicalWarning::PlaceholderMergeStrategy { .. }]
                ),
                "strategy {strategy:?} gave {warnings:?}"
            );
        }
    }

    #[test]
    fn warns_when_dependency_is_not_in_an_earlier_group() {
        let mut plan = valid_plan();
        plan.subtasks[0].parallel_group = 2;
        let warnings = validate_logic(&plan);
        assert!(warnings.iter().any(|w| matches!(
            w,
            LogicalWarning::DependencyNotEarlier { subtask, dependency, .. }
                if subtask == "s2" && dependency == "s1"
        )));
    }

    #[test]
    fn logic_check_tolerates_invalid_plans() {
        let mut plan = valid_plan();
        plan.subtasks[1].depends_on = vec!["s2".to_string(), "ghost".to_string()];
        plan.subtasks[2].id = "s2".to_string();
        let _ = validate_logic(&plan);
        let _ = validate_logic(&Plan::new(vec![]));
    }
}
