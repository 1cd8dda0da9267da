//! Heron core: plan-driven orchestration of LLM subtasks.
//!
//! A goal is decomposed (by an external [`planner::Planner`]) into a
//! [`plan::Plan`] of subtasks arranged in parallel groups. The plan is
//! validated, executed group by group by the [`dispatch::Dispatcher`]
//! against failover [`backend::BackendPool`]s, and the subtask outputs are
//! synthesized into one answer by the [`merge::MergeCoordinator`].
//!
//! ```text
//! Planner -> Plan JSON -> validate -> Dispatcher -> MergeCoordinator -> answer
//!                                        |
//!                         BackendPool + think-tag filter
//!                         ContextStore + UiSink
//! ```
//!
//! [`pipeline::Pipeline`] wires the whole flow together.

pub mod agent;
pub mod backend;
pub mod dispatch;
pub mod memory;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod planner;
pub mod stream;
pub mod ui;
