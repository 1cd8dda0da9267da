//! `heron run` command: execute a plan file and print the final answer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use heron_core::backend::{Backend, BackendPool, CommandBackend, Engine, EngineRoutes};
use heron_core::dispatch::{DispatchError, Dispatcher};
use heron_core::memory::{ContextStore, InMemoryContextStore};
use heron_core::merge::MergeCoordinator;
use heron_core::pipeline::{Pipeline, PipelineError, WarningPolicy};
use heron_core::plan::PlanStore;
use heron_core::planner::FilePlanner;
use heron_core::ui::UiSink;

use crate::config::{BackendSection, HeronConfig};
use crate::console::ConsoleSink;

/// Options of one `heron run` invocation.
#[derive(Debug)]
pub struct RunOptions {
    pub plan: PathBuf,
    pub goal: String,
    pub state: Option<PathBuf>,
    pub allow_warnings: bool,
    pub quiet: bool,
}

/// How a run ended, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Refused because the plan raised warnings.
    Rejected,
    Interrupted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Rejected => 2,
            Self::Interrupted => 130,
        }
    }
}

/// Default state file: `<plan stem>.state.json` next to the plan.
pub fn default_state_path(plan: &Path) -> PathBuf {
    let stem = plan
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plan".to_string());
    plan.with_file_name(format!("{stem}.state.json"))
}

/// Build one pool per configured engine plus the default pool.
///
/// Backends without an engine form the default pool; when every backend
/// names an engine, the default pool holds all of them.
pub fn build_routes(backends: &[BackendSection]) -> Result<EngineRoutes> {
    if backends.is_empty() {
        bail!("no backends configured; add a [[backends]] entry or run `heron init`");
    }

    let mut by_engine: HashMap<Engine, Vec<Arc<dyn Backend>>> = HashMap::new();
    let mut unrouted: Vec<Arc<dyn Backend>> = Vec::new();
    let mut all: Vec<Arc<dyn Backend>> = Vec::new();

    for section in backends {
        let backend: Arc<dyn Backend> = Arc::new(
            CommandBackend::new(section.name.clone(), section.command.clone())
                .with_args(section.args.iter().cloned()),
        );
        all.push(Arc::clone(&backend));
        match &section.engine {
            Some(engine) => {
                let engine: Engine = engine
                    .parse()
                    .with_context(|| format!("backend {:?} has an invalid engine", section.name))?;
                by_engine.entry(engine).or_default().push(backend);
            }
            None => unrouted.push(backend),
        }
    }

    let default = if unrouted.is_empty() { all } else { unrouted };
    let mut routes = EngineRoutes::new(Arc::new(BackendPool::new(default)));
    for engine in Engine::ALL {
        if let Some(pool) = by_engine.remove(&engine) {
            tracing::debug!(%engine, backends = pool.len(), "routing engine");
            routes = routes.with_route(engine, Arc::new(BackendPool::new(pool)));
        }
    }
    Ok(routes)
}

/// Run the run command.
pub async fn run_plan(config: &HeronConfig, options: RunOptions) -> Result<RunStatus> {
    let routes = Arc::new(build_routes(&config.backends)?);
    let merge_pool = Arc::clone(routes.default_pool());

    let agents = Arc::new(config.registry());
    let memory: Arc<dyn ContextStore> = Arc::new(InMemoryContextStore::new());
    let ui: Arc<dyn UiSink> = Arc::new(ConsoleSink::new(!options.quiet));

    let dispatcher = Dispatcher::new(
        Arc::clone(&agents),
        routes,
        Arc::clone(&memory),
        Arc::clone(&ui),
        config.dispatch.clone(),
    );
    let merger = MergeCoordinator::new(
        merge_pool,
        Arc::clone(&memory),
        Arc::clone(&ui),
        config.merge.clone(),
    );

    let state = options
        .state
        .clone()
        .unwrap_or_else(|| default_state_path(&options.plan));
    let warning_policy = if options.allow_warnings {
        WarningPolicy::Proceed
    } else {
        WarningPolicy::Abort
    };
    let pipeline = Pipeline::new(
        Arc::new(FilePlanner::new(&options.plan)),
        agents,
        memory,
        ui,
        dispatcher,
        merger,
        config.policy.clone(),
        PlanStore::new(&state),
    )
    .with_warning_policy(warning_policy);

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(watch_interrupts(cancel.clone()));

    let result = pipeline.run(&options.goal, cancel).await;
    interrupt.abort();

    match result {
        Ok(report) => {
            if let Some(warning) = report.merge.warning() {
                eprintln!("warning: {warning}");
            }
            eprintln!("State saved to {}", state.display());
            println!("{}", report.answer);
            Ok(RunStatus::Completed)
        }
        Err(PipelineError::Rejected(warnings)) => {
            eprintln!("Plan rejected with {} warning(s):", warnings.len());
            for warning in &warnings {
                eprintln!("  - {warning}");
            }
            eprintln!("Re-run with --allow-warnings to execute anyway.");
            Ok(RunStatus::Rejected)
        }
        Err(PipelineError::Dispatch(DispatchError::Cancelled)) => {
            eprintln!("Interrupted. Partial state saved to {}", state.display());
            Ok(RunStatus::Interrupted)
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("run failed (state: {})", state.display()))),
    }
}

const INTERRUPT_NOTICE: &str =
    "Interrupt received, cancelling in-flight calls (Ctrl-C again to quit)";

/// First Ctrl-C cancels the run; the second exits immediately.
async fn watch_interrupts(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\n{INTERRUPT_NOTICE}");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(RunStatus::Interrupted.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, engine: Option<&str>) -> BackendSection {
        BackendSection {
            name: name.to_string(),
            engine: engine.map(str::to_string),
            command: "cat".to_string(),
            args: Vec::new(),
        }
    }

    #[test]
    fn state_path_sits_next_to_plan() {
        assert_eq!(
            default_state_path(Path::new("/work/plans/fix.json")),
            PathBuf::from("/work/plans/fix.state.json")
        );
    }

    #[test]
    fn unrouted_backends_form_the_default_pool() {
        let routes = build_routes(&[
            backend("fast", Some("local")),
            backend("general", None),
            backend("big", Some("cloud")),
        ])
        .unwrap();

        assert_eq!(routes.default_pool().names(), vec!["general"]);
        assert_eq!(routes.route(Engine::Local).names(), vec!["fast"]);
        assert_eq!(routes.route(Engine::Cloud).names(), vec!["big"]);
        assert_eq!(routes.route(Engine::ToolEnabled).names(), vec!["general"]);
    }

    #[test]
    fn default_pool_falls_back_to_every_backend() {
        let routes = build_routes(&[backend("a", Some("local")), backend("b", Some("cloud"))])
            .unwrap();
        assert_eq!(routes.default_pool().names(), vec!["a", "b"]);
    }

    #[test]
    fn rejects_bad_engine_and_empty_config() {
        assert!(build_routes(&[backend("x", Some("gpu"))]).is_err());
        assert!(build_routes(&[]).is_err());
    }

    #[test]
    fn interrupt_notice_matches_cancellation_behaviour() {
        // The run token reaches the pool, so in-flight calls stop too.
        assert!(INTERRUPT_NOTICE.contains("cancelling in-flight calls"));
        assert!(!INTERRUPT_NOTICE.contains("after"));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_eq!(RunStatus::Rejected.exit_code(), 2);
        assert_eq!(RunStatus::Interrupted.exit_code(), 130);
    }
}
