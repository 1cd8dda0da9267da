//! Shared test utilities for heron integration tests.
//!
//! Provides a scripted [`Backend`] whose replies are chosen per call, a
//! fixed-plan [`Planner`], a context store that always fails, and small
//! builders for plans, registries and validation policies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Barrier, Mutex};

use heron_core::agent::{AgentProfile, AgentRegistry};
use heron_core::backend::{
    Backend, BackendError, BackendPool, ChatMessage, Engine, EngineRoutes, GenerateRequest,
    TextStream,
};
use heron_core::memory::{ContextStore, MemoryError};
use heron_core::plan::{Plan, ResultRef, Subtask, ValidationPolicy};
use heron_core::planner::{Planner, PlannerContext, PlannerError};

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Succeed with this text, as a single chunk when streamed.
    Text(String),
    /// Fail the call with a request error.
    Fail(String),
    /// Succeed; streamed as these chunks, joined for `generate`.
    Chunks(Vec<String>),
    /// Stream these chunks then break with the message. `generate` returns
    /// the joined chunks.
    StreamFailsAfter(Vec<String>, String),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Chunks(chunks.into_iter().map(Into::into).collect())
    }
}

/// Which trait method served a recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Generate,
    Stream,
}

/// A call the backend received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub system_prompt: String,
    pub user_prompt: String,
    pub history: Vec<ChatMessage>,
}

/// Backend that answers from a script.
///
/// Each call takes the next queued reply; when the queue is empty the first
/// rule whose needle appears in the user prompt answers, then the default.
pub struct ScriptedBackend {
    name: String,
    queue: Mutex<VecDeque<Reply>>,
    rules: Vec<(String, Reply)>,
    default: Reply,
    delay: Option<Duration>,
    barrier: Option<(String, Arc<Barrier>)>,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("name", &self.name)
            .finish()
    }
}

impl ScriptedBackend {
    /// A backend that answers every call with `"{name} ok"`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            default: Reply::Text(format!("{name} ok")),
            name,
            queue: Mutex::new(VecDeque::new()),
            rules: Vec::new(),
            delay: None,
            barrier: None,
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// A backend whose every call fails.
    pub fn failing(name: impl Into<String>) -> Self {
        let name = name.into();
        let message = format!("{name} is down");
        Self::new(name).with_default(Reply::Fail(message))
    }

    pub fn with_default(mut self, reply: Reply) -> Self {
        self.default = reply;
        self
    }

    /// Queue replies consumed one per call, before rules apply.
    pub fn with_script<I: IntoIterator<Item = Reply>>(self, replies: I) -> Self {
        Self {
            queue: Mutex::new(replies.into_iter().collect()),
            ..self
        }
    }

    /// Answer prompts containing `needle` with `reply`.
    pub fn when(mut self, needle: impl Into<String>, reply: Reply) -> Self {
        self.rules.push((needle.into(), reply));
        self
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Wait on `barrier` before answering prompts containing `needle`.
    pub fn with_barrier(mut self, needle: impl Into<String>, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some((needle.into(), barrier));
        self
    }

    /// Number of `generate` and `stream_generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().await.clone()
    }

    /// Calls whose user prompt contains `needle`.
    pub async fn calls_matching(&self, needle: &str) -> usize {
        self.recorded
            .lock()
            .await
            .iter()
            .filter(|call| call.user_prompt.contains(needle))
            .count()
    }

    async fn next_reply(&self, kind: CallKind, request: &GenerateRequest) -> Reply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().await.push(RecordedCall {
            kind,
            system_prompt: request.system_prompt.clone(),
            user_prompt: request.user_prompt.clone(),
            history: request.history.clone(),
        });

        if let Some((needle, barrier)) = &self.barrier {
            if request.user_prompt.contains(needle.as_str()) {
                barrier.wait().await;
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reply) = self.queue.lock().await.pop_front() {
            return reply;
        }
        self.rules
            .iter()
            .find(|(needle, _)| request.user_prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendError> {
        match self.next_reply(CallKind::Generate, request).await {
            Reply::Text(text) => Ok(text),
            Reply::Fail(message) => Err(BackendError::Request(message)),
            Reply::Chunks(chunks) | Reply::StreamFailsAfter(chunks, _) => Ok(chunks.concat()),
        }
    }

    async fn stream_generate(&self, request: &GenerateRequest) -> Result<TextStream, BackendError> {
        let items: Vec<Result<String, BackendError>> =
            match self.next_reply(CallKind::Stream, request).await {
                Reply::Text(text) => vec![Ok(text)],
                Reply::Fail(message) => return Err(BackendError::Request(message)),
                Reply::Chunks(chunks) => chunks.into_iter().map(Ok).collect(),
                Reply::StreamFailsAfter(chunks, message) => chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(BackendError::Stream(message))))
                    .collect(),
            };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// A pool over the given backends, in order.
pub fn pool_of(backends: &[Arc<ScriptedBackend>]) -> Arc<BackendPool> {
    Arc::new(BackendPool::new(
        backends
            .iter()
            .map(|b| Arc::clone(b) as Arc<dyn Backend>)
            .collect(),
    ))
}

/// Routes that send every engine to `pool`.
pub fn single_route(pool: Arc<BackendPool>) -> Arc<EngineRoutes> {
    Arc::new(EngineRoutes::new(pool))
}

// ---------------------------------------------------------------------------
// Planner and memory doubles
// ---------------------------------------------------------------------------

/// Returns the same plan for every goal and remembers the last context.
#[derive(Debug)]
pub struct StaticPlanner {
    plan: Plan,
    last_context: Mutex<Option<PlannerContext>>,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            last_context: Mutex::new(None),
        }
    }

    pub async fn last_context(&self) -> Option<PlannerContext> {
        self.last_context.lock().await.clone()
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _goal: &str, context: &PlannerContext) -> Result<Plan, PlannerError> {
        *self.last_context.lock().await = Some(context.clone());
        Ok(self.plan.clone())
    }
}

/// Context store whose every operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingContextStore;

#[async_trait]
impl ContextStore for FailingContextStore {
    async fn load_relevant_context(
        &self,
        _agent: &str,
        _text: &str,
        _limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        Err(MemoryError::Unavailable("store offline".to_string()))
    }

    async fn save_conversation(
        &self,
        _agent: &str,
        _prompt: &str,
        _response: &str,
    ) -> Result<ResultRef, MemoryError> {
        Err(MemoryError::Unavailable("store offline".to_string()))
    }

    async fn load_result(&self, result_ref: &ResultRef) -> Result<String, MemoryError> {
        Err(MemoryError::NotFound(result_ref.clone()))
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A `coder`/`local` subtask titled after its id.
pub fn subtask(id: &str, group: u32, deps: &[&str]) -> Subtask {
    Subtask::new(
        id,
        format!("Task {id}"),
        format!("Do the work for {id}"),
        "coder",
        "local",
        group,
    )
    .with_depends_on(deps.iter().copied())
}

/// Registry with `coder` and `writer`.
pub fn registry() -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    registry.register(
        AgentProfile::new("coder", "You write and fix code.").with_description("Writes code"),
    );
    registry.register(
        AgentProfile::new("writer", "You write prose.").with_description("Writes documentation"),
    );
    Arc::new(registry)
}

/// Policy allowing the [`registry`] agents and every engine.
pub fn policy() -> ValidationPolicy {
    ValidationPolicy::new(["coder", "writer"], Engine::ALL.iter().map(|e| e.as_str()))
}
