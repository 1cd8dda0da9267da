//! Ordered backend pool with retry and sticky failover.
//!
//! Invocation starts at a given backend and walks the pool in order,
//! wrapping around, giving each backend `retry_attempts + 1` tries. The
//! first success wins. The "active" index only moves through
//! [`BackendPool::invoke`] or [`BackendPool::set_active`]; workers use
//! [`BackendPool::invoke_from`] and leave it to the coordinator.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::trait_def::Backend;
use super::types::{BackendError, GenerateRequest};
use crate::stream::{AggregatedText, Segment, aggregate, strip_think_tags};

/// Per-backend retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra tries after the first failure on the same backend.
    pub retry_attempts: u32,
    /// Pause between tries on the same backend.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            retry_attempts,
            retry_delay,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.retry_attempts.saturating_add(1)
    }
}

/// Failure of a whole pool invocation.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("backend pool is empty")]
    Empty,

    #[error("all {backends} backend(s) failed after {attempts} attempt(s); last error from {last_backend:?}")]
    Exhausted {
        backends: usize,
        attempts: u32,
        last_backend: String,
        #[source]
        source: BackendError,
    },

    #[error("invocation cancelled")]
    Cancelled,
}

/// Result of a successful pool invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Visible text with think blocks removed.
    pub text: String,
    pub thoughts: Vec<String>,
    /// Index of the backend that produced the response.
    pub backend_index: usize,
    pub backend_name: String,
    /// Whether the response came from the streaming path.
    pub streamed: bool,
}

/// Callback receiving visible text as it arrives.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Per-invocation knobs.
#[derive(Clone)]
pub struct CallOptions<'a> {
    pub retry: RetryPolicy,
    pub prefer_stream: bool,
    pub cancel: CancellationToken,
    pub on_chunk: Option<ChunkSink<'a>>,
}

impl<'a> CallOptions<'a> {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            prefer_stream: true,
            cancel: CancellationToken::new(),
            on_chunk: None,
        }
    }

    pub fn with_stream(mut self, prefer_stream: bool) -> Self {
        self.prefer_stream = prefer_stream;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_chunk_sink(mut self, sink: ChunkSink<'a>) -> Self {
        self.on_chunk = Some(sink);
        self
    }
}

/// Forwards visible text to the chunk sink at most once per invocation.
///
/// Each attempt restarts from an empty response; only the part past what
/// the sink has already shown is forwarded. An attempt whose text disagrees
/// with what was shown stops echoing.
struct Echo<'a> {
    sink: Option<ChunkSink<'a>>,
    shown: String,
    attempt: String,
    diverged: bool,
}

impl<'a> Echo<'a> {
    fn new(sink: Option<ChunkSink<'a>>) -> Self {
        Self {
            sink,
            shown: String::new(),
            attempt: String::new(),
            diverged: false,
        }
    }

    fn restart(&mut self) {
        self.attempt.clear();
        self.diverged = false;
    }

    fn push(&mut self, text: &str) {
        let Some(sink) = self.sink else {
            return;
        };
        if text.is_empty() || self.diverged {
            return;
        }
        self.attempt.push_str(text);

        let agrees = if self.attempt.len() <= self.shown.len() {
            self.shown.starts_with(self.attempt.as_str())
        } else {
            self.attempt.starts_with(self.shown.as_str())
        };
        if !agrees {
            tracing::debug!("response differs from text already shown, no longer echoing");
            self.diverged = true;
            return;
        }
        if self.attempt.len() > self.shown.len() {
            let fresh = &self.attempt[self.shown.len()..];
            sink(fresh);
            self.shown.push_str(fresh);
        }
    }
}

/// An ordered collection of interchangeable backends.
pub struct BackendPool {
    backends: Vec<Arc<dyn Backend>>,
    active: AtomicUsize,
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPool")
            .field("backends", &self.names())
            .field("active", &self.active_index())
            .finish()
    }
}

impl BackendPool {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self {
            backends,
            active: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn active_name(&self) -> Option<&str> {
        self.backends.get(self.active_index()).map(|b| b.name())
    }

    /// Make `index` the active backend. Out-of-range indices are ignored.
    pub fn set_active(&self, index: usize) {
        if index < self.backends.len() {
            let previous = self.active.swap(index, Ordering::SeqCst);
            if previous != index {
                tracing::info!(
                    from = %self.backends[previous.min(self.backends.len() - 1)].name(),
                    to = %self.backends[index].name(),
                    "active backend switched"
                );
            }
        }
    }

    /// Backend indices in try order when starting at `start`.
    pub fn failover_order(&self, start: usize) -> Vec<usize> {
        let n = self.backends.len();
        let start = if n == 0 { 0 } else { start % n };
        (0..n).map(|i| (start + i) % n).collect()
    }

    /// Invoke starting at the active backend and make the winner active.
    pub async fn invoke(
        &self,
        request: &GenerateRequest,
        options: &CallOptions<'_>,
    ) -> Result<Invocation, PoolError> {
        let start = self.active_index();
        let invocation = self.invoke_from(start, request, options).await?;
        self.set_active(invocation.backend_index);
        Ok(invocation)
    }

    /// Invoke starting at `start` without touching the active index.
    pub async fn invoke_from(
        &self,
        start: usize,
        request: &GenerateRequest,
        options: &CallOptions<'_>,
    ) -> Result<Invocation, PoolError> {
        if self.backends.is_empty() {
            return Err(PoolError::Empty);
        }

        let total = options.retry.total_attempts();
        let mut last: Option<(usize, BackendError)> = None;
        let mut echo = Echo::new(options.on_chunk);

        for index in self.failover_order(start) {
            let backend = &self.backends[index];
            for attempt in 1..=total {
                if options.cancel.is_cancelled() {
                    return Err(PoolError::Cancelled);
                }

                echo.restart();
                match self.attempt(backend.as_ref(), request, options, &mut echo).await {
                    Ok((text, streamed)) => {
                        if index != start % self.backends.len() {
                            tracing::info!(backend = %backend.name(), "failover succeeded");
                        }
                        return Ok(Invocation {
                            text: text.visible,
                            thoughts: text.thoughts,
                            backend_index: index,
                            backend_name: backend.name().to_string(),
                            streamed,
                        });
                    }
                    Err(BackendError::Cancelled) => return Err(PoolError::Cancelled),
                    Err(e) => {
                        tracing::warn!(
                            backend = %backend.name(),
                            attempt,
                            max_attempts = total,
                            error = %e,
                            "backend call failed"
                        );
                        last = Some((index, e));
                    }
                }

                if attempt < total && !options.retry.retry_delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = options.cancel.cancelled() => return Err(PoolError::Cancelled),
                        _ = tokio::time::sleep(options.retry.retry_delay) => {}
                    }
                }
            }
            tracing::warn!(backend = %backend.name(), "backend exhausted its retries");
        }

        let (index, source) = match last {
            Some(last) => last,
            None => return Err(PoolError::Empty),
        };
        Err(PoolError::Exhausted {
            backends: self.backends.len(),
            attempts: total.saturating_mul(self.backends.len() as u32),
            last_backend: self.backends[index].name().to_string(),
            source,
        })
    }

    /// One try against one backend: stream first, `generate` as fallback
    /// when an opened stream breaks mid-flight.
    async fn attempt(
        &self,
        backend: &dyn Backend,
        request: &GenerateRequest,
        options: &CallOptions<'_>,
        echo: &mut Echo<'_>,
    ) -> Result<(AggregatedText, bool), BackendError> {
        if options.prefer_stream {
            match stream_once(backend, request, options, echo).await? {
                StreamOutcome::Done(text) => return Ok((text, true)),
                StreamOutcome::Broken(e) => {
                    tracing::debug!(
                        backend = %backend.name(),
                        error = %e,
                        "stream broke mid-flight, falling back to generate"
                    );
                }
            }
        }

        let deadline = Instant::now() + request.timeout;
        let raw = bounded(&options.cancel, deadline, request.timeout, backend.generate(request))
            .await??;
        let text = strip_think_tags(&raw);
        echo.restart();
        echo.push(&text.visible);
        Ok((text, false))
    }
}

enum StreamOutcome {
    Done(AggregatedText),
    Broken(BackendError),
}

/// Stream one response. Failing to open the stream, timing out, or being
/// cancelled fails the attempt; any other error after the stream opened is
/// reported as [`StreamOutcome::Broken`].
async fn stream_once(
    backend: &dyn Backend,
    request: &GenerateRequest,
    options: &CallOptions<'_>,
    echo: &mut Echo<'_>,
) -> Result<StreamOutcome, BackendError> {
    let deadline = Instant::now() + request.timeout;
    let chunks = bounded(
        &options.cancel,
        deadline,
        request.timeout,
        backend.stream_generate(request),
    )
    .await??;

    let mut segments = aggregate(chunks, options.cancel.clone());
    let mut text = AggregatedText::default();
    loop {
        let next = tokio::time::timeout_at(deadline, segments.next())
            .await
            .map_err(|_| BackendError::Timeout(request.timeout))?;
        match next {
            Some(Ok(segment)) => {
                if let Segment::Visible(visible) = &segment {
                    echo.push(visible);
                }
                text.absorb(segment);
            }
            Some(Err(BackendError::Cancelled)) => return Err(BackendError::Cancelled),
            Some(Err(e)) => return Ok(StreamOutcome::Broken(e)),
            None => return Ok(StreamOutcome::Done(text)),
        }
    }
}

/// Await `fut` unless the deadline passes or `cancel` fires.
async fn bounded<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, BackendError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        r = tokio::time::timeout_at(deadline, fut) => r.map_err(|_| BackendError::Timeout(timeout)),
    }
}
