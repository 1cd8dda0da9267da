//! Conversation memory consumed by the dispatcher and merge coordinator.
//!
//! The store keeps subtask exchanges, returns relevant prior turns for new
//! prompts, and dereferences the [`ResultRef`]s recorded in the plan.

pub mod in_memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::ChatMessage;
use crate::plan::ResultRef;

pub use in_memory::InMemoryContextStore;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("no stored result for {0}")]
    NotFound(ResultRef),

    #[error("context store unavailable: {0}")]
    Unavailable(String),
}

/// Long-term conversation memory.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Up to `limit` prior turns relevant to `text`, oldest first.
    async fn load_relevant_context(
        &self,
        agent: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError>;

    /// Record an exchange and return a reference to the response.
    async fn save_conversation(
        &self,
        agent: &str,
        prompt: &str,
        response: &str,
    ) -> Result<ResultRef, MemoryError>;

    /// Read back a response saved by [`ContextStore::save_conversation`].
    async fn load_result(&self, result_ref: &ResultRef) -> Result<String, MemoryError>;

    /// Short description of what the store holds, for the planner.
    async fn memory_summary(&self) -> String {
        String::new()
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn ContextStore) {}
};
