//! Process-local context store.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ContextStore, MemoryError};
use crate::backend::ChatMessage;
use crate::plan::ResultRef;

const REF_PREFIX: &str = "mem:";

#[derive(Debug, Clone)]
struct Exchange {
    id: Uuid,
    agent: String,
    prompt: String,
    response: String,
    saved_at: DateTime<Utc>,
}

/// Chronological in-memory log of exchanges with keyword-overlap relevance.
///
/// `limit` in [`ContextStore::load_relevant_context`] counts exchanges; each
/// one yields a user turn and an assistant turn.
#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    exchanges: Mutex<Vec<Exchange>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.exchanges.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exchanges.lock().await.is_empty()
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn load_relevant_context(
        &self,
        agent: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = keywords(text);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let exchanges = self.exchanges.lock().await;
        let mut scored: Vec<(usize, usize)> = exchanges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.agent == agent)
            .map(|(position, e)| {
                let mut words = keywords(&e.prompt);
                words.extend(keywords(&e.response));
                (position, words.intersection(&query).count())
            })
            .filter(|(_, score)| *score > 0)
            .collect();

        // Best first; newer wins ties.
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
        scored.truncate(limit);
        scored.sort_by_key(|(position, _)| *position);

        let mut messages = Vec::with_capacity(scored.len() * 2);
        for (position, _) in scored {
            let exchange = &exchanges[position];
            messages.push(ChatMessage::user(exchange.prompt.clone()));
            messages.push(ChatMessage::assistant(exchange.response.clone()));
        }
        Ok(messages)
    }

    async fn save_conversation(
        &self,
        agent: &str,
        prompt: &str,
        response: &str,
    ) -> Result<ResultRef, MemoryError> {
        let exchange = Exchange {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            saved_at: Utc::now(),
        };
        let result_ref = ResultRef::new(format!("{REF_PREFIX}{}", exchange.id));
        self.exchanges.lock().await.push(exchange);
        Ok(result_ref)
    }

    async fn load_result(&self, result_ref: &ResultRef) -> Result<String, MemoryError> {
        let id = result_ref
            .as_str()
            .strip_prefix(REF_PREFIX)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| MemoryError::NotFound(result_ref.clone()))?;

        self.exchanges
            .lock()
            .await
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.response.clone())
            .ok_or_else(|| MemoryError::NotFound(result_ref.clone()))
    }

    async fn memory_summary(&self) -> String {
        let exchanges = self.exchanges.lock().await;
        let Some(last) = exchanges.last() else {
            return "no prior exchanges".to_string();
        };

        let mut per_agent: BTreeMap<&str, usize> = BTreeMap::new();
        for exchange in exchanges.iter() {
            *per_agent.entry(exchange.agent.as_str()).or_default() += 1;
        }
        let agents = per_agent
            .iter()
            .map(|(agent, count)| format!("{agent} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} prior exchange(s): {agents}; latest at {}",
            exchanges.len(),
            last.saved_at.to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Role;

    #[tokio::test]
    async fn saved_results_can_be_loaded() {
        let store = InMemoryContextStore::new();
        let r = store
            .save_conversation("coder", "write a parser", "fn parse() {}")
            .await
            .unwrap();
        assert!(r.as_str().starts_with("mem:"));
        assert_eq!(store.load_result(&r).await.unwrap(), "fn parse() {}");
    }

    #[tokio::test]
    async fn unknown_refs_are_not_found() {
        let store = InMemoryContextStore::new();
        let missing = format!("mem:{}", Uuid::new_v4());
        for raw in ["mem:not-a-uuid", "disk:1", missing.as_str()] {
            let err = store.load_result(&ResultRef::new(raw)).await.unwrap_err();
            assert!(matches!(err, MemoryError::NotFound(_)), "{raw}");
        }
    }

    #[tokio::test]
    async fn relevant_context_is_ranked_then_chronological() {
        let store = InMemoryContextStore::new();
        store
            .save_conversation("coder", "tokenizer design notes", "use a lexer")
            .await
            .unwrap();
        store
            .save_conversation("coder", "unrelated gardening", "water plants")
            .await
            .unwrap();
        store
            .save_conversation("reviewer", "tokenizer review", "looks fine")
            .await
            .unwrap();
        store
            .save_conversation("coder", "tokenizer bug in lexer", "fixed the lexer")
            .await
            .unwrap();

        let context = store
            .load_relevant_context("coder", "improve the tokenizer lexer", 5)
            .await
            .unwrap();
        let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "tokenizer design notes",
                "use a lexer",
                "tokenizer bug in lexer",
                "fixed the lexer",
            ]
        );
        assert_eq!(context[0].role, Role::User);
        assert_eq!(context[1].role, Role::Assistant);

        let top = store
            .load_relevant_context("coder", "improve the tokenizer lexer", 1)
            .await
            .unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].content, "tokenizer bug in lexer");
    }

    #[tokio::test]
    async fn summary_counts_agents() {
        let store = InMemoryContextStore::new();
        assert_eq!(store.memory_summary().await, "no prior exchanges");
        store.save_conversation("coder", "a", "b").await.unwrap();
        store.save_conversation("coder", "c", "d").await.unwrap();
        store.save_conversation("reviewer", "e", "f").await.unwrap();
        let summary = store.memory_summary().await;
        assert!(summary.starts_with("3 prior exchange(s): coder (2), reviewer (1)"), "{summary}");
    }
}
