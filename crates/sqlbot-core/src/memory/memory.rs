use crate::config::BotConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// A single result row, keyed in source column order.
pub type Row = Vec<(String, serde_json::Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    SystemSummary,
}

/// A role-tagged turn in a thread's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
    fn system_summary(content: impl Into<String>) -> Self {
        Self {
            role: Role::SystemSummary,
            content: content.into(),
        }
    }

    /// `len(content)//4` per-message token estimate (spec §4.1).
    fn estimated_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

/// The result of executing one SQL statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub data: Vec<Row>,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub error: Option<String>,
}

impl QueryResult {
    pub fn ok(columns: Vec<String>, data: Vec<Row>) -> Self {
        let row_count = data.len();
        Self {
            success: true,
            data,
            row_count,
            columns,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            row_count: 0,
            columns: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// A `(sql, question, results, timestamp)` tuple, created only by successful
/// SQL-Query agent runs (spec §3 invariant I1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub sql: String,
    pub question: String,
    pub results: Option<QueryResult>,
    pub timestamp: DateTime<Utc>,
}

/// Per-thread conversational memory plus a bounded SQL/result cache.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get_messages(&self, thread_id: &str) -> Vec<Message>;
    async fn add_user_message(&self, thread_id: &str, content: &str);
    async fn add_assistant_message(&self, thread_id: &str, content: &str);
    async fn store_sql_query(
        &self,
        thread_id: &str,
        sql: &str,
        question: &str,
        results: Option<QueryResult>,
    );
    async fn get_sql_queries(&self, thread_id: &str) -> Vec<QueryRecord>;
    async fn get_last_sql_query(&self, thread_id: &str) -> Option<QueryRecord>;
    async fn get_last_query_results(&self, thread_id: &str) -> Option<QueryResult>;
    async fn find_sql_by_description(
        &self,
        thread_id: &str,
        description: Option<&str>,
    ) -> Option<QueryRecord>;
}

#[derive(Default)]
struct ThreadState {
    messages: Vec<Message>,
    queries: VecDeque<QueryRecord>,
}

/// In-process thread memory, keyed-lock sharded per `thread_id` (spec §5's
/// "keyed lock map" redesign flag) so distinct threads never contend.
pub struct InMemoryThreadStore {
    threads: DashMap<String, Mutex<ThreadState>>,
    config: BotConfig,
}

impl InMemoryThreadStore {
    pub fn new(config: BotConfig) -> Self {
        Self {
            threads: DashMap::new(),
            config,
        }
    }

    fn with_thread<R>(&self, thread_id: &str, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        let entry = self
            .threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Mutex::new(ThreadState::default()));
        let mut state = entry.lock().expect("thread state lock poisoned");
        f(&mut state)
    }

    /// Append a message, then apply the trim/compress algorithm (spec §4.1).
    fn append_and_trim(&self, thread_id: &str, message: Message) {
        self.with_thread(thread_id, |state| {
            state.messages.push(message);
            trim_and_compress(thread_id, state, &self.config);
        });
    }
}

/// Estimate total tokens, compress if over the trigger ratio, then hard-cap
/// message count. Invoked after every append (spec §4.1 steps 1-3).
fn trim_and_compress(thread_id: &str, state: &mut ThreadState, config: &BotConfig) {
    let before = state.messages.len();
    let total_tokens: usize = state.messages.iter().map(Message::estimated_tokens).sum();
    let trigger =
        (config.max_conversation_tokens as f32 * config.compression_trigger_ratio) as usize;

    if total_tokens > trigger {
        let keep_recent = config.keep_recent_messages.min(state.messages.len());
        let split_at = state.messages.len() - keep_recent;
        let recent = state.messages.split_off(split_at);
        let old = std::mem::take(&mut state.messages);

        let mut summaries = Vec::new();
        for pair in old.chunks(2) {
            match pair {
                [user, assistant] => summaries.push(Message::system_summary(format!(
                    "User asked: {}... Response: {}...",
                    truncate(&user.content, 100),
                    truncate(&assistant.content, 100),
                ))),
                [single] => summaries.push(Message::system_summary(format!(
                    "User asked: {}...",
                    truncate(&single.content, 100),
                ))),
                _ => unreachable!("chunks(2) never yields more than 2 items"),
            }
        }

        state.messages = summaries;
        state.messages.extend(recent);

        debug!(
            thread_id,
            before,
            after = state.messages.len(),
            total_tokens,
            trigger,
            "compressed thread history"
        );
    }

    if state.messages.len() > config.max_messages_per_thread {
        let drop = state.messages.len() - config.max_messages_per_thread;
        state.messages.drain(0..drop);
        debug!(thread_id, dropped = drop, "front-trimmed thread history");
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[async_trait]
impl MemoryStore for InMemoryThreadStore {
    async fn get_messages(&self, thread_id: &str) -> Vec<Message> {
        self.with_thread(thread_id, |state| state.messages.clone())
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) {
        self.append_and_trim(thread_id, Message::user(content));
    }

    async fn add_assistant_message(&self, thread_id: &str, content: &str) {
        self.append_and_trim(thread_id, Message::assistant(content));
    }

    async fn store_sql_query(
        &self,
        thread_id: &str,
        sql: &str,
        question: &str,
        results: Option<QueryResult>,
    ) {
        self.with_thread(thread_id, |state| {
            state.queries.push_back(QueryRecord {
                sql: sql.to_string(),
                question: question.to_string(),
                results,
                timestamp: Utc::now(),
            });
            while state.queries.len() > self.config.max_queries_per_thread {
                state.queries.pop_front();
            }
        });
    }

    async fn get_sql_queries(&self, thread_id: &str) -> Vec<QueryRecord> {
        self.with_thread(thread_id, |state| state.queries.iter().cloned().collect())
    }

    async fn get_last_sql_query(&self, thread_id: &str) -> Option<QueryRecord> {
        self.with_thread(thread_id, |state| state.queries.back().cloned())
    }

    async fn get_last_query_results(&self, thread_id: &str) -> Option<QueryResult> {
        self.with_thread(thread_id, |state| {
            state
                .queries
                .iter()
                .rev()
                .find(|q| q.results.as_ref().is_some_and(|r| r.success))
                .and_then(|q| q.results.clone())
        })
    }

    async fn find_sql_by_description(
        &self,
        thread_id: &str,
        description: Option<&str>,
    ) -> Option<QueryRecord> {
        self.with_thread(thread_id, |state| {
            let description = match description {
                Some(d) if !d.trim().is_empty() => d,
                _ => return state.queries.back().cloned(),
            };
            let needle = description.to_lowercase();
            let tokens: Vec<&str> = needle.split_whitespace().filter(|t| t.len() > 3).collect();

            state
                .queries
                .iter()
                .rev()
                .find(|record| {
                    let hay = record.question.to_lowercase();
                    hay.contains(&needle) || tokens.iter().any(|t| hay.contains(t))
                })
                .cloned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryThreadStore {
        InMemoryThreadStore::new(BotConfig::default())
    }

    #[tokio::test]
    async fn caps_message_count_at_max_per_thread() {
        let store = store();
        for i in 0..12 {
            store.add_user_message("t1", &format!("msg {i}")).await;
        }
        assert!(store.get_messages("t1").await.len() <= 10);
    }

    #[tokio::test]
    async fn query_ring_evicts_oldest_beyond_cap() {
        let store = store();
        for i in 0..15 {
            store
                .store_sql_query(
                    "t1",
                    &format!("SELECT {i}"),
                    "q",
                    Some(QueryResult::ok(vec!["n".into()], vec![])),
                )
                .await;
        }
        let queries = store.get_sql_queries("t1").await;
        assert_eq!(queries.len(), 10);
        assert_eq!(queries.first().unwrap().sql, "SELECT 5");
        assert_eq!(queries.last().unwrap().sql, "SELECT 14");
    }

    #[tokio::test]
    async fn last_query_results_is_most_recent_successful() {
        let store = store();
        store
            .store_sql_query(
                "t1",
                "SELECT 1",
                "q1",
                Some(QueryResult::ok(vec!["n".into()], vec![])),
            )
            .await;
        store
            .store_sql_query("t1", "SELECT bad", "q2", Some(QueryResult::err("boom")))
            .await;
        let results = store.get_last_query_results("t1").await.unwrap();
        assert!(results.success);
    }

    #[tokio::test]
    async fn find_sql_by_description_matches_token_overlap() {
        let store = store();
        store
            .store_sql_query(
                "t1",
                "SELECT COUNT(*) FROM app_portfolio",
                "how many apps do we have",
                Some(QueryResult::ok(vec!["n".into()], vec![])),
            )
            .await;
        let found = store
            .find_sql_by_description("t1", Some("how many apps"))
            .await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn find_sql_by_description_falls_back_to_most_recent_when_absent() {
        let store = store();
        store
            .store_sql_query("t1", "SELECT 1", "q1", None)
            .await;
        let found = store.find_sql_by_description("t1", None).await;
        assert_eq!(found.unwrap().sql, "SELECT 1");
    }

    #[tokio::test]
    async fn compression_keeps_recent_messages_verbatim() {
        let config = BotConfig {
            max_conversation_tokens: 40,
            keep_recent_messages: 2,
            ..Default::default()
        };
        let store = InMemoryThreadStore::new(config);

        for i in 0..6 {
            store
                .add_user_message("t1", &("x".repeat(20) + &i.to_string()))
                .await;
            store
                .add_assistant_message("t1", &("y".repeat(20) + &i.to_string()))
                .await;
        }

        let messages = store.get_messages("t1").await;
        let last_two: Vec<_> = messages.iter().rev().take(2).collect();
        assert!(last_two
            .iter()
            .any(|m| m.content.starts_with("yyyyyyyyyyyyyyyyyyyy5")));
        assert!(messages
            .iter()
            .any(|m| matches!(m.role, Role::SystemSummary)));
    }
}
