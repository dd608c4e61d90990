//! The four specialized agents (spec §4.5), each a thin role wrapper around
//! [`AgentLoop`]: a system prompt, a tool subset, and — where the contract
//! demands a guarantee the LLM cannot be trusted to honor on its own — a
//! post-loop enforcement step.

use crate::agents::agent::{AgentLoop, AgentOutput, StreamCancelled};
use crate::config::BotConfig;
use crate::db::Database;
use crate::memory::{Message as MemMessage, MemoryStore, QueryResult, Role as MemRole};
use crate::providers::{LlmProvider, Message as LlmMessage};
use crate::tools::{
    ExecuteSqlTool, FormatResultTool, GenerateCsvTool, GenerateSqlTool, GetCachedResultsTool,
    GetSqlHistoryTool, ToolRegistry,
};
use crate::validator::SqlValidator;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChatAgent: Send + Sync {
    async fn run(&self, user_message: &str, history: &[MemMessage]) -> AgentOutput;

    /// Like [`ChatAgent::run`], but streams the underlying LLM's text tokens
    /// to `tx` as they're produced instead of buffering the whole answer.
    /// Returns `None` if the transport receiving `tx` was dropped mid-run
    /// (spec §5 cancellation: no assistant message should be persisted).
    async fn run_streaming(
        &self,
        user_message: &str,
        history: &[MemMessage],
        tx: mpsc::Sender<String>,
    ) -> Option<AgentOutput>;
}

/// Sends `text` as a final chunk only if it differs from whatever was
/// already streamed — post-loop overrides substitute a fixed reply for the
/// LLM's own phrasing, so the corrected text still needs to reach `tx`.
async fn send_if_different(tx: &mpsc::Sender<String>, streamed: &str, text: &str) {
    if streamed != text {
        let _ = tx.send(text.to_string()).await;
    }
}

fn to_llm_history(history: &[MemMessage]) -> Vec<LlmMessage> {
    history
        .iter()
        .map(|m| match m.role {
            MemRole::User => LlmMessage::user(&m.content),
            MemRole::Assistant => LlmMessage::assistant(&m.content),
            MemRole::SystemSummary => LlmMessage::system(&m.content),
        })
        .collect()
}

fn loop_error(e: anyhow::Error) -> AgentOutput {
    AgentOutput {
        result: format!("Sorry, something went wrong: {e}"),
        trace: Vec::new(),
    }
}

/// Generates SQL, executes it, formats the result. Mandatorily stores a
/// Query Record whenever `execute_sql` succeeded, regardless of the LLM's
/// final text (spec §4.5.1).
pub struct SqlQueryAgent {
    engine: AgentLoop,
    memory: Arc<dyn MemoryStore>,
    thread_id: String,
}

impl SqlQueryAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        db: Arc<dyn Database>,
        memory: Arc<dyn MemoryStore>,
        thread_id: impl Into<String>,
        config: &BotConfig,
    ) -> Self {
        let thread_id = thread_id.into();
        let validator = Arc::new(SqlValidator::new(config.table_name.clone()));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(GenerateSqlTool::new(
            Arc::clone(&provider),
            Arc::clone(&memory),
            thread_id.clone(),
            config.table_name.clone(),
        )));
        registry.register(Arc::new(ExecuteSqlTool::new(db, validator)));
        registry.register(Arc::new(FormatResultTool));

        let system_prompt = format!(
            "You are a SQL analytics assistant for the `{}` table. Given the user's question \
             and the last few turns of conversation, call generate_sql, then execute_sql on the \
             SQL it returns, then format_result on the execution result and the question, and \
             return the formatted text as your final answer.",
            config.table_name
        );
        let engine = AgentLoop::new(
            provider,
            registry,
            system_prompt,
            config.agent_step_limit,
            config.max_retries,
            config.retry_base_delay_ms,
        );

        Self {
            engine,
            memory,
            thread_id,
        }
    }
}

#[async_trait]
impl ChatAgent for SqlQueryAgent {
    async fn run(&self, user_message: &str, history: &[MemMessage]) -> AgentOutput {
        let llm_history = to_llm_history(history);
        let output = match self.engine.run(user_message, &llm_history).await {
            Ok(o) => o,
            Err(e) => return loop_error(e),
        };

        let successful_execution = output.trace.iter().rev().find_map(|inv| {
            if inv.name != "execute_sql" {
                return None;
            }
            let result: QueryResult = serde_json::from_str(&inv.result.content).ok()?;
            result.success.then_some((inv, result))
        });

        if let Some((invocation, result)) = successful_execution {
            let sql = invocation
                .args
                .get("sql")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.memory
                .store_sql_query(&self.thread_id, &sql, user_message, Some(result))
                .await;
        }

        output
    }

    async fn run_streaming(
        &self,
        user_message: &str,
        history: &[MemMessage],
        tx: mpsc::Sender<String>,
    ) -> Option<AgentOutput> {
        let llm_history = to_llm_history(history);
        let output = match self.engine.run_streaming(user_message, &llm_history, tx).await {
            Ok(o) => o,
            Err(e) if e.is::<StreamCancelled>() => return None,
            Err(e) => return Some(loop_error(e)),
        };

        let successful_execution = output.trace.iter().rev().find_map(|inv| {
            if inv.name != "execute_sql" {
                return None;
            }
            let result: QueryResult = serde_json::from_str(&inv.result.content).ok()?;
            result.success.then_some((inv, result))
        });

        if let Some((invocation, result)) = successful_execution {
            let sql = invocation
                .args
                .get("sql")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.memory
                .store_sql_query(&self.thread_id, &sql, user_message, Some(result))
                .await;
        }

        Some(output)
    }
}

/// Never regenerates SQL or re-executes a query: exports whatever is already
/// cached, or asks the user to run a query first (spec §4.5.2).
pub struct CsvExportAgent {
    engine: AgentLoop,
}

impl CsvExportAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        memory: Arc<dyn MemoryStore>,
        thread_id: impl Into<String>,
        config: &BotConfig,
    ) -> Self {
        let thread_id = thread_id.into();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(GetCachedResultsTool::new(
            Arc::clone(&memory),
            thread_id,
        )));
        registry.register(Arc::new(GenerateCsvTool::new(config.export_dir.clone())));

        let system_prompt = "You export previously cached query results to CSV. Never generate \
             or execute SQL. Call get_cached_results first. If there are no cached results, tell \
             the user to run a query first. Otherwise call generate_csv with the cached rows and \
             confirm the export."
            .to_string();
        let engine = AgentLoop::new(
            provider,
            registry,
            system_prompt,
            config.agent_step_limit,
            config.max_retries,
            config.retry_base_delay_ms,
        );

        Self { engine }
    }
}

#[async_trait]
impl ChatAgent for CsvExportAgent {
    async fn run(&self, user_message: &str, history: &[MemMessage]) -> AgentOutput {
        let llm_history = to_llm_history(history);
        let output = match self.engine.run(user_message, &llm_history).await {
            Ok(o) => o,
            Err(e) => return loop_error(e),
        };

        let cache_miss = output
            .trace
            .iter()
            .any(|inv| inv.name == "get_cached_results" && inv.result.content.starts_with("No cached query results"));
        if cache_miss {
            return AgentOutput {
                result: "Please run a query first, then I can export the results to CSV."
                    .to_string(),
                trace: output.trace,
            };
        }

        let exported = output
            .trace
            .iter()
            .rev()
            .any(|inv| inv.name == "generate_csv" && !inv.result.content.starts_with("ERROR"));
        if exported {
            return AgentOutput {
                result: "CSV report generated.".to_string(),
                trace: output.trace,
            };
        }

        output
    }

    async fn run_streaming(
        &self,
        user_message: &str,
        history: &[MemMessage],
        tx: mpsc::Sender<String>,
    ) -> Option<AgentOutput> {
        let llm_history = to_llm_history(history);
        let output = match self
            .engine
            .run_streaming(user_message, &llm_history, tx.clone())
            .await
        {
            Ok(o) => o,
            Err(e) if e.is::<StreamCancelled>() => return None,
            Err(e) => return Some(loop_error(e)),
        };

        let cache_miss = output
            .trace
            .iter()
            .any(|inv| inv.name == "get_cached_results" && inv.result.content.starts_with("No cached query results"));
        if cache_miss {
            let text = "Please run a query first, then I can export the results to CSV.";
            send_if_different(&tx, &output.result, text).await;
            return Some(AgentOutput {
                result: text.to_string(),
                trace: output.trace,
            });
        }

        let exported = output
            .trace
            .iter()
            .rev()
            .any(|inv| inv.name == "generate_csv" && !inv.result.content.starts_with("ERROR"));
        if exported {
            let text = "CSV report generated.";
            send_if_different(&tx, &output.result, text).await;
            return Some(AgentOutput {
                result: text.to_string(),
                trace: output.trace,
            });
        }

        Some(output)
    }
}

/// Looks up a previously executed statement by description; never
/// regenerates or re-executes SQL (spec §4.5.3).
pub struct SqlRetrievalAgent {
    engine: AgentLoop,
}

impl SqlRetrievalAgent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        memory: Arc<dyn MemoryStore>,
        thread_id: impl Into<String>,
        config: &BotConfig,
    ) -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(GetSqlHistoryTool::new(memory, thread_id)));

        let system_prompt = "You retrieve a previously executed SQL statement for this thread. \
             Extract any description of which query the user means (e.g. the text after \"sql \
             for\" or \"sql you used to\") and call get_sql_history with it. Never generate or \
             execute SQL yourself."
            .to_string();
        let engine = AgentLoop::new(
            provider,
            registry,
            system_prompt,
            config.agent_step_limit,
            config.max_retries,
            config.retry_base_delay_ms,
        );

        Self { engine }
    }
}

#[async_trait]
impl ChatAgent for SqlRetrievalAgent {
    async fn run(&self, user_message: &str, history: &[MemMessage]) -> AgentOutput {
        let llm_history = to_llm_history(history);
        let output = match self.engine.run(user_message, &llm_history).await {
            Ok(o) => o,
            Err(e) => return loop_error(e),
        };

        if let Some(invocation) = output.trace.iter().rev().find(|inv| inv.name == "get_sql_history") {
            if invocation.result.content.starts_with("No prior SQL statement found") {
                return AgentOutput {
                    result: "I couldn't find a previous SQL query for this conversation."
                        .to_string(),
                    trace: output.trace,
                };
            }
            if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&invocation.result.content) {
                if let Some(sql) = payload.get("sql").and_then(|v| v.as_str()) {
                    return AgentOutput {
                        result: format!("```sql\n{sql}\n```"),
                        trace: output.trace,
                    };
                }
            }
        }

        output
    }

    async fn run_streaming(
        &self,
        user_message: &str,
        history: &[MemMessage],
        tx: mpsc::Sender<String>,
    ) -> Option<AgentOutput> {
        let llm_history = to_llm_history(history);
        let output = match self
            .engine
            .run_streaming(user_message, &llm_history, tx.clone())
            .await
        {
            Ok(o) => o,
            Err(e) if e.is::<StreamCancelled>() => return None,
            Err(e) => return Some(loop_error(e)),
        };

        if let Some(invocation) = output.trace.iter().rev().find(|inv| inv.name == "get_sql_history") {
            if invocation.result.content.starts_with("No prior SQL statement found") {
                let text = "I couldn't find a previous SQL query for this conversation.";
                send_if_different(&tx, &output.result, text).await;
                return Some(AgentOutput {
                    result: text.to_string(),
                    trace: output.trace,
                });
            }
            if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&invocation.result.content) {
                if let Some(sql) = payload.get("sql").and_then(|v| v.as_str()) {
                    let text = format!("```sql\n{sql}\n```");
                    send_if_different(&tx, &output.result, &text).await;
                    return Some(AgentOutput {
                        result: text,
                        trace: output.trace,
                    });
                }
            }
        }

        Some(output)
    }
}

/// No tools, no LLM call: a deterministic fixed-shape response (spec
/// §4.5.4).
pub struct OffTopicAgent;

impl OffTopicAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OffTopicAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatAgent for OffTopicAgent {
    async fn run(&self, _user_message: &str, _history: &[MemMessage]) -> AgentOutput {
        AgentLoop::fixed_response(
            "I'm a SQL analytics assistant for your app portfolio data, so I can't help with \
             that — but I'd be glad to help you explore your data. Try asking things like \
             \"how many apps do we have?\", \"what about iOS apps?\", \"export this as csv\", or \
             \"show me the SQL you used for that\".",
        )
    }

    async fn run_streaming(
        &self,
        _user_message: &str,
        _history: &[MemMessage],
        tx: mpsc::Sender<String>,
    ) -> Option<AgentOutput> {
        let output = AgentLoop::fixed_response(
            "I'm a SQL analytics assistant for your app portfolio data, so I can't help with \
             that — but I'd be glad to help you explore your data. Try asking things like \
             \"how many apps do we have?\", \"what about iOS apps?\", \"export this as csv\", or \
             \"show me the SQL you used for that\".",
        );
        let _ = tx.send(output.result.clone()).await;
        Some(output)
    }
}
