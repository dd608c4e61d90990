use crate::memory::MemoryStore;
use crate::tools::tool::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `get_cached_results` — the most recent successful Query Record's results.
pub struct GetCachedResultsTool {
    memory: Arc<dyn MemoryStore>,
    thread_id: String,
}

impl GetCachedResultsTool {
    pub fn new(memory: Arc<dyn MemoryStore>, thread_id: impl Into<String>) -> Self {
        Self {
            memory,
            thread_id: thread_id.into(),
        }
    }
}

#[async_trait]
impl Tool for GetCachedResultsTool {
    fn name(&self) -> &str {
        "get_cached_results"
    }

    fn description(&self) -> &str {
        "Retrieve the most recent successful query's cached results for this thread, if any."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, _args: serde_json::Value) -> Result<ToolResult> {
        let queries = self.memory.get_sql_queries(&self.thread_id).await;
        let record = queries
            .into_iter()
            .rev()
            .find(|q| q.results.as_ref().is_some_and(|r| r.success));

        match record {
            Some(record) => {
                let results = record.results.expect("filtered for Some above");
                Ok(ToolResult::ok(serde_json::to_string(&serde_json::json!({
                    "data": results.data,
                    "row_count": results.row_count,
                    "columns": results.columns,
                    "sql": record.sql,
                    "timestamp": record.timestamp,
                }))?))
            }
            None => Ok(ToolResult::ok("No cached query results for this thread. Please run a query first.")),
        }
    }
}
