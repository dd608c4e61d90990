use crate::memory::MemoryStore;
use crate::tools::tool::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `get_sql_history` — retrieve a previously run statement by description.
pub struct GetSqlHistoryTool {
    memory: Arc<dyn MemoryStore>,
    thread_id: String,
}

impl GetSqlHistoryTool {
    pub fn new(memory: Arc<dyn MemoryStore>, thread_id: impl Into<String>) -> Self {
        Self {
            memory,
            thread_id: thread_id.into(),
        }
    }
}

#[async_trait]
impl Tool for GetSqlHistoryTool {
    fn name(&self) -> &str {
        "get_sql_history"
    }

    fn description(&self) -> &str {
        "Retrieve a previously executed SQL statement for this thread, optionally matched by description."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "description": { "type": "string" } },
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<ToolResult> {
        let description = args.get("description").and_then(|v| v.as_str());

        match self
            .memory
            .find_sql_by_description(&self.thread_id, description)
            .await
        {
            Some(record) => Ok(ToolResult::ok(serde_json::to_string(&serde_json::json!({
                "sql": record.sql,
                "question": record.question,
                "timestamp": record.timestamp,
            }))?)),
            None => Ok(ToolResult::ok("No prior SQL statement found for this thread.")),
        }
    }
}
