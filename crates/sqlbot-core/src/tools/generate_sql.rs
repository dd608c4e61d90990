use crate::memory::MemoryStore;
use crate::providers::{LlmProvider, LlmResponse, Message as LlmMessage};
use crate::tools::tool::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `generate_sql` — question + recent history window -> bare SQL string.
pub struct GenerateSqlTool {
    provider: Arc<dyn LlmProvider>,
    memory: Arc<dyn MemoryStore>,
    thread_id: String,
    table_name: String,
}

impl GenerateSqlTool {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        memory: Arc<dyn MemoryStore>,
        thread_id: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            memory,
            thread_id: thread_id.into(),
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl Tool for GenerateSqlTool {
    fn name(&self) -> &str {
        "generate_sql"
    }

    fn description(&self) -> &str {
        "Generate a read-only SQL statement against the configured table for a natural-language question."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "question": { "type": "string" } },
            "required": ["question"],
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<ToolResult> {
        let question = args
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let history = self.memory.get_messages(&self.thread_id).await;
        let window: String = history
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            "You translate natural-language analytics questions into a single read-only SQL \
             SELECT or WITH statement against the `{}` table. Respond with SQL only, no \
             commentary, no markdown fences.",
            self.table_name
        );
        let user = if window.is_empty() {
            question.to_string()
        } else {
            format!("Recent conversation:\n{window}\n\nQuestion: {question}")
        };

        let messages = vec![LlmMessage::system(system), LlmMessage::user(user)];
        let response = self.provider.complete(&messages, &[]).await;

        let raw = match response {
            Ok(LlmResponse::Message { content, .. }) => content,
            Ok(LlmResponse::ToolCalls { .. }) => {
                return Ok(ToolResult::ok("ERROR: provider returned a tool call instead of SQL"));
            }
            Err(e) => return Ok(ToolResult::ok(format!("ERROR: {e}"))),
        };

        let sql = strip_fences(&raw).trim().to_string();
        if sql.is_empty() {
            return Ok(ToolResult::ok("ERROR: generated SQL was empty"));
        }
        Ok(ToolResult::ok(sql))
    }
}

fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```sql") {
        rest.trim_end_matches("```").trim().to_string()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sql_fence() {
        assert_eq!(strip_fences("```sql\nSELECT 1\n```"), "SELECT 1");
    }

    #[test]
    fn strips_bare_fence() {
        assert_eq!(strip_fences("```\nSELECT 1\n```"), "SELECT 1");
    }

    #[test]
    fn passes_through_unfenced() {
        assert_eq!(strip_fences("SELECT 1"), "SELECT 1");
    }
}
