use crate::db::Database;
use crate::memory::QueryResult;
use crate::tools::tool::{Tool, ToolResult};
use crate::validator::SqlValidator;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// `execute_sql` — validates then runs a statement against the database.
pub struct ExecuteSqlTool {
    db: Arc<dyn Database>,
    validator: Arc<SqlValidator>,
}

impl ExecuteSqlTool {
    pub fn new(db: Arc<dyn Database>, validator: Arc<SqlValidator>) -> Self {
        Self { db, validator }
    }
}

#[async_trait]
impl Tool for ExecuteSqlTool {
    fn name(&self) -> &str {
        "execute_sql"
    }

    fn description(&self) -> &str {
        "Execute a validated read-only SQL statement and return its results."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "sql": { "type": "string" } },
            "required": ["sql"],
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<ToolResult> {
        let sql = args.get("sql").and_then(|v| v.as_str()).unwrap_or_default();

        let result = if let Err(reason) = self.validator.validate(sql) {
            QueryResult::err(reason.to_string())
        } else {
            match self.db.query(sql).await {
                Ok(r) => r,
                Err(e) => QueryResult::err(e.to_string()),
            }
        };

        Ok(ToolResult::ok(serde_json::to_string(&result)?))
    }
}
