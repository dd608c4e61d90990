use crate::csv::generate_csv;
use crate::memory::Row;
use crate::tools::tool::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// `generate_csv` — cached rows -> a file path on disk.
pub struct GenerateCsvTool {
    export_dir: PathBuf,
}

impl GenerateCsvTool {
    pub fn new(export_dir: PathBuf) -> Self {
        Self { export_dir }
    }
}

#[async_trait]
impl Tool for GenerateCsvTool {
    fn name(&self) -> &str {
        "generate_csv"
    }

    fn description(&self) -> &str {
        "Write cached query rows to a CSV file and return its path."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "columns": { "type": "array", "items": { "type": "string" } },
                "data": { "type": "array" },
                "filename": { "type": "string" },
            },
            "required": ["columns", "data"],
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<ToolResult> {
        let columns: Vec<String> = serde_json::from_value(
            args.get("columns").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )?;
        let data: Vec<Row> = serde_json::from_value(
            args.get("data").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )?;
        let filename = args.get("filename").and_then(|v| v.as_str());

        match generate_csv(&columns, &data, &self.export_dir, filename) {
            Ok(path) => Ok(ToolResult::ok(path.display().to_string())),
            Err(e) => Ok(ToolResult::ok(format!("ERROR: {e}"))),
        }
    }
}
