use crate::memory::QueryResult;
use crate::tools::tool::{Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

/// `format_result` — renders a `QueryResult` as chat-ready text.
pub struct FormatResultTool;

#[async_trait]
impl Tool for FormatResultTool {
    fn name(&self) -> &str {
        "format_result"
    }

    fn description(&self) -> &str {
        "Render a query result as chat-ready text: a scalar, a markdown table, or an error message."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "result": { "type": "object" },
                "question": { "type": "string" },
                "sql": { "type": "string" },
            },
            "required": ["result", "question"],
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<ToolResult> {
        let result: QueryResult = serde_json::from_value(
            args.get("result").cloned().unwrap_or(serde_json::Value::Null),
        )?;
        let question = args.get("question").and_then(|v| v.as_str()).unwrap_or_default();
        let sql = args.get("sql").and_then(|v| v.as_str()).unwrap_or_default();

        Ok(ToolResult::ok(format_result(&result, question, sql)))
    }
}

pub fn format_result(result: &QueryResult, question: &str, sql: &str) -> String {
    if !result.success {
        return format!(
            "Sorry, that query couldn't be completed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if result.data.is_empty() {
        return "No results found.".to_string();
    }

    let body = if is_scalar_shape(result) {
        format_scalar(result)
    } else {
        format_table(result)
    };

    match assumptions_note(question, sql) {
        Some(note) => format!("{body}\n\n*Note:* {note}"),
        None => body,
    }
}

fn is_scalar_shape(result: &QueryResult) -> bool {
    let single_scalar = result.row_count == 1 && result.columns.len() == 1;
    let small_shape = result.row_count <= 1 && result.columns.len() <= 3;
    single_scalar || small_shape
}

fn format_scalar(result: &QueryResult) -> String {
    let Some(row) = result.data.first() else {
        return String::new();
    };
    if row.len() == 1 {
        return row.first().map(|(_, v)| format_value(v)).unwrap_or_default();
    }
    row.iter()
        .map(|(name, v)| format!("{name}: {}", format_value(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_table(result: &QueryResult) -> String {
    let mut lines = Vec::with_capacity(result.data.len() + 2);
    lines.push(format!("| {} |", result.columns.join(" | ")));
    lines.push(format!(
        "| {} |",
        result.columns.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in &result.data {
        let cells: Vec<String> = result
            .columns
            .iter()
            .map(|col| {
                row.iter()
                    .find(|(name, _)| name == col)
                    .map(|(_, v)| format_value(v))
                    .unwrap_or_default()
            })
            .collect();
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(f) = n.as_f64() {
                format!("{f:.2}")
            } else {
                n.to_string()
            }
        }
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn assumptions_note(question: &str, sql: &str) -> Option<String> {
    let haystack = format!("{question} {sql}").to_lowercase();
    let mut fragments = Vec::new();

    if agg_re().is_match(&haystack) {
        fragments.push("this reflects an aggregate computation".to_string());
    }
    if haystack.contains("order by") {
        fragments.push("results are ordered".to_string());
    }
    if haystack.contains("limit")
        || haystack.contains("top")
        || haystack.contains("best")
        || haystack.contains("most")
    {
        fragments.push("results are limited to a top-N subset".to_string());
    }
    if time_window_re().is_match(&haystack) {
        fragments.push("an implicit time window was assumed".to_string());
    }

    if fragments.is_empty() {
        None
    } else {
        Some(fragments.join("; "))
    }
}

fn agg_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"(?i)\b(sum|avg|count)\b").unwrap())
}

fn time_window_re() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"(?i)\b(today|yesterday|this week|this month|last month|this year|recent(ly)?)\b")
            .unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_result(value: i64) -> QueryResult {
        QueryResult::ok(
            vec!["n".to_string()],
            vec![vec![("n".to_string(), serde_json::json!(value))]],
        )
    }

    #[test]
    fn empty_data_returns_fixed_message() {
        let result = QueryResult::ok(vec!["n".to_string()], vec![]);
        assert_eq!(format_result(&result, "q", ""), "No results found.");
    }

    #[test]
    fn single_scalar_has_no_markdown() {
        let result = scalar_result(49);
        assert_eq!(format_result(&result, "how many apps?", ""), "49");
    }

    #[test]
    fn single_row_multi_column_keeps_every_column() {
        let result = QueryResult::ok(
            vec!["app_name".to_string(), "revenue".to_string()],
            vec![vec![
                ("app_name".to_string(), serde_json::json!("App1")),
                ("revenue".to_string(), serde_json::json!(12.5)),
            ]],
        );
        let text = format_result(&result, "revenue for App1", "");
        assert_eq!(text, "app_name: App1, revenue: 12.50");
    }

    #[test]
    fn multi_row_produces_pipe_table() {
        let result = QueryResult::ok(
            vec!["app_name".to_string(), "revenue".to_string()],
            vec![
                vec![
                    ("app_name".to_string(), serde_json::json!("App1")),
                    ("revenue".to_string(), serde_json::json!(12.5)),
                ],
                vec![
                    ("app_name".to_string(), serde_json::json!("App2")),
                    ("revenue".to_string(), serde_json::json!(30.0)),
                ],
            ],
        );
        let text = format_result(&result, "top apps by revenue", "SELECT * ORDER BY revenue LIMIT 2");
        assert!(text.starts_with("| app_name | revenue |"));
        assert!(text.contains("---"));
        assert!(text.contains("*Note:*"));
    }

    #[test]
    fn error_result_gives_friendly_message() {
        let result = QueryResult::err("no such table");
        let text = format_result(&result, "q", "");
        assert!(text.contains("no such table"));
    }
}
