//! RFC-4180 CSV generation (spec §4.3, §6). Hand-rolled: nothing in the
//! corpus reaches for a CSV crate for this shape of task.

use crate::memory::Row;
use chrono::Utc;
use std::path::PathBuf;

pub fn generate_csv(
    columns: &[String],
    data: &[Row],
    export_dir: &std::path::Path,
    filename: Option<&str>,
) -> Result<PathBuf, String> {
    if data.is_empty() {
        return Err("no data to export".to_string());
    }

    let mut out = String::new();
    out.push_str(&columns.iter().map(|c| quote_field(c)).collect::<Vec<_>>().join(","));
    out.push_str("\r\n");

    for row in data {
        let fields: Vec<String> = columns
            .iter()
            .map(|col| {
                let value = row
                    .iter()
                    .find(|(name, _)| name == col)
                    .map(|(_, v)| value_to_field(v))
                    .unwrap_or_default();
                quote_field(&value)
            })
            .collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }

    let name = filename
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("app_portfolio_export_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")));
    let path = export_dir.join(name);
    std::fs::write(&path, out).map_err(|e| e.to_string())?;
    Ok(path)
}

fn value_to_field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(app: &str, revenue: &str) -> Row {
        vec![
            ("app_name".to_string(), serde_json::json!(app)),
            ("revenue".to_string(), serde_json::json!(revenue)),
        ]
    }

    #[test]
    fn refuses_empty_data() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate_csv(&["app_name".to_string()], &[], dir.path(), None).unwrap_err();
        assert!(err.contains("no data"));
    }

    #[test]
    fn quotes_fields_with_commas_and_writes_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let columns = vec!["app_name".to_string(), "revenue".to_string()];
        let data = vec![row("App, Inc", "1,234")];
        let path = generate_csv(&columns, &data, dir.path(), Some("out.csv")).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("\"App, Inc\""));
        assert!(content.contains("\"1,234\""));
        assert!(content.ends_with("\r\n"));
    }

    #[test]
    fn header_uses_source_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let columns = vec!["revenue".to_string(), "app_name".to_string()];
        let data = vec![row("App1", "10")];
        let path = generate_csv(&columns, &data, dir.path(), Some("out.csv")).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let header = content.lines().next().unwrap();
        assert_eq!(header, "revenue,app_name");
    }
}
