pub mod execute_sql;
pub mod format_result;
pub mod generate_csv;
pub mod generate_sql;
pub mod get_cached_results;
pub mod get_sql_history;
pub mod registry;
pub mod tool;

pub use execute_sql::ExecuteSqlTool;
pub use format_result::FormatResultTool;
pub use generate_csv::GenerateCsvTool;
pub use generate_sql::GenerateSqlTool;
pub use get_cached_results::GetCachedResultsTool;
pub use get_sql_history::GetSqlHistoryTool;
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolDef, ToolResult};
