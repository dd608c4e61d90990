pub mod agents;
pub mod config;
pub mod csv;
pub mod db;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod router;
pub mod tools;
pub mod validator;

pub use agents::{AgentLoop, AgentOutput, ChatAgent, CsvExportAgent, OffTopicAgent, SqlQueryAgent, SqlRetrievalAgent};
pub use config::BotConfig;
pub use db::{Database, SqliteDatabase};
pub use error::{DatabaseError, ValidationError};
pub use memory::{InMemoryThreadStore, Message, MemoryStore, QueryRecord, QueryResult, Role, Row};
pub use orchestrator::Orchestrator;
pub use providers::provider::{LlmProvider, LlmResponse, StreamChunk, TokenUsage, ToolCall};
pub use providers::{AnthropicProvider, GeminiProvider, OpenAiProvider};
pub use router::{Classification, Intent, Router};
pub use tools::{
    ExecuteSqlTool, FormatResultTool, GenerateCsvTool, GenerateSqlTool, GetCachedResultsTool,
    GetSqlHistoryTool, Tool, ToolDef, ToolRegistry, ToolResult,
};
pub use validator::SqlValidator;
