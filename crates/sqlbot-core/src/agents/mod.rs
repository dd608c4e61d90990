pub mod agent;
pub mod roles;

pub use agent::{AgentLoop, AgentOutput, ToolInvocation};
pub use roles::{ChatAgent, CsvExportAgent, OffTopicAgent, SqlQueryAgent, SqlRetrievalAgent};
