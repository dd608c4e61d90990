pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use provider::{LlmProvider, LlmResponse, Message, Role, TokenUsage, ToolCall};
