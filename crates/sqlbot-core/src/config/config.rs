use crate::providers::provider::LlmProvider;
use crate::providers::{AnthropicProvider, GeminiProvider, OpenAiProvider};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-wide configuration, enumerated in full per the external-interfaces
/// contract. Every field has a default; `SQLBOT_*` environment variables
/// override it at load time the same way `.krabs.json` overlaid
/// `KrabsConfig::default()` in the teacher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Hard cap on retained messages per thread.
    #[serde(default = "default_max_messages_per_thread")]
    pub max_messages_per_thread: usize,
    /// Target ceiling for estimated tokens before compression fires.
    #[serde(default = "default_max_conversation_tokens")]
    pub max_conversation_tokens: usize,
    /// Fraction of the ceiling at which compression fires.
    #[serde(default = "default_compression_trigger_ratio")]
    pub compression_trigger_ratio: f32,
    /// Recent messages retained verbatim through compression.
    #[serde(default = "default_keep_recent_messages")]
    pub keep_recent_messages: usize,
    /// Query Record ring size per thread.
    #[serde(default = "default_max_queries_per_thread")]
    pub max_queries_per_thread: usize,
    /// Max tool-loop iterations per agent run.
    #[serde(default = "default_agent_step_limit")]
    pub agent_step_limit: usize,
    /// Wall-clock timeout per inbound message, in seconds.
    #[serde(default = "default_message_timeout_s")]
    pub message_timeout_s: u64,
    /// Required table token for the SQL validator.
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Directory CSV exports are written into.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    /// LLM provider: "openai" | "anthropic" | "gemini".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// How many times to retry a failed LLM/tool call before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Base delay in milliseconds for exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_messages_per_thread() -> usize {
    10
}
fn default_max_conversation_tokens() -> usize {
    4000
}
fn default_compression_trigger_ratio() -> f32 {
    0.8
}
fn default_keep_recent_messages() -> usize {
    5
}
fn default_max_queries_per_thread() -> usize {
    10
}
fn default_agent_step_limit() -> usize {
    10
}
fn default_message_timeout_s() -> u64 {
    60
}
fn default_table_name() -> String {
    "app_portfolio".to_string()
}
fn default_export_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_provider() -> String {
    std::env::var("SQLBOT_PROVIDER").unwrap_or_else(|_| "openai".to_string())
}
fn default_model() -> String {
    std::env::var("SQLBOT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string())
}
fn default_base_url() -> String {
    std::env::var("SQLBOT_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string())
}
fn default_max_retries() -> usize {
    2
}
fn default_retry_base_delay_ms() -> u64 {
    500
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            max_messages_per_thread: default_max_messages_per_thread(),
            max_conversation_tokens: default_max_conversation_tokens(),
            compression_trigger_ratio: default_compression_trigger_ratio(),
            keep_recent_messages: default_keep_recent_messages(),
            max_queries_per_thread: default_max_queries_per_thread(),
            agent_step_limit: default_agent_step_limit(),
            message_timeout_s: default_message_timeout_s(),
            table_name: default_table_name(),
            export_dir: default_export_dir(),
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            api_key: std::env::var("SQLBOT_API_KEY").unwrap_or_default(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl BotConfig {
    /// Load defaults, then overlay `SQLBOT_*` environment variables.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SQLBOT_MAX_MESSAGES_PER_THREAD") {
            if let Ok(n) = v.parse() {
                config.max_messages_per_thread = n;
            }
        }
        if let Ok(v) = std::env::var("SQLBOT_MAX_CONVERSATION_TOKENS") {
            if let Ok(n) = v.parse() {
                config.max_conversation_tokens = n;
            }
        }
        if let Ok(v) = std::env::var("SQLBOT_COMPRESSION_TRIGGER_RATIO") {
            if let Ok(n) = v.parse() {
                config.compression_trigger_ratio = n;
            }
        }
        if let Ok(v) = std::env::var("SQLBOT_KEEP_RECENT_MESSAGES") {
            if let Ok(n) = v.parse() {
                config.keep_recent_messages = n;
            }
        }
        if let Ok(v) = std::env::var("SQLBOT_MAX_QUERIES_PER_THREAD") {
            if let Ok(n) = v.parse() {
                config.max_queries_per_thread = n;
            }
        }
        if let Ok(v) = std::env::var("SQLBOT_AGENT_STEP_LIMIT") {
            if let Ok(n) = v.parse() {
                config.agent_step_limit = n;
            }
        }
        if let Ok(v) = std::env::var("SQLBOT_TABLE_NAME") {
            config.table_name = v;
        }
        if let Ok(v) = std::env::var("SQLBOT_EXPORT_DIR") {
            config.export_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SQLBOT_MESSAGE_TIMEOUT_S") {
            if let Ok(n) = v.parse() {
                config.message_timeout_s = n;
            }
        }

        config
    }

    pub fn build_provider(&self) -> Box<dyn LlmProvider> {
        match self.provider.as_str() {
            "anthropic" => Box::new(AnthropicProvider::new(
                &self.base_url,
                &self.api_key,
                &self.model,
            )),
            "gemini" | "google" => Box::new(GeminiProvider::new(&self.api_key, &self.model)),
            _ => Box::new(OpenAiProvider::new(
                &self.base_url,
                &self.api_key,
                &self.model,
            )),
        }
    }
}
