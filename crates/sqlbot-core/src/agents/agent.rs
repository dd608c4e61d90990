//! Generic tool-loop engine shared by every specialized agent (spec §4.5,
//! §4.5's added "Tool-loop engine" note). Generalized from the teacher's
//! `KrabsAgent::run`: system prompt + bounded turns of
//! `LlmProvider::complete`, dispatching any tool calls through a
//! `ToolRegistry`, until a final text answer, the step limit, or an
//! unrecoverable error.

use crate::providers::provider::StreamChunk;
use crate::providers::{LlmProvider, LlmResponse, Message, ToolCall};
use crate::tools::{Tool, ToolDef, ToolRegistry, ToolResult};
use anyhow::Result;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Signals that the transport receiving streamed chunks was dropped and the
/// loop stopped at the next tool boundary (spec §5 cancellation semantics),
/// as opposed to a genuine provider/tool failure.
#[derive(Debug)]
pub struct StreamCancelled;

impl fmt::Display for StreamCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream cancelled: receiver dropped")
    }
}

impl std::error::Error for StreamCancelled {}

/// One tool call and the result the agent observed for it.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub args: serde_json::Value,
    pub result: ToolResult,
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub result: String,
    pub trace: Vec<ToolInvocation>,
}

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    registry: ToolRegistry,
    system_prompt: String,
    step_limit: usize,
    max_retries: usize,
    retry_base_delay_ms: u64,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: ToolRegistry,
        system_prompt: impl Into<String>,
        step_limit: usize,
        max_retries: usize,
        retry_base_delay_ms: u64,
    ) -> Self {
        Self {
            provider,
            registry,
            system_prompt: system_prompt.into(),
            step_limit,
            max_retries,
            retry_base_delay_ms,
        }
    }

    /// A fixed final answer with no LLM call and no tool calls — used by the
    /// Off-Topic agent, whose response is a deterministic template rather
    /// than model output (spec §4.5.4: "emits a polite fixed-shape
    /// response"). Keeping this on `AgentLoop` means every agent, including
    /// this one, returns the same `AgentOutput` shape.
    pub fn fixed_response(text: impl Into<String>) -> AgentOutput {
        AgentOutput {
            result: text.into(),
            trace: Vec::new(),
        }
    }

    pub async fn run(&self, user_message: &str, history: &[Message]) -> Result<AgentOutput> {
        let tool_defs = self.registry.tool_defs();
        let mut messages = vec![Message::system(&self.system_prompt)];
        messages.extend(history.iter().cloned());
        messages.push(Message::user(user_message));

        let mut trace = Vec::new();

        for turn in 0..self.step_limit {
            debug!(turn, messages = messages.len(), "agent loop turn");

            let response = self
                .call_with_retry(turn, || {
                    let msgs = messages.clone();
                    let defs = tool_defs.clone();
                    async move { self.provider.complete(&msgs, &defs).await }
                })
                .await?;

            match response {
                LlmResponse::Message { content, .. } => {
                    info!(turn, "agent loop produced final message");
                    messages.push(Message::assistant(&content));
                    return Ok(AgentOutput {
                        result: content,
                        trace,
                    });
                }
                LlmResponse::ToolCalls { calls, .. } => {
                    info!(turn, calls = calls.len(), "agent loop got tool calls");
                    messages.push(Message::assistant_tool_calls(calls.clone()));

                    for call in calls {
                        let (result, invocation) = self.dispatch(turn, call).await;
                        trace.push(invocation);
                        messages.push(result);
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "agent step limit ({}) exceeded",
            self.step_limit
        ))
    }

    /// Same turn/dispatch loop as [`AgentLoop::run`], but each turn goes
    /// through `LlmProvider::stream_complete` and forwards `Delta` chunks to
    /// `out_tx` as they arrive, instead of buffering the whole answer. Stops
    /// at the next tool boundary with [`StreamCancelled`] once `out_tx`'s
    /// receiver is gone.
    pub async fn run_streaming(
        &self,
        user_message: &str,
        history: &[Message],
        out_tx: mpsc::Sender<String>,
    ) -> Result<AgentOutput> {
        let tool_defs = self.registry.tool_defs();
        let mut messages = vec![Message::system(&self.system_prompt)];
        messages.extend(history.iter().cloned());
        messages.push(Message::user(user_message));

        let mut trace = Vec::new();

        for turn in 0..self.step_limit {
            debug!(turn, messages = messages.len(), "agent loop streaming turn");

            let response = self
                .call_with_retry(turn, || self.stream_turn(&messages, &tool_defs, &out_tx))
                .await?;

            match response {
                LlmResponse::Message { content, .. } => {
                    info!(turn, "agent loop produced final message");
                    messages.push(Message::assistant(&content));
                    return Ok(AgentOutput {
                        result: content,
                        trace,
                    });
                }
                LlmResponse::ToolCalls { calls, .. } => {
                    info!(turn, calls = calls.len(), "agent loop got tool calls");
                    messages.push(Message::assistant_tool_calls(calls.clone()));

                    if out_tx.is_closed() {
                        return Err(anyhow::Error::new(StreamCancelled));
                    }
                    for call in calls {
                        let (result, invocation) = self.dispatch(turn, call).await;
                        trace.push(invocation);
                        messages.push(result);
                    }
                    if out_tx.is_closed() {
                        return Err(anyhow::Error::new(StreamCancelled));
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "agent step limit ({}) exceeded",
            self.step_limit
        ))
    }

    /// Drives one `stream_complete` call to completion, forwarding `Delta`
    /// text live to `out_tx` and collecting tool calls, yielding the same
    /// `LlmResponse` shape `run`'s non-streaming turn produces.
    async fn stream_turn(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        out_tx: &mpsc::Sender<String>,
    ) -> Result<LlmResponse> {
        let (inner_tx, mut inner_rx) = mpsc::channel::<StreamChunk>(32);
        let provider = Arc::clone(&self.provider);
        let msgs = messages.to_vec();
        let defs = tools.to_vec();
        let task = tokio::spawn(async move { provider.stream_complete(&msgs, &defs, inner_tx).await });

        let mut content = String::new();
        let mut calls = Vec::new();
        let mut usage = crate::providers::TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
        };

        while let Some(chunk) = inner_rx.recv().await {
            match chunk {
                StreamChunk::Delta { text } => {
                    content.push_str(&text);
                    let _ = out_tx.send(text).await;
                }
                StreamChunk::ToolCallReady { call } => calls.push(call),
                StreamChunk::Done { usage: u } => usage = u,
            }
        }

        task.await
            .map_err(|e| anyhow::anyhow!("stream task panicked: {e}"))??;

        if calls.is_empty() {
            Ok(LlmResponse::Message { content, usage })
        } else {
            Ok(LlmResponse::ToolCalls { calls, usage })
        }
    }

    async fn dispatch(&self, turn: usize, call: ToolCall) -> (Message, ToolInvocation) {
        let result = match self.registry.get(&call.name) {
            Some(tool) => {
                self.call_tool_with_retry(turn, &call.name, tool, call.args.clone())
                    .await
            }
            None => ToolResult::err(format!("tool not found: {}", call.name)),
        };

        let message = Message::tool_result(&result.content, &call.id, &call.name);
        let invocation = ToolInvocation {
            name: call.name,
            args: call.args,
            result,
        };
        (message, invocation)
    }

    async fn call_with_retry<F, Fut, T>(&self, turn: usize, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 0..=self.max_retries {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.retry_base_delay_ms * 2u64.pow(attempt as u32);
                        warn!(turn, attempt, %e, delay_ms = delay, "llm call failed, retrying");
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        unreachable!()
    }

    async fn call_tool_with_retry(
        &self,
        turn: usize,
        tool_name: &str,
        tool: Arc<dyn Tool>,
        args: serde_json::Value,
    ) -> ToolResult {
        for attempt in 0..=self.max_retries {
            match tool.call(args.clone()).await {
                Ok(result) if !result.is_error => return result,
                Ok(result) => {
                    if attempt < self.max_retries {
                        let delay = self.retry_base_delay_ms * 2u64.pow(attempt as u32);
                        warn!(turn, tool_name, attempt, delay_ms = delay, "tool returned error, retrying");
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    } else {
                        return result;
                    }
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = self.retry_base_delay_ms * 2u64.pow(attempt as u32);
                        warn!(turn, tool_name, attempt, %e, delay_ms = delay, "tool call errored, retrying");
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
                    } else {
                        return ToolResult::err(e.to_string());
                    }
                }
            }
        }
        unreachable!()
    }
}
