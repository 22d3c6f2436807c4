use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use credeval_core::config::{ConfigError, LlmConfig};
use credeval_core::domain::conversation::{
    ToolExecutionRecord, ToolInvocationRequest, UsageMetadata,
};

/// Whether the provider SDK may run tools on its own.
///
/// Only `Manual` is accepted by the adapters in this crate: every tool call
/// must pass through the orchestrator so it lands in the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionMode {
    Manual,
    Automatic,
}

/// Provider-neutral description of one tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON Schema object describing the arguments.
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelStep {
    FinalAnswer { text: String },
    ToolCalls { requests: Vec<ToolInvocationRequest>, text: Option<String> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderReply {
    pub step: ModelStep,
    pub usage: UsageMetadata,
    pub stop_reason: Option<String>,
}

impl ProviderReply {
    pub fn final_answer(text: impl Into<String>, usage: UsageMetadata) -> Self {
        Self { step: ModelStep::FinalAnswer { text: text.into() }, usage, stop_reason: None }
    }

    pub fn tool_calls(requests: Vec<ToolInvocationRequest>, usage: UsageMetadata) -> Self {
        Self { step: ModelStep::ToolCalls { requests, text: None }, usage, stop_reason: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Transport,
    Authentication,
    RateLimited,
    MalformedToolCall,
    Refusal,
    Timeout,
    Decode,
    Server,
    Configuration,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Authentication => "authentication",
            Self::RateLimited => "rate_limited",
            Self::MalformedToolCall => "malformed_tool_call",
            Self::Refusal => "refusal",
            Self::Timeout => "timeout",
            Self::Decode => "decode",
            Self::Server => "server",
            Self::Configuration => "configuration",
        }
    }

    fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport | Self::RateLimited | Self::MalformedToolCall | Self::Timeout | Self::Server
        )
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{} provider error: {message}", kind.as_str())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retryable: kind.default_retryable() }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Maps a non-success HTTP status to an error kind.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Authentication,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::Decode,
        };
        let mut error = Self::new(kind, format!("http {status}: {}", truncate(body, 400)));
        if kind == ProviderErrorKind::Decode {
            // 4xx other than the ones above means the request itself is wrong.
            error.retryable = false;
        }
        error
    }

    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::new(ProviderErrorKind::Timeout, error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(status.as_u16(), &error.to_string())
        } else {
            Self::new(ProviderErrorKind::Transport, error.to_string())
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Decode, message).with_retryable(false)
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}

/// The document handed to the model. Providers encode it themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentInput {
    pub label: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl DocumentInput {
    pub fn pdf(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { label: label.into(), media_type: "application/pdf".to_string(), bytes }
    }
}

/// Provider-native conversation context for one analysis.
///
/// Owned by the orchestrator and passed to every adapter call, so a single
/// adapter instance can serve concurrent analyses.
#[derive(Clone, Debug, Default)]
pub struct ProviderSession {
    pub system: String,
    pub tools: Vec<ToolSchema>,
    pub history: Vec<Value>,
    pub exchanges: u32,
    /// Call ids that came from the provider rather than being synthesised.
    pub native_call_ids: BTreeSet<String>,
}

impl ProviderSession {
    pub fn checkpoint(&self) -> usize {
        self.history.len()
    }

    /// Drops messages appended after `checkpoint`, used when a call fails so
    /// that a retry does not send the same user content twice.
    pub fn rollback(&mut self, checkpoint: usize) {
        self.history.truncate(checkpoint);
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn model(&self) -> &str;
    fn tool_execution(&self) -> ToolExecutionMode;

    /// Opens the conversation with the document, the instructions and the
    /// tool declarations.
    async fn begin(
        &self,
        session: &mut ProviderSession,
        document: &DocumentInput,
        instructions: &str,
        tools: &[ToolSchema],
    ) -> Result<ProviderReply, ProviderError>;

    /// Appends tool results in the order given and asks for the next step.
    async fn continue_with_results(
        &self,
        session: &mut ProviderSession,
        results: &[ToolExecutionRecord],
    ) -> Result<ProviderReply, ProviderError>;

    /// Sends a corrective instruction after a rejected final answer.
    async fn reprompt(
        &self,
        session: &mut ProviderSession,
        correction: &str,
    ) -> Result<ProviderReply, ProviderError>;
}

/// Construction parameters shared by the HTTP adapters.
#[derive(Clone, Debug)]
pub struct AdapterSettings {
    pub model: String,
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout: Duration,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub tool_execution: ToolExecutionMode,
}

impl AdapterSettings {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            model: config.model_name().to_string(),
            api_key: config.require_api_key()?.clone(),
            base_url: config.endpoint().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            tool_execution: ToolExecutionMode::Manual,
        })
    }

    pub fn ensure_manual(&self) -> Result<(), ProviderError> {
        match self.tool_execution {
            ToolExecutionMode::Manual => Ok(()),
            ToolExecutionMode::Automatic => Err(ProviderError::new(
                ProviderErrorKind::Configuration,
                "automatic tool execution is not supported; tools must run through the orchestrator",
            )
            .with_retryable(false)),
        }
    }
}
