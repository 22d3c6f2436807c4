//! Anthropic Messages API adapter.
//!
//! Tool calls arrive as `tool_use` content blocks and are answered with
//! `tool_result` blocks carrying the same id. The API never runs tools
//! itself, so manual execution is the only mode.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use credeval_core::domain::conversation::{
    ToolExecutionRecord, ToolInvocationRequest, UsageMetadata,
};

use crate::llm::{
    AdapterSettings, DocumentInput, ModelStep, ProviderAdapter, ProviderError, ProviderErrorKind,
    ProviderReply, ProviderSession, ToolExecutionMode, ToolSchema,
};
use crate::providers::{http_client, joined_text, EMPTY_REPLY_PLACEHOLDER};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    settings: AdapterSettings,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Unknown,
}

impl AnthropicAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, ProviderError> {
        settings.ensure_manual()?;
        Ok(Self { client: http_client(&settings)?, settings })
    }

    fn request_body(&self, session: &ProviderSession) -> Value {
        let tools = session
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect::<Vec<_>>();
        json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_output_tokens,
            "temperature": self.settings.temperature,
            "system": session.system,
            "tools": tools,
            "messages": session.history,
        })
    }

    async fn exchange(
        &self,
        session: &mut ProviderSession,
        user_content: Vec<Value>,
    ) -> Result<ProviderReply, ProviderError> {
        let checkpoint = session.checkpoint();
        session.history.push(json!({ "role": "user", "content": user_content }));

        match self.send(session).await {
            Ok((reply, assistant_content)) => {
                session.history.push(json!({ "role": "assistant", "content": assistant_content }));
                session.exchanges += 1;
                Ok(reply)
            }
            Err(error) => {
                session.rollback(checkpoint);
                Err(error)
            }
        }
    }

    async fn send(
        &self,
        session: &ProviderSession,
    ) -> Result<(ProviderReply, Vec<Value>), ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.settings.base_url))
            .header("x-api-key", self.settings.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(session))
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }

        let message: MessagesResponse = serde_json::from_str(&body)
            .map_err(|error| ProviderError::decode(format!("messages response: {error}")))?;
        debug!(
            event_name = "provider.anthropic.response",
            stop_reason = message.stop_reason.as_deref().unwrap_or("none"),
            blocks = message.content.len(),
            "received messages response"
        );
        let reply = parse_reply(&message)?;
        Ok((reply, history_content(message.content)))
    }
}

fn parse_reply(message: &MessagesResponse) -> Result<ProviderReply, ProviderError> {
    if message.stop_reason.as_deref() == Some("refusal") {
        return Err(ProviderError::new(ProviderErrorKind::Refusal, "model refused the request")
            .with_retryable(false));
    }

    let mut texts = Vec::new();
    let mut requests = Vec::new();
    for raw in &message.content {
        match serde_json::from_value::<ContentBlock>(raw.clone()) {
            Ok(ContentBlock::Text { text }) => texts.push(text),
            Ok(ContentBlock::ToolUse { id, name, input }) => {
                let Value::Object(arguments) = input else {
                    return Err(ProviderError::new(
                        ProviderErrorKind::MalformedToolCall,
                        format!("tool_use `{name}` input is not an object"),
                    ));
                };
                requests.push(ToolInvocationRequest::new(id, name, arguments));
            }
            Ok(ContentBlock::Unknown) => {}
            Err(error) => {
                return Err(ProviderError::new(
                    ProviderErrorKind::MalformedToolCall,
                    format!("unreadable content block: {error}"),
                ))
            }
        }
    }

    let usage = message
        .usage
        .as_ref()
        .map(|usage| UsageMetadata::new(usage.input_tokens, usage.output_tokens))
        .unwrap_or_default();
    let text = joined_text(texts.iter().map(String::as_str));
    let step = if requests.is_empty() {
        ModelStep::FinalAnswer { text: text.unwrap_or_default() }
    } else {
        ModelStep::ToolCalls { requests, text }
    };
    Ok(ProviderReply { step, usage, stop_reason: message.stop_reason.clone() })
}

/// Assistant content to keep in history; never empty.
fn history_content(content: Vec<Value>) -> Vec<Value> {
    if content.is_empty() {
        vec![json!({ "type": "text", "text": EMPTY_REPLY_PLACEHOLDER })]
    } else {
        content
    }
}

fn tool_result_block(record: &ToolExecutionRecord) -> Value {
    let mut block = Map::new();
    block.insert("type".to_string(), json!("tool_result"));
    block.insert("tool_use_id".to_string(), json!(record.call_id()));
    block.insert("content".to_string(), json!(record.model_payload().to_string()));
    if !record.is_success() {
        block.insert("is_error".to_string(), json!(true));
    }
    Value::Object(block)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn tool_execution(&self) -> ToolExecutionMode {
        self.settings.tool_execution
    }

    async fn begin(
        &self,
        session: &mut ProviderSession,
        document: &DocumentInput,
        instructions: &str,
        tools: &[ToolSchema],
    ) -> Result<ProviderReply, ProviderError> {
        session.system = instructions.to_string();
        session.tools = tools.to_vec();
        let content = vec![
            json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": document.media_type,
                    "data": STANDARD.encode(&document.bytes),
                },
            }),
            json!({
                "type": "text",
                "text": format!("Analyze the attached credential document `{}`.", document.label),
            }),
        ];
        self.exchange(session, content).await
    }

    async fn continue_with_results(
        &self,
        session: &mut ProviderSession,
        results: &[ToolExecutionRecord],
    ) -> Result<ProviderReply, ProviderError> {
        let content = results.iter().map(tool_result_block).collect();
        self.exchange(session, content).await
    }

    async fn reprompt(
        &self,
        session: &mut ProviderSession,
        correction: &str,
    ) -> Result<ProviderReply, ProviderError> {
        self.exchange(session, vec![json!({ "type": "text", "text": correction })]).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Map};

    use credeval_core::domain::conversation::{
        ToolExecutionRecord, ToolInvocationRequest, ToolOutcome,
    };

    use super::{history_content, parse_reply, tool_result_block, MessagesResponse};
    use crate::providers::EMPTY_REPLY_PLACEHOLDER;
    use crate::llm::{ModelStep, ProviderErrorKind};

    fn response(value: serde_json::Value) -> MessagesResponse {
        serde_json::from_value(value).expect("response")
    }

    #[test]
    fn tool_use_blocks_become_requests_with_provider_ids() {
        let reply = parse_reply(&response(json!({
            "content": [
                {"type": "text", "text": "Checking the country."},
                {"type": "tool_use", "id": "toolu_01", "name": "search_countries", "input": {"query": "Korea"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1200, "output_tokens": 40}
        })))
        .expect("reply");

        match reply.step {
            ModelStep::ToolCalls { requests, text } => {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].call_id, "toolu_01");
                assert_eq!(requests[0].argument_str("query"), Some("Korea"));
                assert_eq!(text.as_deref(), Some("Checking the country."));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(reply.usage.total_tokens(), 1240);
    }

    #[test]
    fn text_only_reply_is_final_and_refusal_is_an_error() {
        let reply = parse_reply(&response(json!({
            "content": [{"type": "text", "text": "{\"credentials\": []}"}],
            "stop_reason": "end_turn"
        })))
        .expect("reply");
        assert!(matches!(reply.step, ModelStep::FinalAnswer { .. }));

        let refusal = parse_reply(&response(json!({ "content": [], "stop_reason": "refusal" })))
            .expect_err("refusal");
        assert_eq!(refusal.kind, ProviderErrorKind::Refusal);
        assert!(!refusal.retryable);
    }

    #[test]
    fn failed_tool_results_are_flagged() {
        let now = Utc::now();
        let record = ToolExecutionRecord::new(
            ToolInvocationRequest::new("toolu_02", "find_institutions", Map::new()),
            now,
            now,
            ToolOutcome::Error { kind: "invalid_arguments".to_string(), message: "missing query".to_string() },
        );
        let block = tool_result_block(&record);
        assert_eq!(block["tool_use_id"], "toolu_02");
        assert_eq!(block["is_error"], true);
    }

    #[test]
    fn empty_reply_keeps_a_placeholder_in_history() {
        let message = response(json!({ "content": [], "stop_reason": "end_turn" }));
        let reply = parse_reply(&message).expect("reply");
        assert_eq!(reply.step, ModelStep::FinalAnswer { text: String::new() });

        let content = history_content(message.content);
        assert_eq!(content, vec![json!({ "type": "text", "text": EMPTY_REPLY_PLACEHOLDER })]);

        let kept = history_content(vec![json!({ "type": "text", "text": "done" })]);
        assert_eq!(kept[0]["text"], "done");
    }
}
