//! Gemini `generateContent` adapter.
//!
//! Function calling is declared with mode `AUTO` so the model may choose
//! between answering and calling tools, but nothing is executed on the
//! provider side: `functionCall` parts come back to the orchestrator and are
//! answered with `functionResponse` parts.

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

const BLOCKING_FINISH_REASONS: &[&str] =
    &["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

pub struct GeminiAdapter {
    client: reqwest::Client,
    settings: AdapterSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    id: Option<String>,
}

impl GeminiAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self, ProviderError> {
        settings.ensure_manual()?;
        Ok(Self { client: http_client(&settings)?, settings })
    }

    fn request_body(&self, session: &ProviderSession) -> Value {
        let declarations = session
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect::<Vec<_>>();
        json!({
            "system_instruction": { "parts": [{ "text": session.system }] },
            "contents": session.history,
            "tools": [{ "function_declarations": declarations }],
            "tool_config": { "function_calling_config": { "mode": "AUTO" } },
            "generationConfig": {
                "temperature": self.settings.temperature,
                "maxOutputTokens": self.settings.max_output_tokens,
            },
        })
    }

    async fn exchange(
        &self,
        session: &mut ProviderSession,
        user_parts: Vec<Value>,
    ) -> Result<ProviderReply, ProviderError> {
        let checkpoint = session.checkpoint();
        session.history.push(json!({ "role": "user", "parts": user_parts }));

        let turn = session.exchanges + 1;
        let parsed = match self.send(session).await {
            Ok(response) => parse_reply(&response, turn),
            Err(error) => Err(error),
        };
        match parsed {
            Ok((reply, model_parts, native_ids)) => {
                session.history.push(json!({ "role": "model", "parts": model_parts }));
                session.native_call_ids.extend(native_ids);
                session.exchanges = turn;
                Ok(reply)
            }
            Err(error) => {
                session.rollback(checkpoint);
                Err(error)
            }
        }
    }

    async fn send(&self, session: &ProviderSession) -> Result<GenerateResponse, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url, self.settings.model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.settings.api_key.expose_secret())
            .json(&self.request_body(session))
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|error| ProviderError::decode(format!("generateContent response: {error}")))
    }
}

/// Returns the normalized reply, the model parts to keep in history and the
/// call ids the API supplied itself.
fn parse_reply(
    response: &GenerateResponse,
    turn: u32,
) -> Result<(ProviderReply, Vec<Value>, Vec<String>), ProviderError> {
    if let Some(reason) =
        response.prompt_feedback.as_ref().and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(ProviderError::new(
            ProviderErrorKind::Refusal,
            format!("prompt blocked: {reason}"),
        )
        .with_retryable(false));
    }

    let Some(candidate) = response.candidates.first() else {
        return Err(ProviderError::decode("response has no candidates"));
    };
    let finish_reason = candidate.finish_reason.clone();
    match finish_reason.as_deref() {
        Some(reason) if BLOCKING_FINISH_REASONS.contains(&reason) => {
            return Err(ProviderError::new(
                ProviderErrorKind::Refusal,
                format!("generation stopped: {reason}"),
            )
            .with_retryable(false));
        }
        Some("MALFORMED_FUNCTION_CALL") => {
            return Err(ProviderError::new(
                ProviderErrorKind::MalformedToolCall,
                "model produced a malformed function call",
            ));
        }
        _ => {}
    }

    let raw_parts = candidate.content.as_ref().map(|content| content.parts.clone()).unwrap_or_default();
    let mut texts = Vec::new();
    let mut requests = Vec::new();
    let mut native_ids = Vec::new();
    let mut history_parts = Vec::with_capacity(raw_parts.len());

    for (index, raw) in raw_parts.into_iter().enumerate() {
        let part: Part = serde_json::from_value(raw.clone()).map_err(|error| {
            ProviderError::new(ProviderErrorKind::MalformedToolCall, format!("unreadable part: {error}"))
        })?;
        if let Some(text) = part.text {
            texts.push(text);
        }
        if let Some(call) = part.function_call {
            let arguments = match call.args {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(arguments)) => arguments,
                Some(_) => {
                    return Err(ProviderError::new(
                        ProviderErrorKind::MalformedToolCall,
                        format!("functionCall `{}` args are not an object", call.name),
                    ))
                }
            };
            let call_id = match call.id.filter(|id| !id.is_empty()) {
                Some(id) => {
                    native_ids.push(id.clone());
                    id
                }
                None => format!("{}-{turn}-{index}", call.name),
            };
            requests.push(ToolInvocationRequest::new(call_id, call.name, arguments));
        }
        history_parts.push(raw);
    }

    if history_parts.is_empty() {
        history_parts.push(json!({ "text": EMPTY_REPLY_PLACEHOLDER }));
    }

    let usage = response
        .usage_metadata
        .as_ref()
        .map(|usage| UsageMetadata::new(usage.prompt_token_count, usage.candidates_token_count))
        .unwrap_or_default();
    let text = joined_text(texts.iter().map(String::as_str));
    let step = if requests.is_empty() {
        ModelStep::FinalAnswer { text: text.unwrap_or_default() }
    } else {
        ModelStep::ToolCalls { requests, text }
    };
    debug!(
        event_name = "provider.gemini.response",
        finish_reason = finish_reason.as_deref().unwrap_or("none"),
        turn,
        "received generateContent response"
    );
    Ok((ProviderReply { step, usage, stop_reason: finish_reason }, history_parts, native_ids))
}

fn function_response_part(record: &ToolExecutionRecord, session: &ProviderSession) -> Value {
    let response = match record.model_payload() {
        Value::Object(object) => Value::Object(object),
        other => json!({ "result": other }),
    };
    let mut call = Map::new();
    call.insert("name".to_string(), json!(record.tool_name()));
    call.insert("response".to_string(), response);
    if session.native_call_ids.contains(record.call_id()) {
        call.insert("id".to_string(), json!(record.call_id()));
    }
    json!({ "functionResponse": call })
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
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
        let parts = vec![
            json!({
                "inline_data": {
                    "mime_type": document.media_type,
                    "data": STANDARD.encode(&document.bytes),
                }
            }),
            json!({ "text": format!("Analyze the attached credential document `{}`.", document.label) }),
        ];
        self.exchange(session, parts).await
    }

    async fn continue_with_results(
        &self,
        session: &mut ProviderSession,
        results: &[ToolExecutionRecord],
    ) -> Result<ProviderReply, ProviderError> {
        let parts = results.iter().map(|record| function_response_part(record, &*session)).collect();
        self.exchange(session, parts).await
    }

    async fn reprompt(
        &self,
        session: &mut ProviderSession,
        correction: &str,
    ) -> Result<ProviderReply, ProviderError> {
        self.exchange(session, vec![json!({ "text": correction })]).await
    }
}
