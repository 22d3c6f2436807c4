use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use credeval_core::domain::conversation::ToolExecutionRecord;

use crate::llm::{
    DocumentInput, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderReply,
    ProviderSession, ToolExecutionMode, ToolSchema,
};

/// What the orchestrator sent, as seen by [`ScriptedAdapter`].
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptedCall {
    Begin { document_bytes: usize, tool_names: Vec<&'static str> },
    Continue { records: Vec<ToolExecutionRecord> },
    Reprompt { correction: String },
}

/// Replays queued replies in order. Used by tests and dry runs.
pub struct ScriptedAdapter {
    replies: Mutex<VecDeque<Result<ProviderReply, ProviderError>>>,
    repeat_last: Option<ProviderReply>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedAdapter {
    pub fn new(replies: Vec<Result<ProviderReply, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            repeat_last: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns `reply` forever once the queue is drained.
    pub fn repeating(mut self, reply: ProviderReply) -> Self {
        self.repeat_last = Some(reply);
        self
    }

    /// Waits `delay` before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn next(&self, call: ScriptedCall) -> Result<ProviderReply, ProviderError> {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = match self.replies.lock() {
            Ok(mut replies) => replies.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        match (queued, &self.repeat_last) {
            (Some(reply), _) => reply,
            (None, Some(reply)) => Ok(reply.clone()),
            (None, None) => Err(ProviderError::new(ProviderErrorKind::Server, "script exhausted")
                .with_retryable(false)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn tool_execution(&self) -> ToolExecutionMode {
        ToolExecutionMode::Manual
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
        session.exchanges += 1;
        self.next(ScriptedCall::Begin {
            document_bytes: document.bytes.len(),
            tool_names: tools.iter().map(|tool| tool.name).collect(),
        })
        .await
    }

    async fn continue_with_results(
        &self,
        session: &mut ProviderSession,
        results: &[ToolExecutionRecord],
    ) -> Result<ProviderReply, ProviderError> {
        session.exchanges += 1;
        self.next(ScriptedCall::Continue { records: results.to_vec() }).await
    }

    async fn reprompt(
        &self,
        session: &mut ProviderSession,
        correction: &str,
    ) -> Result<ProviderReply, ProviderError> {
        session.exchanges += 1;
        self.next(ScriptedCall::Reprompt { correction: correction.to_string() }).await
    }
}
