use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use credeval_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use credeval_core::config::OrchestratorConfig;
use credeval_core::domain::analysis::AnalysisResult;
use credeval_core::errors::DomainError;
use credeval_core::domain::conversation::{
    AnalysisId, ConversationState, CorrectivePrompt, EvaluationType, ModelAnswer, ModelProposal,
    ToolExecutionRecord, ToolInvocationRequest, UsageMetadata, UserSubmission,
};
use credeval_core::flows::{
    ConversationEvent, ConversationPhase, FlowAction, FlowContext, FlowEngine, ToolCallingFlow,
};
use credeval_db::repositories::CatalogRepository;

use crate::guardrails::ProvenanceIndex;
use crate::llm::{
    DocumentInput, ModelStep, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderReply,
    ProviderSession, ToolExecutionMode,
};
use crate::prompts;
use crate::result::{ResultBuilder, ResultError};
use crate::tools::ToolRegistry;

const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub max_turns: u32,
    pub deadline: Duration,
    pub max_reprompts: u32,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub parallel_tools: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_turns: 40,
            deadline: Duration::from_secs(1800),
            max_reprompts: 1,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            parallel_tools: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig, max_retries: u32) -> Self {
        Self {
            max_turns: config.max_turns,
            deadline: Duration::from_secs(config.deadline_secs),
            max_reprompts: config.max_reprompts.min(1),
            max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            parallel_tools: config.parallel_tools,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnalysisRequest {
    pub document: DocumentInput,
    pub evaluation_type: EvaluationType,
    pub analysis_id: Option<AnalysisId>,
}

impl AnalysisRequest {
    pub fn new(document: DocumentInput, evaluation_type: EvaluationType) -> Self {
        Self { document, evaluation_type, analysis_id: None }
    }
}

/// Input problems detected before any provider call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("document `{label}` is empty")]
    EmptyDocument { label: String },
    #[error("document `{label}` is not a readable {media_type} file")]
    UnsupportedDocument { label: String, media_type: String },
    #[error("provider `{provider}` executes tools automatically; only manual tool execution is allowed")]
    AutomaticToolExecution { provider: String },
    #[error("conversation protocol violation: {0}")]
    Protocol(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    Provider { kind: ProviderErrorKind, message: String, attempts: u32 },
    MalformedResult { missing: Vec<String>, detail: Option<String> },
    TurnBudgetExhausted { max_turns: u32 },
    DeadlineExceeded { deadline_secs: u64 },
    Catalog { message: String },
    Protocol { message: String },
}

/// Terminal state of one analysis. The conversation is always included,
/// partial when the analysis did not complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub analysis_id: AnalysisId,
    pub status: ConversationPhase,
    pub failure: Option<FailureReason>,
    pub result: Option<AnalysisResult>,
    pub conversation: ConversationState,
    pub tool_calls: usize,
    pub usage: UsageMetadata,
    pub elapsed_ms: u64,
}

impl AnalysisOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == ConversationPhase::Completed
    }
}

/// Forwards audit events to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        info!(
            event_name = %event.event_type,
            correlation_id = %event.correlation_id,
            category = ?event.category,
            outcome = ?event.outcome,
            metadata = %metadata,
            "audit event"
        );
    }
}

enum ProviderCall<'a> {
    Begin { document: &'a DocumentInput, instructions: &'a str },
    Continue { records: &'a [ToolExecutionRecord] },
    Reprompt { correction: &'a str },
}

impl ProviderCall<'_> {
    fn label(&self) -> &'static str {
        match self {
            Self::Begin { .. } => "begin",
            Self::Continue { .. } => "continue",
            Self::Reprompt { .. } => "reprompt",
        }
    }
}

/// Mutable state of one running analysis.
struct Run {
    phase: ConversationPhase,
    context: FlowContext,
    conversation: ConversationState,
    session: ProviderSession,
    audit: AuditContext,
    failure: Option<FailureReason>,
    result: Option<AnalysisResult>,
}

/// Drives one document through the model/tool loop.
///
/// One instance can serve concurrent analyses: every call to
/// [`ConversationOrchestrator::analyze`] owns its conversation and provider
/// session.
pub struct ConversationOrchestrator {
    provider: Arc<dyn ProviderAdapter>,
    tools: ToolRegistry,
    results: ResultBuilder,
    settings: OrchestratorSettings,
    flow: FlowEngine<ToolCallingFlow>,
    audit_sink: Arc<dyn AuditSink>,
}

impl ConversationOrchestrator {
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        catalog: Arc<dyn CatalogRepository>,
        settings: OrchestratorSettings,
    ) -> Result<Self, AnalysisError> {
        if provider.tool_execution() != ToolExecutionMode::Manual {
            return Err(AnalysisError::AutomaticToolExecution {
                provider: provider.name().to_string(),
            });
        }
        Ok(Self {
            provider,
            tools: ToolRegistry::catalog_tools(catalog.clone()),
            results: ResultBuilder::new(catalog),
            settings,
            flow: FlowEngine::default(),
            audit_sink: Arc::new(NoopAuditSink),
        })
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        validate_document(&request.document)?;

        let started = Instant::now();
        let analysis_id = request.analysis_id.clone().unwrap_or_else(AnalysisId::generate);
        let instructions = prompts::instructions_for(request.evaluation_type);
        let mut conversation = ConversationState::new(
            analysis_id.clone(),
            self.provider.name(),
            self.provider.model(),
            request.evaluation_type,
        );
        conversation
            .record_submission(UserSubmission {
                document_label: request.document.label.clone(),
                media_type: request.document.media_type.clone(),
                document_bytes: request.document.bytes.len(),
                evaluation_type: request.evaluation_type,
                instructions_chars: instructions.chars().count(),
                submitted_at: Utc::now(),
            })
            .map_err(|error| AnalysisError::Protocol(error.to_string()))?;

        let mut run = Run {
            phase: self.flow.initial_phase(),
            context: FlowContext::new(self.settings.max_turns, self.settings.max_reprompts),
            conversation,
            session: ProviderSession::default(),
            audit: AuditContext::for_analysis(&analysis_id, self.provider.name()),
            failure: None,
            result: None,
        };
        self.audit_sink.emit(
            run.audit
                .event("conversation.started", AuditCategory::Ingress, AuditOutcome::Success)
                .with_metadata("document", request.document.label.clone())
                .with_metadata("evaluation_type", request.evaluation_type.as_str())
                .with_metadata("model", self.provider.model()),
        );
        info!(
            event_name = "conversation.started",
            correlation_id = %analysis_id,
            provider = self.provider.name(),
            model = self.provider.model(),
            document_bytes = request.document.bytes.len(),
            "starting document analysis"
        );

        let drive = self.drive(&mut run, &request.document, &instructions, request.evaluation_type);
        if tokio::time::timeout(self.settings.deadline, drive).await.is_err() {
            warn!(
                event_name = "conversation.deadline_exceeded",
                correlation_id = %analysis_id,
                deadline_secs = self.settings.deadline.as_secs(),
                "abandoning analysis at wall-clock deadline"
            );
            if self.transition(&mut run, ConversationEvent::DeadlineExceeded).is_ok_and(|actions| {
                actions.contains(&FlowAction::ReportDeadlineExceeded)
            }) {
                run.failure = Some(FailureReason::DeadlineExceeded {
                    deadline_secs: self.settings.deadline.as_secs(),
                });
            }
        }

        Ok(self.finish(run, started))
    }

    fn finish(&self, run: Run, started: Instant) -> AnalysisOutcome {
        let outcome = match run.phase {
            ConversationPhase::Completed => AuditOutcome::Success,
            _ => AuditOutcome::Failed,
        };
        let event_type = format!("conversation.{}", run.phase.as_str());
        let mut event = run
            .audit
            .event(event_type.clone(), AuditCategory::Result, outcome)
            .with_metadata("model_turns", run.conversation.model_turns().to_string())
            .with_metadata("total_tokens", run.conversation.usage().total_tokens().to_string());
        if let Some(failure) = &run.failure {
            event = event.with_metadata("failure", format!("{failure:?}"));
        }
        self.audit_sink.emit(event);

        let tool_calls = run.conversation.tool_records().count();
        let usage = run.conversation.usage();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            event_name = %event_type,
            correlation_id = %run.conversation.analysis_id(),
            model_turns = run.conversation.model_turns(),
            tool_calls,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            elapsed_ms,
            "analysis finished"
        );

        AnalysisOutcome {
            analysis_id: run.conversation.analysis_id().clone(),
            status: run.phase,
            failure: run.failure,
            result: run.result,
            conversation: run.conversation,
            tool_calls,
            usage,
            elapsed_ms,
        }
    }

    async fn drive(
        &self,
        run: &mut Run,
        document: &DocumentInput,
        instructions: &str,
        evaluation_type: EvaluationType,
    ) {
        let Ok(actions) = self.transition(run, ConversationEvent::InputsValidated) else {
            return;
        };
        if !actions.contains(&FlowAction::RequestFirstStep) {
            self.exhaust_budget(run, &actions);
            return;
        }

        let mut pending = self.call_provider(run, ProviderCall::Begin { document, instructions }).await;

        loop {
            let (reply, latency_ms) = match pending {
                Ok(reply) => reply,
                Err((error, attempts)) => {
                    self.fail_provider(run, error, attempts);
                    return;
                }
            };
            run.context.model_turns += 1;
            let model_turn = run.context.model_turns;

            match reply.step {
                ModelStep::ToolCalls { requests, text } => {
                    let proposal = ModelProposal {
                        model_turn,
                        requests: requests.clone(),
                        text,
                        usage: reply.usage,
                        latency_ms,
                        received_at: Utc::now(),
                    };
                    if let Err(error) = run.conversation.record_proposal(proposal) {
                        self.fail_protocol(run, error.into());
                        return;
                    }
                    if self.transition(run, ConversationEvent::ToolCallsReceived).is_err() {
                        return;
                    }

                    let records = self.execute_tools(&run.audit, &requests).await;
                    if let Err(error) = run.conversation.record_tool_results(records.clone()) {
                        self.fail_protocol(run, error.into());
                        return;
                    }
                    let Ok(actions) = self.transition(run, ConversationEvent::ToolResultsReady)
                    else {
                        return;
                    };
                    if !actions.contains(&FlowAction::ContinueWithResults) {
                        self.exhaust_budget(run, &actions);
                        return;
                    }
                    pending =
                        self.call_provider(run, ProviderCall::Continue { records: &records }).await;
                }
                ModelStep::FinalAnswer { text } => {
                    let provenance = ProvenanceIndex::from_conversation(&run.conversation, &self.tools);
                    let answer = ModelAnswer {
                        model_turn,
                        raw_text: text.clone(),
                        usage: reply.usage,
                        latency_ms,
                        received_at: Utc::now(),
                        rejection: None,
                    };

                    match self.results.build(&text, evaluation_type, &provenance).await {
                        Ok(result) => {
                            if let Err(error) = run.conversation.record_final_answer(answer) {
                                self.fail_protocol(run, error.into());
                                return;
                            }
                            let accepted = self
                                .transition(run, ConversationEvent::FinalAnswerAccepted)
                                .is_ok_and(|actions| actions.contains(&FlowAction::BuildResult));
                            if accepted {
                                self.audit_sink.emit(
                                    run.audit
                                        .event(
                                            "result.built",
                                            AuditCategory::Result,
                                            AuditOutcome::Success,
                                        )
                                        .with_metadata(
                                            "credentials",
                                            result.credentials.len().to_string(),
                                        )
                                        .with_metadata(
                                            "validated_fields",
                                            result.validated_field_count().to_string(),
                                        ),
                                );
                                run.result = Some(result);
                            }
                            return;
                        }
                        Err(ResultError::Catalog(error)) => {
                            let message = error.to_string();
                            let unresolved =
                                ModelAnswer { rejection: Some(message.clone()), ..answer };
                            if let Err(error) = run.conversation.record_rejected_answer(unresolved) {
                                self.fail_protocol(run, error.into());
                                return;
                            }
                            if self
                                .transition(run, ConversationEvent::CatalogFailed)
                                .is_ok_and(|actions| actions.contains(&FlowAction::ReportCatalogFailure))
                            {
                                run.failure = Some(FailureReason::Catalog { message });
                            }
                            return;
                        }
                        Err(ResultError::MalformedResult { missing, detail }) => {
                            let problem = ResultError::MalformedResult {
                                missing: missing.clone(),
                                detail: detail.clone(),
                            }
                            .to_string();
                            warn!(
                                event_name = "conversation.final_answer_rejected",
                                correlation_id = %run.audit.correlation_id,
                                turn = model_turn,
                                problem = %problem,
                                "final answer rejected"
                            );
                            let rejected = ModelAnswer { rejection: Some(problem.clone()), ..answer };
                            if let Err(error) = run.conversation.record_rejected_answer(rejected) {
                                self.fail_protocol(run, error.into());
                                return;
                            }
                            let Ok(actions) =
                                self.transition(run, ConversationEvent::FinalAnswerRejected)
                            else {
                                return;
                            };
                            if !actions.contains(&FlowAction::SendCorrectivePrompt) {
                                if actions.contains(&FlowAction::ReportMalformedResult) {
                                    run.failure =
                                        Some(FailureReason::MalformedResult { missing, detail });
                                }
                                return;
                            }

                            run.context.reprompts_used += 1;
                            let correction = prompts::corrective_prompt(&problem);
                            if let Err(error) = run.conversation.record_corrective_prompt(
                                CorrectivePrompt { reason: problem, sent_at: Utc::now() },
                            ) {
                                self.fail_protocol(run, error.into());
                                return;
                            }
                            pending = self
                                .call_provider(run, ProviderCall::Reprompt { correction: &correction })
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Calls the provider, retrying retryable errors with exponential backoff.
    async fn call_provider(
        &self,
        run: &mut Run,
        call: ProviderCall<'_>,
    ) -> Result<(ProviderReply, u64), (ProviderError, u32)> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = match &call {
                ProviderCall::Begin { document, instructions } => {
                    let schemas = self.tools.schemas();
                    self.provider.begin(&mut run.session, document, instructions, &schemas).await
                }
                ProviderCall::Continue { records } => {
                    self.provider.continue_with_results(&mut run.session, records).await
                }
                ProviderCall::Reprompt { correction } => {
                    self.provider.reprompt(&mut run.session, correction).await
                }
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(reply) => {
                    self.audit_sink.emit(
                        run.audit
                            .event("provider.responded", AuditCategory::Provider, AuditOutcome::Success)
                            .with_metadata("call", call.label())
                            .with_metadata("latency_ms", latency_ms.to_string())
                            .with_metadata("input_tokens", reply.usage.input_tokens.to_string())
                            .with_metadata("output_tokens", reply.usage.output_tokens.to_string()),
                    );
                    return Ok((reply, latency_ms));
                }
                Err(error) if error.retryable && attempt < self.settings.max_retries => {
                    let delay = self.settings.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        event_name = "provider.retry_scheduled",
                        correlation_id = %run.audit.correlation_id,
                        call = call.label(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retryable provider error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err((error, attempt + 1)),
            }
        }
    }

    async fn execute_tools(
        &self,
        audit: &AuditContext,
        requests: &[ToolInvocationRequest],
    ) -> Vec<ToolExecutionRecord> {
        let records = if self.settings.parallel_tools {
            join_all(requests.iter().map(|request| self.tools.run(request))).await
        } else {
            let mut records = Vec::with_capacity(requests.len());
            for request in requests {
                records.push(self.tools.run(request).await);
            }
            records
        };

        for record in &records {
            let outcome =
                if record.is_success() { AuditOutcome::Success } else { AuditOutcome::Rejected };
            self.audit_sink.emit(
                audit
                    .event("conversation.tool_executed", AuditCategory::Tool, outcome)
                    .with_metadata("tool_name", record.tool_name())
                    .with_metadata("call_id", record.call_id())
                    .with_metadata("duration_ms", record.duration_ms().to_string()),
            );
        }
        records
    }

    /// Applies `event` and returns the actions the flow asks for next.
    fn transition(&self, run: &mut Run, event: ConversationEvent) -> Result<Vec<FlowAction>, ()> {
        match self.flow.apply_with_audit(
            run.phase,
            event,
            &run.context,
            self.audit_sink.as_ref(),
            &run.audit,
        ) {
            Ok(outcome) => {
                run.phase = outcome.to;
                Ok(outcome.actions)
            }
            Err(error) => {
                warn!(
                    event_name = "conversation.transition_rejected",
                    correlation_id = %run.audit.correlation_id,
                    error = %error,
                    "conversation transition rejected"
                );
                if !run.phase.is_terminal() {
                    run.phase = ConversationPhase::Failed;
                    run.failure =
                        Some(FailureReason::Protocol { message: DomainError::from(error).to_string() });
                }
                Err(())
            }
        }
    }

    fn fail_provider(&self, run: &mut Run, error: ProviderError, attempts: u32) {
        warn!(
            event_name = "provider.failed",
            correlation_id = %run.audit.correlation_id,
            kind = error.kind.as_str(),
            attempts,
            error = %error,
            "provider call failed"
        );
        if self
            .transition(run, ConversationEvent::ProviderFailed)
            .is_ok_and(|actions| actions.contains(&FlowAction::ReportProviderFailure))
        {
            run.failure = Some(FailureReason::Provider {
                kind: error.kind,
                message: error.message,
                attempts,
            });
        }
    }

    fn exhaust_budget(&self, run: &mut Run, actions: &[FlowAction]) {
        if actions.contains(&FlowAction::ReportTurnBudgetExhausted) {
            warn!(
                event_name = "conversation.turn_budget_exhausted",
                correlation_id = %run.audit.correlation_id,
                max_turns = run.context.max_turns,
                "turn budget exhausted"
            );
            run.failure = Some(FailureReason::TurnBudgetExhausted { max_turns: run.context.max_turns });
        }
    }

    fn fail_protocol(&self, run: &mut Run, error: DomainError) {
        warn!(
            event_name = "conversation.protocol_violation",
            correlation_id = %run.audit.correlation_id,
            error = %error,
            "conversation record rejected a turn"
        );
        run.phase = ConversationPhase::Failed;
        run.failure = Some(FailureReason::Protocol { message: error.to_string() });
    }
}

fn validate_document(document: &DocumentInput) -> Result<(), AnalysisError> {
    if document.bytes.is_empty() {
        return Err(AnalysisError::EmptyDocument { label: document.label.clone() });
    }
    if document.media_type == "application/pdf" && !document.bytes.starts_with(PDF_MAGIC) {
        return Err(AnalysisError::UnsupportedDocument {
            label: document.label.clone(),
            media_type: document.media_type.clone(),
        });
    }
    Ok(())
}
