use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{
    ConversationEvent, ConversationPhase, FlowAction, FlowContext, TransitionOutcome,
};

pub trait FlowDefinition {
    fn name(&self) -> &'static str;
    fn initial_phase(&self) -> ConversationPhase;
    fn transition(
        &self,
        current: ConversationPhase,
        event: ConversationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Model step / tool step alternation with bounded turns and at most
/// `max_reprompts` corrective prompts.
#[derive(Clone, Debug, Default)]
pub struct ToolCallingFlow;

impl FlowDefinition for ToolCallingFlow {
    fn name(&self) -> &'static str {
        "tool_calling"
    }

    fn initial_phase(&self) -> ConversationPhase {
        ConversationPhase::Started
    }

    fn transition(
        &self,
        current: ConversationPhase,
        event: ConversationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_tool_calling(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow_name(&self) -> &'static str {
        self.flow.name()
    }

    pub fn initial_phase(&self) -> ConversationPhase {
        self.flow.initial_phase()
    }

    pub fn apply(
        &self,
        current: ConversationPhase,
        event: ConversationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: ConversationPhase,
        event: ConversationEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.analysis_id.clone(),
                        audit.correlation_id.clone(),
                        "conversation.phase_changed",
                        AuditCategory::Conversation,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event))
                    .with_metadata("model_turns", context.model_turns.to_string()),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.analysis_id.clone(),
                        audit.correlation_id.clone(),
                        "conversation.transition_rejected",
                        AuditCategory::Conversation,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<ToolCallingFlow> {
    fn default() -> Self {
        Self::new(ToolCallingFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("conversation already terminated in {phase:?}; cannot apply {event:?}")]
    AlreadyTerminal { phase: ConversationPhase, event: ConversationEvent },
    #[error("invalid transition from {phase:?} using event {event:?}")]
    InvalidTransition { phase: ConversationPhase, event: ConversationEvent },
}

fn transition_tool_calling(
    current: ConversationPhase,
    event: ConversationEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use ConversationEvent::{
        CatalogFailed, DeadlineExceeded, FinalAnswerAccepted, FinalAnswerRejected,
        InputsValidated, ProviderFailed, ToolCallsReceived, ToolResultsReady,
    };
    use ConversationPhase::{AwaitingModel, Completed, ExecutingTools, Failed, Started, TimedOut};
    use FlowAction::{
        BuildResult, ContinueWithResults, ExecuteTools, ReportCatalogFailure,
        ReportDeadlineExceeded, ReportMalformedResult, ReportProviderFailure,
        ReportTurnBudgetExhausted, RequestFirstStep, SendCorrectivePrompt,
    };

    if current.is_terminal() {
        return Err(FlowTransitionError::AlreadyTerminal { phase: current, event });
    }

    let budget_left = context.turns_remaining() > 0;
    let (to, actions) = match (current, event) {
        (Started, InputsValidated) if budget_left => (AwaitingModel, vec![RequestFirstStep]),
        (Started, InputsValidated) => (TimedOut, vec![ReportTurnBudgetExhausted]),
        (AwaitingModel, ToolCallsReceived) => (ExecutingTools, vec![ExecuteTools]),
        (ExecutingTools, ToolResultsReady) if budget_left => {
            (AwaitingModel, vec![ContinueWithResults])
        }
        (ExecutingTools, ToolResultsReady) => (TimedOut, vec![ReportTurnBudgetExhausted]),
        (AwaitingModel, FinalAnswerAccepted) => (Completed, vec![BuildResult]),
        (AwaitingModel, FinalAnswerRejected)
            if budget_left && context.reprompts_used < context.max_reprompts =>
        {
            (AwaitingModel, vec![SendCorrectivePrompt])
        }
        (AwaitingModel, FinalAnswerRejected) => (Failed, vec![ReportMalformedResult]),
        (AwaitingModel, ProviderFailed) => (Failed, vec![ReportProviderFailure]),
        (AwaitingModel, CatalogFailed) => (Failed, vec![ReportCatalogFailure]),
        (_, DeadlineExceeded) => (TimedOut, vec![ReportDeadlineExceeded]),
        _ => return Err(FlowTransitionError::InvalidTransition { phase: current, event }),
    };

    Ok(TransitionOutcome { from: current, to, event, actions })
}
