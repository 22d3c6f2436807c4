use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    Started,
    AwaitingModel,
    ExecutingTools,
    Completed,
    Failed,
    TimedOut,
}

impl ConversationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AwaitingModel => "awaiting_model",
            Self::ExecutingTools => "executing_tools",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEvent {
    InputsValidated,
    ToolCallsReceived,
    ToolResultsReady,
    FinalAnswerAccepted,
    FinalAnswerRejected,
    ProviderFailed,
    CatalogFailed,
    DeadlineExceeded,
}

/// Budget counters the transition table consults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub model_turns: u32,
    pub max_turns: u32,
    pub reprompts_used: u32,
    pub max_reprompts: u32,
}

impl FlowContext {
    pub fn new(max_turns: u32, max_reprompts: u32) -> Self {
        Self { model_turns: 0, max_turns, reprompts_used: 0, max_reprompts }
    }

    pub fn turns_remaining(&self) -> u32 {
        self.max_turns.saturating_sub(self.model_turns)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    RequestFirstStep,
    ExecuteTools,
    ContinueWithResults,
    SendCorrectivePrompt,
    BuildResult,
    ReportTurnBudgetExhausted,
    ReportMalformedResult,
    ReportProviderFailure,
    ReportCatalogFailure,
    ReportDeadlineExceeded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ConversationPhase,
    pub to: ConversationPhase,
    pub event: ConversationEvent,
    pub actions: Vec<FlowAction>,
}
