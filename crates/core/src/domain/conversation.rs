use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisId(pub String);

impl AnalysisId {
    pub fn generate() -> Self {
        Self(format!("an-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvaluationType {
    General,
    CourseByCourse,
}

impl EvaluationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::CourseByCourse => "course-by-course",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unsupported evaluation type `{0}` (expected general|course-by-course)")]
pub struct UnknownEvaluationType(pub String);

impl FromStr for EvaluationType {
    type Err = UnknownEvaluationType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(Self::General),
            "course-by-course" | "course_by_course" | "cbc" => Ok(Self::CourseByCourse),
            other => Err(UnknownEvaluationType(other.to_string())),
        }
    }
}

/// Provider-reported token counts, normalized across backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageMetadata {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for UsageMetadata {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolInvocationRequest {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self { call_id: call_id.into(), tool_name: tool_name.into(), arguments }
    }

    pub fn argument_str(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: Value },
    Error { kind: String, message: String },
}

/// Audit record of one tool invocation. Fields are fixed at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    request: ToolInvocationRequest,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: u64,
    outcome: ToolOutcome,
}

impl ToolExecutionRecord {
    pub fn new(
        request: ToolInvocationRequest,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: ToolOutcome,
    ) -> Self {
        // Wall clock may step backwards between the two reads.
        let finished_at = finished_at.max(started_at);
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self { request, started_at, finished_at, duration_ms, outcome }
    }

    pub fn request(&self) -> &ToolInvocationRequest {
        &self.request
    }

    pub fn call_id(&self) -> &str {
        &self.request.call_id
    }

    pub fn tool_name(&self) -> &str {
        &self.request.tool_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn outcome(&self) -> &ToolOutcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.outcome {
            ToolOutcome::Success { payload } => Some(payload),
            ToolOutcome::Error { .. } => None,
        }
    }

    /// Payload as it is handed back to the model, errors included.
    pub fn model_payload(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success { payload } => payload.clone(),
            ToolOutcome::Error { kind, message } => {
                serde_json::json!({ "error": message, "error_kind": kind, "matches": [] })
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSubmission {
    pub document_label: String,
    pub media_type: String,
    pub document_bytes: usize,
    pub evaluation_type: EvaluationType,
    pub instructions_chars: usize,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelProposal {
    pub model_turn: u32,
    pub requests: Vec<ToolInvocationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub usage: UsageMetadata,
    pub latency_ms: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionBatch {
    pub records: Vec<ToolExecutionRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelAnswer {
    pub model_turn: u32,
    pub raw_text: String,
    pub usage: UsageMetadata,
    pub latency_ms: u64,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectivePrompt {
    pub reason: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    UserSubmission(UserSubmission),
    ModelProposal(ModelProposal),
    ToolExecution(ToolExecutionBatch),
    ModelRejectedAnswer(ModelAnswer),
    CorrectivePrompt(CorrectivePrompt),
    ModelFinalAnswer(ModelAnswer),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    UserSubmission,
    ModelProposal,
    ToolExecution,
    ModelRejectedAnswer,
    CorrectivePrompt,
    ModelFinalAnswer,
}

impl Turn {
    pub fn kind(&self) -> TurnKind {
        match self {
            Self::UserSubmission(_) => TurnKind::UserSubmission,
            Self::ModelProposal(_) => TurnKind::ModelProposal,
            Self::ToolExecution(_) => TurnKind::ToolExecution,
            Self::ModelRejectedAnswer(_) => TurnKind::ModelRejectedAnswer,
            Self::CorrectivePrompt(_) => TurnKind::CorrectivePrompt,
            Self::ModelFinalAnswer(_) => TurnKind::ModelFinalAnswer,
        }
    }
}

impl TurnKind {
    pub fn is_model_step(&self) -> bool {
        matches!(self, Self::ModelProposal | Self::ModelRejectedAnswer | Self::ModelFinalAnswer)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TurnOrderError {
    #[error("turn {next:?} cannot follow {previous:?}")]
    UnexpectedTurn { previous: Option<TurnKind>, next: TurnKind },
    #[error("a model proposal must request at least one tool invocation")]
    EmptyProposal,
    #[error("tool results {actual:?} do not match requested invocations {expected:?}")]
    MismatchedResults { expected: Vec<String>, actual: Vec<String> },
    #[error("tool record `{call_id}` finishes before it starts")]
    NegativeDuration { call_id: String },
}

/// Append-only record of one document analysis conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    analysis_id: AnalysisId,
    provider: String,
    model: String,
    evaluation_type: EvaluationType,
    started_at: DateTime<Utc>,
    turns: Vec<Turn>,
    usage: UsageMetadata,
}

impl ConversationState {
    pub fn new(
        analysis_id: AnalysisId,
        provider: impl Into<String>,
        model: impl Into<String>,
        evaluation_type: EvaluationType,
    ) -> Self {
        Self {
            analysis_id,
            provider: provider.into(),
            model: model.into(),
            evaluation_type,
            started_at: Utc::now(),
            turns: Vec::new(),
            usage: UsageMetadata::default(),
        }
    }

    pub fn analysis_id(&self) -> &AnalysisId {
        &self.analysis_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn evaluation_type(&self) -> EvaluationType {
        self.evaluation_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn usage(&self) -> UsageMetadata {
        self.usage
    }

    pub fn model_turns(&self) -> u32 {
        self.turns.iter().filter(|turn| turn.kind().is_model_step()).count() as u32
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.turns.last(), Some(Turn::ModelFinalAnswer(_)))
    }

    pub fn tool_records(&self) -> impl Iterator<Item = &ToolExecutionRecord> {
        self.turns.iter().flat_map(|turn| match turn {
            Turn::ToolExecution(batch) => batch.records.as_slice(),
            _ => &[],
        })
    }

    pub fn final_answer(&self) -> Option<&ModelAnswer> {
        match self.turns.last() {
            Some(Turn::ModelFinalAnswer(answer)) => Some(answer),
            _ => None,
        }
    }

    pub fn record_submission(&mut self, submission: UserSubmission) -> Result<(), TurnOrderError> {
        self.push(Turn::UserSubmission(submission))
    }

    pub fn record_proposal(&mut self, proposal: ModelProposal) -> Result<(), TurnOrderError> {
        if proposal.requests.is_empty() {
            return Err(TurnOrderError::EmptyProposal);
        }
        let usage = proposal.usage;
        self.push(Turn::ModelProposal(proposal))?;
        self.usage += usage;
        Ok(())
    }

    pub fn record_tool_results(
        &mut self,
        records: Vec<ToolExecutionRecord>,
    ) -> Result<(), TurnOrderError> {
        self.push(Turn::ToolExecution(ToolExecutionBatch { records }))
    }

    pub fn record_rejected_answer(&mut self, answer: ModelAnswer) -> Result<(), TurnOrderError> {
        let usage = answer.usage;
        self.push(Turn::ModelRejectedAnswer(answer))?;
        self.usage += usage;
        Ok(())
    }

    pub fn record_corrective_prompt(
        &mut self,
        prompt: CorrectivePrompt,
    ) -> Result<(), TurnOrderError> {
        self.push(Turn::CorrectivePrompt(prompt))
    }

    pub fn record_final_answer(&mut self, answer: ModelAnswer) -> Result<(), TurnOrderError> {
        let usage = answer.usage;
        self.push(Turn::ModelFinalAnswer(answer))?;
        self.usage += usage;
        Ok(())
    }

    /// Re-checks every ordering rule over the whole sequence.
    pub fn validate_sequence(&self) -> Result<(), TurnOrderError> {
        let mut previous: Option<&Turn> = None;
        for turn in &self.turns {
            check_follows(previous, turn)?;
            previous = Some(turn);
        }
        Ok(())
    }

    fn push(&mut self, turn: Turn) -> Result<(), TurnOrderError> {
        check_follows(self.turns.last(), &turn)?;
        self.turns.push(turn);
        Ok(())
    }
}

fn check_follows(previous: Option<&Turn>, next: &Turn) -> Result<(), TurnOrderError> {
    let unexpected = || TurnOrderError::UnexpectedTurn {
        previous: previous.map(Turn::kind),
        next: next.kind(),
    };

    match (previous, next) {
        (None, Turn::UserSubmission(_)) => Ok(()),
        (
            Some(Turn::UserSubmission(_) | Turn::ToolExecution(_) | Turn::CorrectivePrompt(_)),
            next,
        ) if next.kind().is_model_step() => Ok(()),
        (Some(Turn::ModelProposal(proposal)), Turn::ToolExecution(batch)) => {
            check_results_match(proposal, batch)
        }
        (Some(Turn::ModelRejectedAnswer(_)), Turn::CorrectivePrompt(_)) => Ok(()),
        _ => Err(unexpected()),
    }
}

fn check_results_match(
    proposal: &ModelProposal,
    batch: &ToolExecutionBatch,
) -> Result<(), TurnOrderError> {
    let expected =
        proposal.requests.iter().map(|request| request.call_id.clone()).collect::<Vec<_>>();
    let actual = batch.records.iter().map(|record| record.call_id().to_string()).collect::<Vec<_>>();
    if expected != actual {
        return Err(TurnOrderError::MismatchedResults { expected, actual });
    }

    for record in &batch.records {
        if record.finished_at() < record.started_at() {
            return Err(TurnOrderError::NegativeDuration { call_id: record.call_id().to_string() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{json, Map};

    use super::{
        AnalysisId, ConversationState, CorrectivePrompt, EvaluationType, ModelAnswer,
        ModelProposal, ToolExecutionRecord, ToolInvocationRequest, ToolOutcome, TurnKind,
        TurnOrderError, UsageMetadata, UserSubmission,
    };

    fn submission() -> UserSubmission {
        UserSubmission {
            document_label: "transcript.pdf".to_string(),
            media_type: "application/pdf".to_string(),
            document_bytes: 1024,
            evaluation_type: EvaluationType::General,
            instructions_chars: 400,
            submitted_at: Utc::now(),
        }
    }

    fn request(call_id: &str) -> ToolInvocationRequest {
        let mut arguments = Map::new();
        arguments.insert("query".to_string(), json!("Korea"));
        ToolInvocationRequest::new(call_id, "search_countries", arguments)
    }

    fn proposal(turn: u32, call_ids: &[&str]) -> ModelProposal {
        ModelProposal {
            model_turn: turn,
            requests: call_ids.iter().map(|id| request(id)).collect(),
            text: None,
            usage: UsageMetadata::new(100, 20),
            latency_ms: 5,
            received_at: Utc::now(),
        }
    }

    fn record(call_id: &str) -> ToolExecutionRecord {
        let started = Utc::now();
        ToolExecutionRecord::new(
            request(call_id),
            started,
            started + Duration::milliseconds(3),
            ToolOutcome::Success { payload: json!({ "matches": [] }) },
        )
    }

    fn answer(turn: u32, text: &str) -> ModelAnswer {
        ModelAnswer {
            model_turn: turn,
            raw_text: text.to_string(),
            usage: UsageMetadata::new(300, 80),
            latency_ms: 9,
            received_at: Utc::now(),
            rejection: None,
        }
    }

    fn state() -> ConversationState {
        ConversationState::new(
            AnalysisId("an-test".to_string()),
            "scripted",
            "scripted-model",
            EvaluationType::General,
        )
    }

    #[test]
    fn completed_sequence_alternates_and_sums_usage() {
        let mut state = state();
        state.record_submission(submission()).expect("submission");
        state.record_proposal(proposal(1, &["c1", "c2"])).expect("proposal");
        state.record_tool_results(vec![record("c1"), record("c2")]).expect("results");
        state.record_final_answer(answer(2, "{}")).expect("final");

        assert!(state.is_closed());
        assert_eq!(state.model_turns(), 2);
        assert_eq!(state.usage(), UsageMetadata::new(400, 100));
        assert_eq!(state.tool_records().count(), 2);
        state.validate_sequence().expect("valid sequence");

        let kinds = state.turns().iter().map(|turn| turn.kind()).collect::<Vec<_>>();
        assert_eq!(kinds.first(), Some(&TurnKind::UserSubmission));
        assert_eq!(kinds.last(), Some(&TurnKind::ModelFinalAnswer));
        for pair in kinds[1..].windows(2) {
            assert_ne!(pair[0].is_model_step(), pair[1].is_model_step());
        }
    }

    #[test]
    fn results_out_of_request_order_are_rejected() {
        let mut state = state();
        state.record_submission(submission()).expect("submission");
        state.record_proposal(proposal(1, &["c1", "c2"])).expect("proposal");

        let error = state
            .record_tool_results(vec![record("c2"), record("c1")])
            .expect_err("order must match request order");
        assert!(matches!(error, TurnOrderError::MismatchedResults { .. }));
    }

    #[test]
    fn nothing_may_follow_final_answer() {
        let mut state = state();
        state.record_submission(submission()).expect("submission");
        state.record_final_answer(answer(1, "{}")).expect("final");

        let error = state.record_proposal(proposal(2, &["c1"])).expect_err("closed");
        assert!(matches!(error, TurnOrderError::UnexpectedTurn { .. }));
    }

    #[test]
    fn rejected_answer_requires_corrective_prompt_before_next_model_step() {
        let mut state = state();
        state.record_submission(submission()).expect("submission");
        state.record_rejected_answer(answer(1, "not json")).expect("rejected");
        assert!(state.record_final_answer(answer(2, "{}")).is_err());

        state
            .record_corrective_prompt(CorrectivePrompt {
                reason: "missing credentials".to_string(),
                sent_at: Utc::now(),
            })
            .expect("corrective prompt");
        state.record_final_answer(answer(2, "{}")).expect("final");
        state.validate_sequence().expect("valid sequence");
    }

    #[test]
    fn record_clamps_backwards_clock() {
        let started = Utc::now();
        let record = ToolExecutionRecord::new(
            request("c1"),
            started,
            started - Duration::milliseconds(10),
            ToolOutcome::Error { kind: "execution".to_string(), message: "boom".to_string() },
        );
        assert!(record.finished_at() >= record.started_at());
        assert_eq!(record.duration_ms(), 0);
        assert_eq!(record.model_payload()["error"], "boom");
    }

    #[test]
    fn evaluation_type_parses_aliases() {
        assert_eq!("cbc".parse::<EvaluationType>(), Ok(EvaluationType::CourseByCourse));
        assert_eq!(" General ".parse::<EvaluationType>(), Ok(EvaluationType::General));
        assert!("transcript".parse::<EvaluationType>().is_err());
    }
}
