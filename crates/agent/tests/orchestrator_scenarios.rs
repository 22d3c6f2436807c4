use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use credeval_agent::llm::{
    DocumentInput, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderReply,
    ProviderSession, ToolExecutionMode, ToolSchema,
};
use credeval_agent::providers::{ScriptedAdapter, ScriptedCall};
use credeval_agent::runtime::{
    AnalysisError, AnalysisRequest, ConversationOrchestrator, FailureReason, OrchestratorSettings,
};
use credeval_core::audit::InMemoryAuditSink;
use credeval_core::domain::analysis::{MatchConfidence, Resolution};
use credeval_core::domain::catalog::{
    CatalogId, CatalogStatistics, Country, ForeignCredential, GradeScale, Institution,
    IntegrityReport, ProgramLength, UsEquivalency,
};
use credeval_core::domain::conversation::{
    EvaluationType, ToolExecutionRecord, ToolInvocationRequest, Turn, UsageMetadata,
};
use credeval_core::flows::ConversationPhase;
use credeval_db::repositories::{CatalogRepository, InMemoryCatalogRepository, RepositoryError};
use credeval_db::FixtureCatalog;

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_turns: 10,
        deadline: Duration::from_secs(30),
        max_reprompts: 1,
        max_retries: 2,
        retry_backoff: Duration::from_millis(1),
        parallel_tools: true,
    }
}

fn document() -> DocumentInput {
    DocumentInput::pdf("transcript.pdf", b"%PDF-1.7 scanned transcript".to_vec())
}

fn call(id: &str, tool: &str, arguments: Value) -> ToolInvocationRequest {
    let Value::Object(arguments) = arguments else { panic!("arguments must be an object") };
    ToolInvocationRequest::new(id, tool, arguments)
}

fn tool_calls(requests: Vec<ToolInvocationRequest>) -> Result<ProviderReply, ProviderError> {
    Ok(ProviderReply::tool_calls(requests, UsageMetadata::new(900, 30)))
}

fn final_answer(text: &str) -> Result<ProviderReply, ProviderError> {
    Ok(ProviderReply::final_answer(text, UsageMetadata::new(1500, 400)))
}

fn orchestrator(adapter: Arc<ScriptedAdapter>, settings: OrchestratorSettings) -> ConversationOrchestrator {
    ConversationOrchestrator::new(adapter, Arc::new(FixtureCatalog::in_memory()), settings)
        .expect("scripted adapter is manual")
}

const KOREA_ANSWER: &str = r#"Here is the evaluation.
```json
{
  "analysis_summary": {"total_credentials_found": 1, "document_type": "transcript", "analysis_confidence": "high"},
  "credentials": [{
    "credential_id": "credential_1",
    "country": {"extracted_value": "Korea", "validated_id": "Republic of Korea", "confidence": "high"},
    "institution": {"extracted_name": "Seoul National University", "validated_id": "inst-kr-snu", "confidence": "high"},
    "foreign_credential": {"extracted_type": "Bachelor of Science", "validated_id": "fc-kr-bachelor", "confidence": "medium"},
    "us_equivalency": {"equivalency_statement": "Bachelor's degree", "validated_id": "us-bachelor", "confidence": "high"},
    "program_of_study": "Computer Science",
    "award_date": "2012-02-24",
    "attendance_dates": "2008-2012"
  }]
}
```"#;

#[tokio::test]
async fn korean_transcript_is_validated_against_tool_results() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_calls(vec![call("c1", "search_countries", json!({"query": "Korea"}))]),
        tool_calls(vec![
            call(
                "c2",
                "find_institutions",
                json!({"country_name": "Republic of Korea", "query": "Seoul National"}),
            ),
            call("c3", "get_foreign_credentials", json!({"country_name": "Republic of Korea"})),
            call("c4", "get_us_equivalencies", json!({"query": "Bachelor"})),
        ]),
        final_answer(KOREA_ANSWER),
    ]));
    let sink = InMemoryAuditSink::default();
    let orchestrator =
        orchestrator(adapter.clone(), settings()).with_audit_sink(Arc::new(sink.clone()));

    let outcome = orchestrator
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Completed);
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.tool_calls, 4);
    assert_eq!(outcome.conversation.model_turns(), 3);
    outcome.conversation.validate_sequence().expect("alternation holds");

    let result = outcome.result.expect("result");
    assert_eq!(result.credentials.len(), 1);
    let credential = &result.credentials[0];
    assert_eq!(credential.country.validated_id, Some(CatalogId::from("Republic of Korea")));
    assert_eq!(credential.country.resolution, Resolution::Resolved);
    assert_eq!(credential.institution.canonical_value.as_deref(), Some("서울대학교"));
    assert_eq!(
        credential.institution.canonical_english_value.as_deref(),
        Some("Seoul National University")
    );
    assert_eq!(credential.foreign_credential.resolution, Resolution::Resolved);
    let equivalency = credential.us_equivalency.as_ref().expect("us equivalency");
    assert_eq!(equivalency.validated_id, Some(CatalogId::from("us-bachelor")));
    assert_eq!(result.validated_field_count(), 4);

    let calls = adapter.calls();
    assert_eq!(calls.len(), 3);
    match &calls[0] {
        ScriptedCall::Begin { tool_names, .. } => assert_eq!(tool_names.len(), 6),
        other => panic!("unexpected first call {other:?}"),
    }
    match &calls[2] {
        ScriptedCall::Continue { records } => {
            let ids = records.iter().map(ToolExecutionRecord::call_id).collect::<Vec<_>>();
            assert_eq!(ids, vec!["c2", "c3", "c4"]);
            assert!(records.iter().all(ToolExecutionRecord::is_success));
        }
        other => panic!("unexpected third call {other:?}"),
    }

    let events = sink.event_types();
    for expected in ["conversation.started", "conversation.tool_executed", "result.built", "conversation.completed"] {
        assert!(events.iter().any(|event| event == expected), "missing {expected} in {events:?}");
    }
}

#[tokio::test]
async fn unknown_country_stays_unvalidated() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_calls(vec![call("c1", "search_countries", json!({"query": "Atlantis"}))]),
        final_answer(
            r#"{"analysis_summary": {"total_credentials_found": 1, "analysis_confidence": "low"},
                "credentials": [{
                  "country": {"extracted_value": "Atlantis", "validated_id": null, "confidence": "not_found"},
                  "institution": "Royal Academy of Atlantis",
                  "foreign_credential": "Diploma"
                }]}"#,
        ),
    ]));

    let outcome = orchestrator(adapter.clone(), settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Completed);
    let result = outcome.result.expect("result");
    let credential = &result.credentials[0];
    assert_eq!(credential.credential_id, "credential_1");
    assert_eq!(credential.country.validated_id, None);
    assert_eq!(credential.country.confidence, MatchConfidence::NotFound);
    assert_eq!(credential.institution.extracted_value, "Royal Academy of Atlantis");
    assert_eq!(result.validated_field_count(), 0);

    match &adapter.calls()[1] {
        ScriptedCall::Continue { records } => {
            let payload = records[0].payload().expect("successful lookup");
            assert_eq!(payload["matches"], json!([]));
            assert_eq!(payload["total_found"], 0);
        }
        other => panic!("unexpected second call {other:?}"),
    }
}

#[tokio::test]
async fn ids_never_returned_by_a_tool_are_not_trusted() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_calls(vec![call("c1", "search_countries", json!({"query": "Korea"}))]),
        final_answer(
            r#"{"analysis_summary": {"total_credentials_found": 1},
                "credentials": [{
                  "country": {"extracted_value": "Korea", "validated_id": "Republic of Korea", "confidence": "high"},
                  "institution": {"extracted_name": "Yonsei University", "validated_id": "inst-kr-yonsei", "confidence": "high"},
                  "foreign_credential": {"extracted_type": "Bachelor", "validated_id": null}
                }]}"#,
        ),
    ]));

    let outcome = orchestrator(adapter, settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    let result = outcome.result.expect("result");
    let credential = &result.credentials[0];
    assert_eq!(credential.country.resolution, Resolution::Resolved);
    assert!(matches!(credential.institution.resolution, Resolution::Untraced { .. }));
    assert!(!credential.institution.is_validated());
    assert_eq!(credential.institution.confidence, MatchConfidence::Low);
}

#[tokio::test]
async fn malformed_answer_gets_one_corrective_prompt_then_fails() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        final_answer("I could not read the document."),
        final_answer(r#"{"credentials": []}"#),
        final_answer(r#"{"analysis_summary": {}, "credentials": []}"#),
    ]));

    let outcome = orchestrator(adapter.clone(), settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Failed);
    assert!(outcome.result.is_none());
    match outcome.failure {
        Some(FailureReason::MalformedResult { missing, .. }) => {
            assert_eq!(missing, vec!["analysis_summary".to_string()]);
        }
        other => panic!("unexpected failure {other:?}"),
    }

    let calls = adapter.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[1], ScriptedCall::Reprompt { .. }));

    let kinds = outcome.conversation.turns().iter().map(Turn::kind).collect::<Vec<_>>();
    assert_eq!(kinds.len(), 4);
    assert!(matches!(outcome.conversation.turns()[2], Turn::CorrectivePrompt(_)));
    outcome.conversation.validate_sequence().expect("alternation holds");
}

#[tokio::test]
async fn corrected_answer_completes_after_reprompt() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        final_answer("no json here"),
        final_answer(r#"{"analysis_summary": {"total_credentials_found": 0}, "credentials": []}"#),
    ]));

    let outcome = orchestrator(adapter, settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::CourseByCourse))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Completed);
    let result = outcome.result.expect("result");
    assert_eq!(result.evaluation_type, EvaluationType::CourseByCourse);
    assert!(result.credentials.is_empty());
}

/// Fixture catalog whose institution id lookups fail.
struct BrokenInstitutionLookup {
    inner: InMemoryCatalogRepository,
}

#[async_trait]
impl CatalogRepository for BrokenInstitutionLookup {
    async fn list_countries(&self) -> Result<Vec<Country>, RepositoryError> {
        self.inner.list_countries().await
    }
    async fn find_country(&self, country_name: &str) -> Result<Option<Country>, RepositoryError> {
        self.inner.find_country(country_name).await
    }
    async fn institutions_in(&self, country_name: &str) -> Result<Vec<Institution>, RepositoryError> {
        self.inner.institutions_in(country_name).await
    }
    async fn foreign_credentials_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ForeignCredential>, RepositoryError> {
        self.inner.foreign_credentials_in(country_name).await
    }
    async fn program_lengths_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ProgramLength>, RepositoryError> {
        self.inner.program_lengths_in(country_name).await
    }
    async fn grade_scales_in(&self, country_name: &str) -> Result<Vec<GradeScale>, RepositoryError> {
        self.inner.grade_scales_in(country_name).await
    }
    async fn us_equivalencies(&self) -> Result<Vec<UsEquivalency>, RepositoryError> {
        self.inner.us_equivalencies().await
    }
    async fn institution_by_id(&self, _id: &CatalogId) -> Result<Option<Institution>, RepositoryError> {
        Err(RepositoryError::Decode("disk gone".to_string()))
    }
    async fn foreign_credential_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ForeignCredential>, RepositoryError> {
        self.inner.foreign_credential_by_id(id).await
    }
    async fn program_length_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ProgramLength>, RepositoryError> {
        self.inner.program_length_by_id(id).await
    }
    async fn grade_scale_by_id(&self, id: &CatalogId) -> Result<Option<GradeScale>, RepositoryError> {
        self.inner.grade_scale_by_id(id).await
    }
    async fn us_equivalency_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<UsEquivalency>, RepositoryError> {
        self.inner.us_equivalency_by_id(id).await
    }
    async fn statistics(&self) -> Result<CatalogStatistics, RepositoryError> {
        self.inner.statistics().await
    }
    async fn integrity_report(&self) -> Result<IntegrityReport, RepositoryError> {
        self.inner.integrity_report().await
    }
}

#[tokio::test]
async fn catalog_failure_while_resolving_ends_without_a_final_answer() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_calls(vec![
            call("c1", "search_countries", json!({"query": "Korea"})),
            call(
                "c2",
                "find_institutions",
                json!({"country_name": "Republic of Korea", "query": "Seoul National"}),
            ),
        ]),
        final_answer(KOREA_ANSWER),
    ]));
    let catalog = Arc::new(BrokenInstitutionLookup { inner: FixtureCatalog::in_memory() });
    let orchestrator = ConversationOrchestrator::new(adapter.clone(), catalog, settings())
        .expect("scripted adapter is manual");

    let outcome = orchestrator
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Failed);
    assert!(matches!(
        &outcome.failure,
        Some(FailureReason::Catalog { message }) if message.contains("disk gone")
    ));
    assert!(outcome.result.is_none());
    assert!(!outcome.conversation.is_closed());
    assert!(outcome.conversation.final_answer().is_none());
    match outcome.conversation.turns().last() {
        Some(Turn::ModelRejectedAnswer(answer)) => {
            assert!(answer.rejection.as_deref().is_some_and(|reason| reason.contains("disk gone")));
        }
        other => panic!("expected a rejected answer, got {other:?}"),
    }
    outcome.conversation.validate_sequence().expect("turn order holds");
    assert_eq!(outcome.conversation.model_turns(), 2);
    assert_eq!(adapter.calls().len(), 2, "catalog failures are not reprompted");
}

#[tokio::test]
async fn turn_budget_stops_a_model_that_never_answers() {
    let looping = ProviderReply::tool_calls(
        vec![call("loop", "search_countries", json!({"query": "Korea"}))],
        UsageMetadata::new(100, 10),
    );
    let adapter = Arc::new(ScriptedAdapter::new(Vec::new()).repeating(looping));

    let outcome = orchestrator(adapter.clone(), OrchestratorSettings { max_turns: 3, ..settings() })
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::TimedOut);
    assert_eq!(outcome.failure, Some(FailureReason::TurnBudgetExhausted { max_turns: 3 }));
    assert_eq!(outcome.conversation.model_turns(), 3);
    assert_eq!(adapter.calls().len(), 3);
    assert_eq!(outcome.usage.total_tokens(), 330);
}

#[tokio::test]
async fn retryable_provider_errors_are_retried() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Err(ProviderError::new(ProviderErrorKind::RateLimited, "slow down")),
        Err(ProviderError::new(ProviderErrorKind::Transport, "connection reset")),
        final_answer(r#"{"analysis_summary": {}, "credentials": []}"#),
    ]));

    let outcome = orchestrator(adapter.clone(), settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Completed);
    assert_eq!(adapter.calls().len(), 3);
    assert_eq!(outcome.conversation.model_turns(), 1);
}

#[tokio::test]
async fn exhausted_retries_and_fatal_errors_fail_the_analysis() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        Err(ProviderError::new(ProviderErrorKind::Server, "overloaded")),
        Err(ProviderError::new(ProviderErrorKind::Server, "overloaded")),
        Err(ProviderError::new(ProviderErrorKind::Server, "overloaded")),
    ]));
    let outcome = orchestrator(adapter.clone(), settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");
    assert_eq!(outcome.status, ConversationPhase::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::Provider { kind: ProviderErrorKind::Server, attempts: 3, .. })
    ));

    let adapter = Arc::new(ScriptedAdapter::new(vec![Err(ProviderError::new(
        ProviderErrorKind::Authentication,
        "bad key",
    )
    .with_retryable(false))]));
    let outcome = orchestrator(adapter.clone(), settings())
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::Provider { kind: ProviderErrorKind::Authentication, attempts: 1, .. })
    ));
    assert_eq!(adapter.calls().len(), 1);
}

#[tokio::test]
async fn wall_clock_deadline_times_out_with_partial_conversation() {
    let adapter = Arc::new(
        ScriptedAdapter::new(vec![final_answer(r#"{"analysis_summary": {}, "credentials": []}"#)])
            .with_delay(Duration::from_millis(500)),
    );

    let outcome = orchestrator(
        adapter,
        OrchestratorSettings { deadline: Duration::from_millis(50), ..settings() },
    )
    .analyze(AnalysisRequest::new(document(), EvaluationType::General))
    .await
    .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::TimedOut);
    assert!(matches!(outcome.failure, Some(FailureReason::DeadlineExceeded { .. })));
    assert!(outcome.result.is_none());
    assert_eq!(outcome.conversation.turns().len(), 1);
}

#[tokio::test]
async fn sequential_tool_execution_preserves_request_order() {
    let adapter = Arc::new(ScriptedAdapter::new(vec![
        tool_calls(vec![
            call("b", "get_grade_scales", json!({"country_name": "Republic of Korea"})),
            call("a", "get_program_lengths", json!({"country_name": "Republic of Korea"})),
            call("z", "lookup_everything", json!({})),
        ]),
        final_answer(r#"{"analysis_summary": {}, "credentials": []}"#),
    ]));

    let outcome = orchestrator(adapter.clone(), OrchestratorSettings { parallel_tools: false, ..settings() })
        .analyze(AnalysisRequest::new(document(), EvaluationType::General))
        .await
        .expect("analysis runs");

    assert_eq!(outcome.status, ConversationPhase::Completed);
    match &adapter.calls()[1] {
        ScriptedCall::Continue { records } => {
            let ids = records.iter().map(ToolExecutionRecord::call_id).collect::<Vec<_>>();
            assert_eq!(ids, vec!["b", "a", "z"]);
            assert!(!records[2].is_success());
            assert_eq!(records[2].model_payload()["error_kind"], "unknown_tool");
        }
        other => panic!("unexpected second call {other:?}"),
    }
}

#[tokio::test]
async fn invalid_documents_are_rejected_before_any_provider_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Vec::new()));
    let orchestrator = orchestrator(adapter.clone(), settings());

    let empty = orchestrator
        .analyze(AnalysisRequest::new(DocumentInput::pdf("blank.pdf", Vec::new()), EvaluationType::General))
        .await
        .expect_err("empty document");
    assert!(matches!(empty, AnalysisError::EmptyDocument { .. }));

    let text = orchestrator
        .analyze(AnalysisRequest::new(
            DocumentInput::pdf("notes.pdf", b"plain text".to_vec()),
            EvaluationType::General,
        ))
        .await
        .expect_err("not a pdf");
    assert!(matches!(text, AnalysisError::UnsupportedDocument { .. }));
    assert!(adapter.calls().is_empty());
}

struct AutoExecutingAdapter;

#[async_trait]
impl ProviderAdapter for AutoExecutingAdapter {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn model(&self) -> &str {
        "auto-model"
    }

    fn tool_execution(&self) -> ToolExecutionMode {
        ToolExecutionMode::Automatic
    }

    async fn begin(
        &self,
        _session: &mut ProviderSession,
        _document: &DocumentInput,
        _instructions: &str,
        _tools: &[ToolSchema],
    ) -> Result<ProviderReply, ProviderError> {
        Ok(ProviderReply::final_answer("{}", UsageMetadata::default()))
    }

    async fn continue_with_results(
        &self,
        _session: &mut ProviderSession,
        _results: &[ToolExecutionRecord],
    ) -> Result<ProviderReply, ProviderError> {
        Ok(ProviderReply::final_answer("{}", UsageMetadata::default()))
    }

    async fn reprompt(
        &self,
        _session: &mut ProviderSession,
        _correction: &str,
    ) -> Result<ProviderReply, ProviderError> {
        Ok(ProviderReply::final_answer("{}", UsageMetadata::default()))
    }
}

#[test]
fn automatic_tool_execution_is_refused() {
    let error = ConversationOrchestrator::new(
        Arc::new(AutoExecutingAdapter),
        Arc::new(FixtureCatalog::in_memory()),
        settings(),
    )
    .err()
    .expect("automatic mode rejected");
    assert!(matches!(error, AnalysisError::AutomaticToolExecution { .. }));
}
