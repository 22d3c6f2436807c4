use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::commands::{load_config, runtime, CommandFailure, CommandResult};
use credeval_agent::llm::{DocumentInput, ProviderAdapter};
use credeval_agent::providers::build_adapter;
use credeval_agent::runtime::{
    AnalysisOutcome, AnalysisRequest, ConversationOrchestrator, FailureReason,
    OrchestratorSettings, TracingAuditSink,
};
use credeval_core::config::{AppConfig, ConfigOverrides, LlmProvider, LoadOptions};
use credeval_core::domain::conversation::EvaluationType;
use credeval_core::flows::ConversationPhase;
use credeval_db::{connect_read_only, DbPool, SqlCatalogRepository};

const COMMAND: &str = "analyze";

#[derive(Clone, Debug)]
pub struct AnalyzeArgs {
    pub document: PathBuf,
    pub evaluation_type: EvaluationType,
    pub output_dir: PathBuf,
    pub provider: Option<LlmProvider>,
}

#[derive(Debug, Serialize)]
struct AnalyzeDetails {
    analysis_id: String,
    status: ConversationPhase,
    failure: Option<FailureReason>,
    credentials: usize,
    validated_fields: usize,
    model_turns: u32,
    tool_calls: usize,
    total_tokens: u64,
    elapsed_ms: u64,
    files: Vec<String>,
}

pub fn run(args: AnalyzeArgs) -> CommandResult {
    let overrides = ConfigOverrides { llm_provider: args.provider, ..ConfigOverrides::default() };
    let config = match load_config(COMMAND, LoadOptions { overrides, ..LoadOptions::default() }) {
        Ok(config) => config,
        Err(result) => return result,
    };
    if let Err(error) = config.llm.require_api_key() {
        return CommandResult::failure(
            COMMAND,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        );
    }
    let adapter = match build_adapter(&config.llm) {
        Ok(adapter) => adapter,
        Err(error) => {
            return CommandResult::failure(COMMAND, "provider_config", error.to_string(), 2);
        }
    };

    run_with_adapter(&config, &args, adapter)
}

/// Runs the analysis with an already-built adapter. A directory argument
/// analyzes every `*.pdf` inside it concurrently.
pub fn run_with_adapter(
    config: &AppConfig,
    args: &AnalyzeArgs,
    adapter: Arc<dyn ProviderAdapter>,
) -> CommandResult {
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    if args.document.is_dir() {
        return match runtime.block_on(execute_batch(config, args, adapter)) {
            Ok(batch) => batch.into_result(),
            Err(failure) => CommandResult::from_failure(COMMAND, failure),
        };
    }

    match runtime.block_on(execute(config, args, adapter)) {
        Ok(details) => {
            let message = format!(
                "analysis {} {}: {} credential(s), {} validated field(s)",
                details.analysis_id,
                details.status.as_str(),
                details.credentials,
                details.validated_fields
            );
            match details.status {
                ConversationPhase::Completed => {
                    CommandResult::success_with_details(COMMAND, message, details)
                }
                ConversationPhase::TimedOut => {
                    CommandResult::failure_with_details(COMMAND, "analysis_timed_out", message, details, 7)
                }
                _ => CommandResult::failure_with_details(COMMAND, "analysis_failed", message, details, 6),
            }
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}

#[derive(Debug, Serialize)]
struct DocumentReport {
    document: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalyzeDetails>,
}

#[derive(Debug, Default, Serialize)]
struct BatchDetails {
    completed: usize,
    failed: usize,
    timed_out: usize,
    documents: Vec<DocumentReport>,
}

impl BatchDetails {
    fn record(&mut self, document: &Path, analyzed: Result<AnalyzeDetails, CommandFailure>) {
        let document = document.display().to_string();
        let report = match analyzed {
            Ok(details) => {
                match details.status {
                    ConversationPhase::Completed => self.completed += 1,
                    ConversationPhase::TimedOut => self.timed_out += 1,
                    _ => self.failed += 1,
                }
                DocumentReport {
                    document,
                    status: details.status.as_str(),
                    error: None,
                    analysis: Some(details),
                }
            }
            Err((error_class, message, _)) => {
                self.failed += 1;
                DocumentReport {
                    document,
                    status: "error",
                    error: Some(format!("{error_class}: {message}")),
                    analysis: None,
                }
            }
        };
        self.documents.push(report);
    }

    fn into_result(self) -> CommandResult {
        let message = format!(
            "analyzed {} document(s): {} completed, {} failed, {} timed out",
            self.documents.len(),
            self.completed,
            self.failed,
            self.timed_out
        );
        if self.failed > 0 {
            CommandResult::failure_with_details(COMMAND, "analysis_failed", message, self, 6)
        } else if self.timed_out > 0 {
            CommandResult::failure_with_details(COMMAND, "analysis_timed_out", message, self, 7)
        } else {
            CommandResult::success_with_details(COMMAND, message, self)
        }
    }
}

async fn execute(
    config: &AppConfig,
    args: &AnalyzeArgs,
    adapter: Arc<dyn ProviderAdapter>,
) -> Result<AnalyzeDetails, CommandFailure> {
    let (orchestrator, pool) = open_orchestrator(config, adapter).await?;
    let details = analyze_document(&orchestrator, &args.document, args).await;
    pool.close().await;
    details
}

async fn execute_batch(
    config: &AppConfig,
    args: &AnalyzeArgs,
    adapter: Arc<dyn ProviderAdapter>,
) -> Result<BatchDetails, CommandFailure> {
    let documents = pdf_documents(&args.document)
        .map_err(|error| ("analysis_input", format!("{error:#}"), 6u8))?;
    if documents.is_empty() {
        return Err((
            "analysis_input",
            format!("no PDF documents found in `{}`", args.document.display()),
            6u8,
        ));
    }

    let (orchestrator, pool) = open_orchestrator(config, adapter).await?;
    info!(
        event_name = "cli.analyze.batch_started",
        documents = documents.len(),
        "analyzing documents concurrently"
    );
    let analyzed = join_all(
        documents.iter().map(|document| analyze_document(&orchestrator, document, args)),
    )
    .await;
    pool.close().await;

    let mut batch = BatchDetails::default();
    for (document, outcome) in documents.iter().zip(analyzed) {
        batch.record(document, outcome);
    }
    info!(
        event_name = "cli.analyze.batch_finished",
        completed = batch.completed,
        failed = batch.failed,
        timed_out = batch.timed_out,
        "batch analysis finished"
    );
    Ok(batch)
}

/// Lists `*.pdf` files directly inside `dir`, sorted by path.
fn pdf_documents(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading directory `{}`", dir.display()))?;
    let mut documents = Vec::new();
    for entry in entries {
        let path = entry.with_context(|| format!("reading directory `{}`", dir.display()))?.path();
        let is_pdf = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            documents.push(path);
        }
    }
    documents.sort();
    Ok(documents)
}

async fn open_orchestrator(
    config: &AppConfig,
    adapter: Arc<dyn ProviderAdapter>,
) -> Result<(ConversationOrchestrator, DbPool), CommandFailure> {
    let pool = connect_read_only(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    let catalog = Arc::new(SqlCatalogRepository::new(pool.clone()));

    let settings = OrchestratorSettings::from_config(&config.orchestrator, config.llm.max_retries);
    let orchestrator = match ConversationOrchestrator::new(adapter, catalog, settings) {
        Ok(orchestrator) => orchestrator.with_audit_sink(Arc::new(TracingAuditSink)),
        Err(error) => {
            pool.close().await;
            return Err(("provider_config", error.to_string(), 2u8));
        }
    };
    Ok((orchestrator, pool))
}

/// Analyzes one document and writes its outputs into `args.output_dir`.
async fn analyze_document(
    orchestrator: &ConversationOrchestrator,
    document: &Path,
    args: &AnalyzeArgs,
) -> Result<AnalyzeDetails, CommandFailure> {
    let bytes = fs::read(document).map_err(|error| {
        ("analysis_input", format!("could not read `{}`: {error}", document.display()), 6u8)
    })?;
    let label =
        document.file_name().and_then(|name| name.to_str()).unwrap_or("document.pdf").to_string();

    let request = AnalysisRequest::new(DocumentInput::pdf(label, bytes), args.evaluation_type);
    let outcome = orchestrator
        .analyze(request)
        .await
        .map_err(|error| ("analysis_input", error.to_string(), 6u8))?;

    let stem = document.file_stem().and_then(|stem| stem.to_str()).unwrap_or("document");
    let files = write_outputs(&args.output_dir, stem, &outcome)
        .map_err(|error| ("output_write", format!("{error:#}"), 3u8))?;
    info!(
        event_name = "cli.analyze.outputs_written",
        correlation_id = %outcome.analysis_id,
        files = files.len(),
        "analysis outputs written"
    );

    Ok(AnalyzeDetails {
        analysis_id: outcome.analysis_id.to_string(),
        status: outcome.status,
        failure: outcome.failure.clone(),
        credentials: outcome.result.as_ref().map_or(0, |result| result.credentials.len()),
        validated_fields: outcome.result.as_ref().map_or(0, |result| result.validated_field_count()),
        model_turns: outcome.conversation.model_turns(),
        tool_calls: outcome.tool_calls,
        total_tokens: outcome.usage.total_tokens(),
        elapsed_ms: outcome.elapsed_ms,
        files: files.iter().map(|path| path.display().to_string()).collect(),
    })
}

/// Writes `<stem>_audit.json` always and `<stem>_analysis.json` when a result exists.
fn write_outputs(
    output_dir: &Path,
    stem: &str,
    outcome: &AnalysisOutcome,
) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory `{}`", output_dir.display()))?;
    let mut written = Vec::new();

    if let Some(result) = &outcome.result {
        let path = output_dir.join(format!("{stem}_analysis.json"));
        let json = serde_json::to_string_pretty(result).context("serializing analysis result")?;
        fs::write(&path, json).with_context(|| format!("writing `{}`", path.display()))?;
        written.push(path);
    }

    let path = output_dir.join(format!("{stem}_audit.json"));
    let json = serde_json::to_string_pretty(outcome).context("serializing audit trail")?;
    fs::write(&path, json).with_context(|| format!("writing `{}`", path.display()))?;
    written.push(path);

    Ok(written)
}
