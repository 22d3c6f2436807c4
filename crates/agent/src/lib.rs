//! Credential evaluation agent.
//!
//! Drives a document through a bounded conversation with an LLM provider:
//! the model proposes catalog lookups, the orchestrator executes them
//! locally, and the model's final answer is parsed and checked against the
//! catalog before it becomes an [`AnalysisResult`](credeval_core::AnalysisResult).
//!
//! # Modules
//!
//! - `runtime` - [`ConversationOrchestrator`] and the analysis loop
//! - `llm` - provider adapter trait, replies and errors
//! - `providers` - Anthropic, Gemini and scripted adapters
//! - `tools` - the six read-only catalog tools
//! - `guardrails` - provenance of catalog ids seen in tool results
//! - `result` - final answer extraction and id resolution
//! - `prompts` - system instructions and corrective prompts
//!
//! The model never writes catalog ids on its own authority: an id counts as
//! validated only when a tool returned it during the same conversation and
//! it still resolves in the catalog.

pub mod guardrails;
pub mod llm;
pub mod prompts;
pub mod providers;
pub mod result;
pub mod runtime;
pub mod tools;

pub use llm::{DocumentInput, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderReply};
pub use providers::build_adapter;
pub use runtime::{
    AnalysisError, AnalysisOutcome, AnalysisRequest, ConversationOrchestrator, FailureReason,
    OrchestratorSettings, TracingAuditSink,
};
