pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod matching;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::analysis::{
    AnalysisResult, AnalysisSummary, CredentialInfo, MatchConfidence, MatchedField, Resolution,
};
pub use domain::catalog::{CatalogEntry, CatalogId, CatalogTable};
pub use domain::conversation::{
    AnalysisId, ConversationState, EvaluationType, ToolExecutionRecord, ToolInvocationRequest,
    ToolOutcome, Turn, UsageMetadata,
};
pub use errors::DomainError;
pub use flows::{ConversationEvent, ConversationPhase, FlowEngine, ToolCallingFlow};
