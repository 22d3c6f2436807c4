use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::catalog::{CatalogId, CatalogTable};
use crate::domain::conversation::EvaluationType;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    High,
    Medium,
    Low,
    #[default]
    NotFound,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::NotFound => "not_found",
        }
    }

    /// Lenient parse of model-supplied tags; unknown values count as `not_found`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => Self::NotFound,
        }
    }
}

/// How a matched field's catalog reference was treated by the result builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    /// The id was produced by a tool execution and resolved against the catalog.
    Resolved,
    /// The model supplied no id.
    NoReference,
    /// The id never appeared in any tool result of this conversation.
    Untraced { claimed_id: CatalogId },
    /// The id was traced but no longer resolves in the catalog.
    Unresolved { claimed_id: CatalogId },
}

/// A document value paired with its catalog match, following the
/// validated-id pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedField {
    pub table: CatalogTable,
    pub extracted_value: String,
    pub validated_id: Option<CatalogId>,
    pub confidence: MatchConfidence,
    pub canonical_value: Option<String>,
    pub canonical_english_value: Option<String>,
    pub resolution: Resolution,
}

impl MatchedField {
    pub fn unmatched(
        table: CatalogTable,
        extracted_value: impl Into<String>,
        confidence: MatchConfidence,
    ) -> Self {
        Self {
            table,
            extracted_value: extracted_value.into(),
            validated_id: None,
            confidence,
            canonical_value: None,
            canonical_english_value: None,
            resolution: Resolution::NoReference,
        }
    }

    pub fn is_validated(&self) -> bool {
        self.validated_id.is_some() && matches!(self.resolution, Resolution::Resolved)
    }

    /// Catalog text when the reference resolved, otherwise the document text.
    pub fn display_value(&self) -> String {
        let canonical = self.canonical_value.as_deref().filter(|_| self.is_validated());
        match (canonical, self.canonical_english_value.as_deref()) {
            (Some(native), Some(english)) => format!("{native} ({english})"),
            (Some(native), None) => native.to_string(),
            (None, _) => self.extracted_value.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendancePeriod {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalInfo {
    pub grades: Option<String>,
    pub honors: Option<String>,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseEntry {
    pub subject: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSection {
    pub section_name: String,
    pub courses: Vec<CourseEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub credential_id: String,
    pub country: MatchedField,
    pub institution: MatchedField,
    pub foreign_credential: MatchedField,
    pub program_length: Option<MatchedField>,
    pub grade_scale: Option<MatchedField>,
    pub us_equivalency: Option<MatchedField>,
    pub program_of_study: Option<String>,
    pub award_date: Option<String>,
    pub attendance_dates: Vec<AttendancePeriod>,
    pub additional_info: Option<AdditionalInfo>,
    pub course_analysis: Vec<CourseSection>,
}

impl CredentialInfo {
    pub fn matched_fields(&self) -> Vec<&MatchedField> {
        let mut fields = vec![&self.country, &self.institution, &self.foreign_credential];
        fields.extend(self.program_length.iter());
        fields.extend(self.grade_scale.iter());
        fields.extend(self.us_equivalency.iter());
        fields
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_credentials_found: u32,
    pub document_type: Option<String>,
    pub analysis_confidence: MatchConfidence,
}

/// Final structured evaluation of one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub evaluation_type: EvaluationType,
    pub summary: AnalysisSummary,
    pub credentials: Vec<CredentialInfo>,
    pub extraction_notes: Vec<String>,
    pub case_metadata: BTreeMap<String, Value>,
}

impl AnalysisResult {
    pub fn validated_field_count(&self) -> usize {
        self.credentials
            .iter()
            .flat_map(CredentialInfo::matched_fields)
            .filter(|field| field.is_validated())
            .count()
    }
}
