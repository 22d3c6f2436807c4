use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use credeval_core::domain::analysis::{
    AdditionalInfo, AnalysisResult, AnalysisSummary, AttendancePeriod, CourseEntry,
    CourseSection, CredentialInfo, MatchConfidence, MatchedField, Resolution,
};
use credeval_core::domain::catalog::{CatalogId, CatalogTable};
use credeval_core::domain::conversation::EvaluationType;
use credeval_db::repositories::{CatalogRepository, RepositoryError};

use crate::guardrails::{IdProvenance, ProvenanceIndex};

pub const REQUIRED_TOP_LEVEL_KEYS: [&str; 2] = ["analysis_summary", "credentials"];

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("malformed result: missing {missing:?}{}", detail_suffix(.detail))]
    MalformedResult { missing: Vec<String>, detail: Option<String> },
    #[error("catalog lookup failed while resolving result: {0}")]
    Catalog(#[from] RepositoryError),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_ref().map(|detail| format!(" ({detail})")).unwrap_or_default()
}

impl ResultError {
    fn malformed(missing: Vec<String>, detail: Option<String>) -> Self {
        Self::MalformedResult { missing, detail }
    }
}

/// Pulls the JSON object out of a model answer: the first fenced json block
/// that parses, otherwise the first balanced `{...}` that parses.
pub fn extract_json(text: &str) -> Option<Value> {
    fenced_blocks(text)
        .into_iter()
        .chain(balanced_objects(text))
        .find_map(|candidate| serde_json::from_str::<Value>(candidate.trim()).ok())
        .filter(Value::is_object)
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let body_start = after_fence.find('\n').map(|index| index + 1).unwrap_or(0);
        let language = after_fence[..body_start].trim();
        let body = &after_fence[body_start..];
        let Some(end) = body.find("```") else {
            break;
        };
        if language.is_empty() || language.eq_ignore_ascii_case("json") {
            blocks.push(&body[..end]);
        }
        rest = &body[end + 3..];
    }
    blocks
}

fn balanced_objects(text: &str) -> Vec<&str> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        objects.push(&text[begin..=index]);
                    }
                }
            }
            _ => {}
        }
    }
    objects
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawField {
    Text(String),
    Detailed(RawFieldObject),
}

#[derive(Debug, Default, Deserialize)]
struct RawFieldObject {
    #[serde(
        default,
        alias = "extracted_name",
        alias = "extracted_type",
        alias = "extracted_length",
        alias = "extracted_scale",
        alias = "equivalency_statement"
    )]
    extracted_value: Option<String>,
    #[serde(default)]
    validated_id: Option<Value>,
    #[serde(default, alias = "match_confidence")]
    confidence: Option<String>,
}

impl RawField {
    fn into_parts(self) -> RawFieldObject {
        match self {
            Self::Text(text) => RawFieldObject { extracted_value: Some(text), ..RawFieldObject::default() },
            Self::Detailed(object) => object,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAttendance {
    Text(String),
    Periods { periods: Vec<AttendancePeriod> },
    List(Vec<AttendancePeriod>),
    Single(AttendancePeriod),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCourse {
    Subject(String),
    Entry(CourseEntry),
}

#[derive(Debug, Deserialize)]
struct RawSection {
    #[serde(alias = "name", alias = "section")]
    section_name: String,
    #[serde(default)]
    courses: Vec<RawCourse>,
}

#[derive(Debug, Deserialize)]
struct RawCredential {
    #[serde(default)]
    credential_id: Option<String>,
    #[serde(default)]
    country: Option<RawField>,
    #[serde(default)]
    institution: Option<RawField>,
    #[serde(default)]
    foreign_credential: Option<RawField>,
    #[serde(default)]
    program_length: Option<RawField>,
    #[serde(default)]
    grade_scale: Option<RawField>,
    #[serde(default)]
    us_equivalency: Option<RawField>,
    #[serde(default)]
    program_of_study: Option<String>,
    #[serde(default)]
    award_date: Option<String>,
    #[serde(default)]
    attendance_dates: Option<RawAttendance>,
    #[serde(default)]
    additional_info: Option<AdditionalInfo>,
    #[serde(default)]
    course_analysis: Vec<RawSection>,
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    #[serde(default)]
    total_credentials_found: Option<u32>,
    #[serde(default)]
    document_type: Option<String>,
    #[serde(default)]
    analysis_confidence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    analysis_summary: RawSummary,
    credentials: Vec<RawCredential>,
    #[serde(default)]
    extraction_notes: Vec<String>,
    #[serde(default)]
    case_metadata: BTreeMap<String, Value>,
}

/// Turns a final answer into an [`AnalysisResult`], re-resolving every
/// claimed catalog id.
#[derive(Clone)]
pub struct ResultBuilder {
    catalog: Arc<dyn CatalogRepository>,
}

impl ResultBuilder {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { catalog }
    }

    pub async fn build(
        &self,
        answer: &str,
        evaluation_type: EvaluationType,
        provenance: &ProvenanceIndex,
    ) -> Result<AnalysisResult, ResultError> {
        let raw = parse_answer(answer)?;

        let mut credentials = Vec::with_capacity(raw.credentials.len());
        for (position, credential) in raw.credentials.into_iter().enumerate() {
            credentials.push(self.credential(position, credential, provenance).await?);
        }

        let summary = AnalysisSummary {
            total_credentials_found: raw
                .analysis_summary
                .total_credentials_found
                .unwrap_or(credentials.len() as u32),
            document_type: raw.analysis_summary.document_type,
            analysis_confidence: raw
                .analysis_summary
                .analysis_confidence
                .as_deref()
                .map(MatchConfidence::parse_lenient)
                .unwrap_or_default(),
        };

        Ok(AnalysisResult {
            evaluation_type,
            summary,
            credentials,
            extraction_notes: raw.extraction_notes,
            case_metadata: raw.case_metadata,
        })
    }

    async fn credential(
        &self,
        position: usize,
        raw: RawCredential,
        provenance: &ProvenanceIndex,
    ) -> Result<CredentialInfo, ResultError> {
        let country = self.field(CatalogTable::Country, raw.country, provenance).await?;
        let institution = self.field(CatalogTable::Institution, raw.institution, provenance).await?;
        let foreign_credential =
            self.field(CatalogTable::ForeignCredential, raw.foreign_credential, provenance).await?;
        let program_length = match raw.program_length {
            Some(field) => Some(self.field(CatalogTable::ProgramLength, Some(field), provenance).await?),
            None => None,
        };
        let grade_scale = match raw.grade_scale {
            Some(field) => Some(self.field(CatalogTable::GradeScale, Some(field), provenance).await?),
            None => None,
        };
        let us_equivalency = match raw.us_equivalency {
            Some(field) => Some(self.field(CatalogTable::UsEquivalency, Some(field), provenance).await?),
            None => None,
        };

        Ok(CredentialInfo {
            credential_id: raw
                .credential_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("credential_{}", position + 1)),
            country,
            institution,
            foreign_credential,
            program_length,
            grade_scale,
            us_equivalency,
            program_of_study: raw.program_of_study,
            award_date: raw.award_date,
            attendance_dates: raw.attendance_dates.map(attendance_periods).unwrap_or_default(),
            additional_info: raw.additional_info,
            course_analysis: raw
                .course_analysis
                .into_iter()
                .map(|section| CourseSection {
                    section_name: section.section_name,
                    courses: section
                        .courses
                        .into_iter()
                        .map(|course| match course {
                            RawCourse::Subject(subject) => CourseEntry { subject },
                            RawCourse::Entry(entry) => entry,
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    /// Applies the validated-id gate to one field.
    async fn field(
        &self,
        table: CatalogTable,
        raw: Option<RawField>,
        provenance: &ProvenanceIndex,
    ) -> Result<MatchedField, ResultError> {
        let parts = raw.map(RawField::into_parts).unwrap_or_default();
        let extracted_value = parts.extracted_value.unwrap_or_default();
        let claimed = parts.confidence.as_deref().map(MatchConfidence::parse_lenient).unwrap_or_default();

        let Some(claimed_id) = parts.validated_id.as_ref().and_then(id_text) else {
            // Without a catalog reference the model cannot claim a strong match.
            return Ok(MatchedField::unmatched(table, extracted_value, cap_at_low(claimed)));
        };

        if provenance.check(table, &claimed_id) == IdProvenance::Untraced {
            debug!(
                event_name = "result.untraced_id",
                table = table.as_str(),
                claimed_id = %claimed_id,
                "validated_id was never returned by a tool; ignoring it"
            );
            let mut field = MatchedField::unmatched(table, extracted_value, cap_at_low(claimed));
            field.resolution = Resolution::Untraced { claimed_id };
            return Ok(field);
        }

        let Some(entry) = self.catalog.resolve(table, &claimed_id).await? else {
            let mut field = MatchedField::unmatched(table, extracted_value, cap_at_low(claimed));
            field.resolution = Resolution::Unresolved { claimed_id };
            return Ok(field);
        };

        Ok(MatchedField {
            table,
            extracted_value,
            validated_id: Some(claimed_id),
            confidence: match claimed {
                MatchConfidence::NotFound => MatchConfidence::High,
                other => other,
            },
            canonical_value: entry.canonical_name(),
            canonical_english_value: entry.english_name(),
            resolution: Resolution::Resolved,
        })
    }
}

fn cap_at_low(confidence: MatchConfidence) -> MatchConfidence {
    match confidence {
        MatchConfidence::High | MatchConfidence::Medium => MatchConfidence::Low,
        other => other,
    }
}

fn id_text(value: &Value) -> Option<CatalogId> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then(|| CatalogId(text))
}

fn parse_answer(answer: &str) -> Result<RawAnalysis, ResultError> {
    let Some(value) = extract_json(answer) else {
        return Err(ResultError::malformed(
            REQUIRED_TOP_LEVEL_KEYS.iter().map(|key| key.to_string()).collect(),
            Some("no JSON object found in the answer".to_string()),
        ));
    };

    let missing = REQUIRED_TOP_LEVEL_KEYS
        .iter()
        .filter(|key| value.get(**key).map_or(true, Value::is_null))
        .map(|key| key.to_string())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ResultError::malformed(missing, None));
    }

    serde_json::from_value(value)
        .map_err(|error| ResultError::malformed(Vec::new(), Some(error.to_string())))
}

fn attendance_periods(raw: RawAttendance) -> Vec<AttendancePeriod> {
    match raw {
        RawAttendance::Text(text) => text
            .split([',', ';'])
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(period_from_text)
            .collect(),
        RawAttendance::Periods { periods } | RawAttendance::List(periods) => periods,
        RawAttendance::Single(period) => vec![period],
    }
}

/// `"2004-2007"` or `"2004 to 2007"` become a range; anything else (a single
/// year, a full date) is both start and end.
fn period_from_text(segment: &str) -> AttendancePeriod {
    let range = segment
        .split_once(" to ")
        .or_else(|| segment.split_once('-').filter(|(start, end)| is_year(start) && is_year(end)));
    match range {
        Some((start, end)) => AttendancePeriod {
            start_date: Some(start.trim().to_string()),
            end_date: Some(end.trim().to_string()),
        },
        None => AttendancePeriod {
            start_date: Some(segment.to_string()),
            end_date: Some(segment.to_string()),
        },
    }
}

fn is_year(value: &str) -> bool {
    let value = value.trim();
    value.len() == 4 && value.chars().all(|ch| ch.is_ascii_digit())
}
