use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference into the reference catalog.
///
/// Country rows are keyed by their natural name; every other table uses a
/// generated unique identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(pub String);

impl CatalogId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CatalogId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogTable {
    Country,
    Institution,
    ForeignCredential,
    ProgramLength,
    GradeScale,
    UsEquivalency,
    Notes,
}

impl CatalogTable {
    pub const ALL: [CatalogTable; 7] = [
        Self::Country,
        Self::Institution,
        Self::ForeignCredential,
        Self::ProgramLength,
        Self::GradeScale,
        Self::UsEquivalency,
        Self::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::Institution => "institution",
            Self::ForeignCredential => "foreign_credential",
            Self::ProgramLength => "program_length",
            Self::GradeScale => "grade_scale",
            Self::UsEquivalency => "us_equivalency",
            Self::Notes => "notes",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub country_name: String,
}

impl Country {
    pub fn id(&self) -> CatalogId {
        CatalogId(self.country_name.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Institution {
    pub id: CatalogId,
    pub country_name: String,
    pub institution_name: Option<String>,
    pub institution_english_name: Option<String>,
    pub institution_history: Option<String>,
    pub accreditation_status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignCredential {
    pub id: CatalogId,
    pub country_name: String,
    pub foreign_credential: Option<String>,
    pub english_credential: Option<String>,
    pub additional_info: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramLength {
    pub id: CatalogId,
    pub country_name: String,
    pub program_length: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeScale {
    pub id: CatalogId,
    pub country_name: String,
    pub grade_scale: Option<String>,
    pub bifurcation_setup: Option<String>,
    pub grade_notes: Option<String>,
    pub conversion_factor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsEquivalency {
    pub id: CatalogId,
    pub overall_equivalency: Option<String>,
    pub equivalency_description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogNote {
    pub id: CatalogId,
    pub note_content: Option<String>,
}

/// A single catalog row resolved by id, used when replacing model-asserted
/// text with the canonical catalog value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum CatalogEntry {
    Country(Country),
    Institution(Institution),
    ForeignCredential(ForeignCredential),
    ProgramLength(ProgramLength),
    GradeScale(GradeScale),
    UsEquivalency(UsEquivalency),
}

impl CatalogEntry {
    pub fn table(&self) -> CatalogTable {
        match self {
            Self::Country(_) => CatalogTable::Country,
            Self::Institution(_) => CatalogTable::Institution,
            Self::ForeignCredential(_) => CatalogTable::ForeignCredential,
            Self::ProgramLength(_) => CatalogTable::ProgramLength,
            Self::GradeScale(_) => CatalogTable::GradeScale,
            Self::UsEquivalency(_) => CatalogTable::UsEquivalency,
        }
    }

    /// Country scope of the row, when the table is country-scoped.
    pub fn country_name(&self) -> Option<&str> {
        match self {
            Self::Country(country) => Some(&country.country_name),
            Self::Institution(row) => Some(&row.country_name),
            Self::ForeignCredential(row) => Some(&row.country_name),
            Self::ProgramLength(row) => Some(&row.country_name),
            Self::GradeScale(row) => Some(&row.country_name),
            Self::UsEquivalency(_) => None,
        }
    }

    /// Canonical display text of the row in its native language.
    pub fn canonical_name(&self) -> Option<String> {
        let name = match self {
            Self::Country(country) => Some(country.country_name.clone()),
            Self::Institution(row) => {
                row.institution_name.clone().or_else(|| row.institution_english_name.clone())
            }
            Self::ForeignCredential(row) => {
                row.foreign_credential.clone().or_else(|| row.english_credential.clone())
            }
            Self::ProgramLength(row) => row.program_length.clone(),
            Self::GradeScale(row) => row.grade_scale.clone(),
            Self::UsEquivalency(row) => row.overall_equivalency.clone(),
        };
        name.filter(|value| !value.trim().is_empty())
    }

    /// English rendering, when the catalog stores one distinct from the
    /// canonical name.
    pub fn english_name(&self) -> Option<String> {
        let (native, english) = match self {
            Self::Institution(row) => (&row.institution_name, &row.institution_english_name),
            Self::ForeignCredential(row) => (&row.foreign_credential, &row.english_credential),
            _ => return None,
        };
        match (native, english) {
            (Some(native), Some(english)) if native.trim() != english.trim() => {
                Some(english.clone()).filter(|value| !value.trim().is_empty())
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStatistics {
    pub row_counts: BTreeMap<String, i64>,
}

impl CatalogStatistics {
    pub fn count(&self, table: CatalogTable) -> i64 {
        self.row_counts.get(table.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.row_counts.values().sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{CatalogEntry, CatalogId, Institution};

    fn institution(native: Option<&str>, english: Option<&str>) -> CatalogEntry {
        CatalogEntry::Institution(Institution {
            id: CatalogId::from("inst-1"),
            country_name: "Republic of Korea".to_string(),
            institution_name: native.map(str::to_string),
            institution_english_name: english.map(str::to_string),
            institution_history: None,
            accreditation_status: None,
        })
    }

    #[test]
    fn english_name_only_reported_when_distinct() {
        let distinct = institution(Some("서울대학교"), Some("Seoul National University"));
        assert_eq!(distinct.english_name().as_deref(), Some("Seoul National University"));

        let same = institution(Some("Seoul National University"), Some("Seoul National University"));
        assert_eq!(same.english_name(), None);
    }

    #[test]
    fn canonical_name_falls_back_to_english() {
        let entry = institution(None, Some("Seoul National University"));
        assert_eq!(entry.canonical_name().as_deref(), Some("Seoul National University"));
        assert_eq!(entry.country_name(), Some("Republic of Korea"));
    }
}
