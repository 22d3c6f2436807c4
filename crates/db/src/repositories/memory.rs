use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::RwLock;

use credeval_core::domain::catalog::{
    CatalogId, CatalogNote, CatalogStatistics, CatalogTable, Country, ForeignCredential,
    GradeScale, Institution, IntegrityReport, ProgramLength, UsEquivalency,
};

use super::{same_country, CatalogRepository, RepositoryError};

/// Complete catalog contents held in memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub countries: Vec<Country>,
    pub institutions: Vec<Institution>,
    pub foreign_credentials: Vec<ForeignCredential>,
    pub program_lengths: Vec<ProgramLength>,
    pub grade_scales: Vec<GradeScale>,
    pub us_equivalencies: Vec<UsEquivalency>,
    pub notes: Vec<CatalogNote>,
}

#[derive(Default)]
pub struct InMemoryCatalogRepository {
    snapshot: RwLock<CatalogSnapshot>,
}

impl InMemoryCatalogRepository {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self { snapshot: RwLock::new(snapshot) }
    }

    /// Replaces the catalog contents; lets tests simulate catalog drift.
    pub async fn replace(&self, snapshot: CatalogSnapshot) {
        *self.snapshot.write().await = snapshot;
    }
}

fn scoped<T: Clone>(
    rows: &[T],
    country_name: &str,
    country_of: impl Fn(&T) -> &str,
    sort_key: impl Fn(&T) -> (Option<String>, String),
) -> Vec<T> {
    let mut matching = rows
        .iter()
        .filter(|row| same_country(country_of(row), country_name))
        .cloned()
        .collect::<Vec<_>>();
    matching.sort_by_key(|row| sort_key(row));
    matching
}

fn orphan_count<'a>(known: &BTreeSet<&str>, names: impl Iterator<Item = &'a str>) -> usize {
    names.filter(|name| !known.contains(name)).count()
}

#[async_trait::async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn list_countries(&self) -> Result<Vec<Country>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        let mut countries = snapshot.countries.clone();
        countries.sort_by(|left, right| left.country_name.cmp(&right.country_name));
        Ok(countries)
    }

    async fn find_country(&self, country_name: &str) -> Result<Option<Country>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot
            .countries
            .iter()
            .find(|country| same_country(&country.country_name, country_name))
            .cloned())
    }

    async fn institutions_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<Institution>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(scoped(
            &snapshot.institutions,
            country_name,
            |row| row.country_name.as_str(),
            |row| (row.institution_name.clone(), row.id.0.clone()),
        ))
    }

    async fn foreign_credentials_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ForeignCredential>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(scoped(
            &snapshot.foreign_credentials,
            country_name,
            |row| row.country_name.as_str(),
            |row| (row.foreign_credential.clone(), row.id.0.clone()),
        ))
    }

    async fn program_lengths_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ProgramLength>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(scoped(
            &snapshot.program_lengths,
            country_name,
            |row| row.country_name.as_str(),
            |row| (row.program_length.clone(), row.id.0.clone()),
        ))
    }

    async fn grade_scales_in(&self, country_name: &str) -> Result<Vec<GradeScale>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(scoped(
            &snapshot.grade_scales,
            country_name,
            |row| row.country_name.as_str(),
            |row| (row.grade_scale.clone(), row.id.0.clone()),
        ))
    }

    async fn us_equivalencies(&self) -> Result<Vec<UsEquivalency>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        let mut rows = snapshot.us_equivalencies.clone();
        rows.sort_by_key(|row| (row.overall_equivalency.clone(), row.id.0.clone()));
        Ok(rows)
    }

    async fn institution_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<Institution>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.institutions.iter().find(|row| &row.id == id).cloned())
    }

    async fn foreign_credential_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ForeignCredential>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.foreign_credentials.iter().find(|row| &row.id == id).cloned())
    }

    async fn program_length_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ProgramLength>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.program_lengths.iter().find(|row| &row.id == id).cloned())
    }

    async fn grade_scale_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<GradeScale>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.grade_scales.iter().find(|row| &row.id == id).cloned())
    }

    async fn us_equivalency_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<UsEquivalency>, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.us_equivalencies.iter().find(|row| &row.id == id).cloned())
    }

    async fn statistics(&self) -> Result<CatalogStatistics, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        let counts = [
            (CatalogTable::Country, snapshot.countries.len()),
            (CatalogTable::Institution, snapshot.institutions.len()),
            (CatalogTable::ForeignCredential, snapshot.foreign_credentials.len()),
            (CatalogTable::ProgramLength, snapshot.program_lengths.len()),
            (CatalogTable::GradeScale, snapshot.grade_scales.len()),
            (CatalogTable::UsEquivalency, snapshot.us_equivalencies.len()),
            (CatalogTable::Notes, snapshot.notes.len()),
        ];
        let row_counts = counts
            .into_iter()
            .map(|(table, count)| (table.as_str().to_string(), count as i64))
            .collect::<BTreeMap<_, _>>();
        Ok(CatalogStatistics { row_counts })
    }

    async fn integrity_report(&self) -> Result<IntegrityReport, RepositoryError> {
        let snapshot = self.snapshot.read().await;
        let known = snapshot
            .countries
            .iter()
            .map(|country| country.country_name.as_str())
            .collect::<BTreeSet<_>>();

        let checks = [
            (
                orphan_count(&known, snapshot.foreign_credentials.iter().map(|row| row.country_name.as_str())),
                "foreign credentials",
            ),
            (
                orphan_count(&known, snapshot.institutions.iter().map(|row| row.country_name.as_str())),
                "institutions",
            ),
            (
                orphan_count(&known, snapshot.program_lengths.iter().map(|row| row.country_name.as_str())),
                "program lengths",
            ),
            (
                orphan_count(&known, snapshot.grade_scales.iter().map(|row| row.country_name.as_str())),
                "grade scales",
            ),
        ];
        let issues = checks
            .into_iter()
            .filter(|(count, _)| *count > 0)
            .map(|(count, label)| format!("{count} orphaned {label}"))
            .collect();
        Ok(IntegrityReport { issues })
    }
}

#[cfg(test)]
mod tests {
    use credeval_core::domain::catalog::{CatalogId, Country, ProgramLength};

    use super::{CatalogSnapshot, InMemoryCatalogRepository};
    use crate::repositories::CatalogRepository;

    fn snapshot() -> CatalogSnapshot {
        CatalogSnapshot {
            countries: vec![Country { country_name: "Canada".to_string() }],
            program_lengths: vec![
                ProgramLength {
                    id: CatalogId::from("pl-b"),
                    country_name: "Canada".to_string(),
                    program_length: Some("4 years".to_string()),
                },
                ProgramLength {
                    id: CatalogId::from("pl-a"),
                    country_name: "Canada".to_string(),
                    program_length: Some("3 years".to_string()),
                },
                ProgramLength {
                    id: CatalogId::from("pl-orphan"),
                    country_name: "Atlantis".to_string(),
                    program_length: Some("9 years".to_string()),
                },
            ],
            ..CatalogSnapshot::default()
        }
    }

    #[tokio::test]
    async fn scoped_rows_are_sorted_and_filtered() {
        let repo = InMemoryCatalogRepository::new(snapshot());
        let lengths = repo.program_lengths_in("canada").await.expect("lengths");
        let ids = lengths.iter().map(|row| row.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["pl-a", "pl-b"]);
    }

    #[tokio::test]
    async fn integrity_report_counts_orphans() {
        let repo = InMemoryCatalogRepository::new(snapshot());
        let report = repo.integrity_report().await.expect("report");
        assert_eq!(report.issues, vec!["1 orphaned program lengths".to_string()]);
    }

    #[tokio::test]
    async fn replace_swaps_contents() {
        let repo = InMemoryCatalogRepository::new(snapshot());
        repo.replace(CatalogSnapshot::default()).await;
        assert!(repo.list_countries().await.expect("countries").is_empty());
        assert!(repo.program_length_by_id(&CatalogId::from("pl-a")).await.expect("lookup").is_none());
    }
}
