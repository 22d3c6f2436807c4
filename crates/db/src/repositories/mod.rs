use async_trait::async_trait;
use thiserror::Error;

use credeval_core::domain::catalog::{
    CatalogEntry, CatalogId, CatalogStatistics, CatalogTable, Country, ForeignCredential,
    GradeScale, Institution, IntegrityReport, ProgramLength, UsEquivalency,
};

pub mod catalog;
pub mod memory;

pub use catalog::SqlCatalogRepository;
pub use memory::{CatalogSnapshot, InMemoryCatalogRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Read access to the reference catalog.
///
/// Country-scoped lookups compare the country name case-insensitively and
/// return an empty list for unknown countries.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn list_countries(&self) -> Result<Vec<Country>, RepositoryError>;
    async fn find_country(&self, country_name: &str) -> Result<Option<Country>, RepositoryError>;

    async fn institutions_in(&self, country_name: &str)
        -> Result<Vec<Institution>, RepositoryError>;
    async fn foreign_credentials_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ForeignCredential>, RepositoryError>;
    async fn program_lengths_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ProgramLength>, RepositoryError>;
    async fn grade_scales_in(&self, country_name: &str) -> Result<Vec<GradeScale>, RepositoryError>;
    async fn us_equivalencies(&self) -> Result<Vec<UsEquivalency>, RepositoryError>;

    async fn institution_by_id(&self, id: &CatalogId)
        -> Result<Option<Institution>, RepositoryError>;
    async fn foreign_credential_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ForeignCredential>, RepositoryError>;
    async fn program_length_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ProgramLength>, RepositoryError>;
    async fn grade_scale_by_id(&self, id: &CatalogId)
        -> Result<Option<GradeScale>, RepositoryError>;
    async fn us_equivalency_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<UsEquivalency>, RepositoryError>;

    async fn statistics(&self) -> Result<CatalogStatistics, RepositoryError>;
    async fn integrity_report(&self) -> Result<IntegrityReport, RepositoryError>;

    /// Looks `id` up in `table`. Notes are not resolvable.
    async fn resolve(
        &self,
        table: CatalogTable,
        id: &CatalogId,
    ) -> Result<Option<CatalogEntry>, RepositoryError> {
        let entry = match table {
            CatalogTable::Country => {
                self.find_country(id.as_str()).await?.map(CatalogEntry::Country)
            }
            CatalogTable::Institution => {
                self.institution_by_id(id).await?.map(CatalogEntry::Institution)
            }
            CatalogTable::ForeignCredential => {
                self.foreign_credential_by_id(id).await?.map(CatalogEntry::ForeignCredential)
            }
            CatalogTable::ProgramLength => {
                self.program_length_by_id(id).await?.map(CatalogEntry::ProgramLength)
            }
            CatalogTable::GradeScale => {
                self.grade_scale_by_id(id).await?.map(CatalogEntry::GradeScale)
            }
            CatalogTable::UsEquivalency => {
                self.us_equivalency_by_id(id).await?.map(CatalogEntry::UsEquivalency)
            }
            CatalogTable::Notes => None,
        };
        Ok(entry)
    }
}

pub(crate) fn same_country(left: &str, right: &str) -> bool {
    left.trim().eq_ignore_ascii_case(right.trim())
}
