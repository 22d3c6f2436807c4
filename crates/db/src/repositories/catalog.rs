use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use credeval_core::domain::catalog::{
    CatalogId, CatalogStatistics, CatalogTable, Country, ForeignCredential, GradeScale,
    Institution, IntegrityReport, ProgramLength, UsEquivalency,
};

use super::{CatalogRepository, RepositoryError};
use crate::DbPool;

const COUNTRY_SCOPED: [(&str, &str); 4] = [
    ("foreign_credential", "foreign credentials"),
    ("institution", "institutions"),
    ("program_length", "program lengths"),
    ("grade_scale", "grade scales"),
];

pub struct SqlCatalogRepository {
    pool: DbPool,
}

impl SqlCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CatalogRepository for SqlCatalogRepository {
    async fn list_countries(&self) -> Result<Vec<Country>, RepositoryError> {
        let rows = sqlx::query("SELECT country_name FROM country ORDER BY country_name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(country_from_row).collect()
    }

    async fn find_country(&self, country_name: &str) -> Result<Option<Country>, RepositoryError> {
        let row = sqlx::query(
            "SELECT country_name FROM country WHERE country_name = ? COLLATE NOCASE LIMIT 1",
        )
        .bind(country_name.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.map(country_from_row).transpose()
    }

    async fn institutions_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<Institution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                institution_uuid,
                country_name,
                institution_name,
                institution_english_name,
                institution_history,
                accreditation_status
             FROM institution
             WHERE country_name = ? COLLATE NOCASE
             ORDER BY institution_name, institution_uuid",
        )
        .bind(country_name.trim())
        .fetch_all(&self.pool)
        .await?;
        debug!(
            event_name = "catalog.institutions_loaded",
            country_name,
            rows = rows.len(),
            "institutions loaded"
        );
        rows.into_iter().map(institution_from_row).collect()
    }

    async fn foreign_credentials_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ForeignCredential>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                credential_uuid,
                country_name,
                foreign_credential,
                english_credential,
                additional_info
             FROM foreign_credential
             WHERE country_name = ? COLLATE NOCASE
             ORDER BY foreign_credential, credential_uuid",
        )
        .bind(country_name.trim())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(foreign_credential_from_row).collect()
    }

    async fn program_lengths_in(
        &self,
        country_name: &str,
    ) -> Result<Vec<ProgramLength>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT program_length_uuid, country_name, program_length
             FROM program_length
             WHERE country_name = ? COLLATE NOCASE
             ORDER BY program_length, program_length_uuid",
        )
        .bind(country_name.trim())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(program_length_from_row).collect()
    }

    async fn grade_scales_in(&self, country_name: &str) -> Result<Vec<GradeScale>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                grade_scale_uuid,
                country_name,
                grade_scale,
                bifurcation_setup,
                grade_notes,
                conversion_factor
             FROM grade_scale
             WHERE country_name = ? COLLATE NOCASE
             ORDER BY grade_scale, grade_scale_uuid",
        )
        .bind(country_name.trim())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(grade_scale_from_row).collect()
    }

    async fn us_equivalencies(&self) -> Result<Vec<UsEquivalency>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT equivalency_uuid, overall_equivalency, equivalency_description
             FROM us_equivalency
             ORDER BY overall_equivalency, equivalency_uuid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(us_equivalency_from_row).collect()
    }

    async fn institution_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<Institution>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                institution_uuid,
                country_name,
                institution_name,
                institution_english_name,
                institution_history,
                accreditation_status
             FROM institution
             WHERE institution_uuid = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(institution_from_row).transpose()
    }

    async fn foreign_credential_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ForeignCredential>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                credential_uuid,
                country_name,
                foreign_credential,
                english_credential,
                additional_info
             FROM foreign_credential
             WHERE credential_uuid = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(foreign_credential_from_row).transpose()
    }

    async fn program_length_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<ProgramLength>, RepositoryError> {
        let row = sqlx::query(
            "SELECT program_length_uuid, country_name, program_length
             FROM program_length
             WHERE program_length_uuid = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(program_length_from_row).transpose()
    }

    async fn grade_scale_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<GradeScale>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                grade_scale_uuid,
                country_name,
                grade_scale,
                bifurcation_setup,
                grade_notes,
                conversion_factor
             FROM grade_scale
             WHERE grade_scale_uuid = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(grade_scale_from_row).transpose()
    }

    async fn us_equivalency_by_id(
        &self,
        id: &CatalogId,
    ) -> Result<Option<UsEquivalency>, RepositoryError> {
        let row = sqlx::query(
            "SELECT equivalency_uuid, overall_equivalency, equivalency_description
             FROM us_equivalency
             WHERE equivalency_uuid = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(us_equivalency_from_row).transpose()
    }

    async fn statistics(&self) -> Result<CatalogStatistics, RepositoryError> {
        let mut row_counts = BTreeMap::new();
        for table in CatalogTable::ALL {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.as_str()))
                .fetch_one(&self.pool)
                .await?;
            row_counts.insert(table.as_str().to_string(), count);
        }
        Ok(CatalogStatistics { row_counts })
    }

    async fn integrity_report(&self) -> Result<IntegrityReport, RepositoryError> {
        let mut issues = Vec::new();
        for (table, label) in COUNTRY_SCOPED {
            let orphaned: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*)
                 FROM {table} scoped
                 LEFT JOIN country c ON scoped.country_name = c.country_name
                 WHERE c.country_name IS NULL"
            ))
            .fetch_one(&self.pool)
            .await?;
            if orphaned > 0 {
                issues.push(format!("{orphaned} orphaned {label}"));
            }
        }
        Ok(IntegrityReport { issues })
    }
}

fn country_from_row(row: SqliteRow) -> Result<Country, RepositoryError> {
    Ok(Country { country_name: row.try_get("country_name")? })
}

fn institution_from_row(row: SqliteRow) -> Result<Institution, RepositoryError> {
    Ok(Institution {
        id: CatalogId(row.try_get("institution_uuid")?),
        country_name: row.try_get("country_name")?,
        institution_name: row.try_get("institution_name")?,
        institution_english_name: row.try_get("institution_english_name")?,
        institution_history: row.try_get("institution_history")?,
        accreditation_status: row.try_get("accreditation_status")?,
    })
}

fn foreign_credential_from_row(row: SqliteRow) -> Result<ForeignCredential, RepositoryError> {
    Ok(ForeignCredential {
        id: CatalogId(row.try_get("credential_uuid")?),
        country_name: row.try_get("country_name")?,
        foreign_credential: row.try_get("foreign_credential")?,
        english_credential: row.try_get("english_credential")?,
        additional_info: row.try_get("additional_info")?,
    })
}

fn program_length_from_row(row: SqliteRow) -> Result<ProgramLength, RepositoryError> {
    Ok(ProgramLength {
        id: CatalogId(row.try_get("program_length_uuid")?),
        country_name: row.try_get("country_name")?,
        program_length: row.try_get("program_length")?,
    })
}

fn grade_scale_from_row(row: SqliteRow) -> Result<GradeScale, RepositoryError> {
    Ok(GradeScale {
        id: CatalogId(row.try_get("grade_scale_uuid")?),
        country_name: row.try_get("country_name")?,
        grade_scale: row.try_get("grade_scale")?,
        bifurcation_setup: row.try_get("bifurcation_setup")?,
        grade_notes: row.try_get("grade_notes")?,
        conversion_factor: row.try_get("conversion_factor")?,
    })
}

fn us_equivalency_from_row(row: SqliteRow) -> Result<UsEquivalency, RepositoryError> {
    Ok(UsEquivalency {
        id: CatalogId(row.try_get("equivalency_uuid")?),
        overall_equivalency: row.try_get("overall_equivalency")?,
        equivalency_description: row.try_get("equivalency_description")?,
    })
}
