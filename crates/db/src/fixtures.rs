use credeval_core::domain::catalog::{
    CatalogId, CatalogNote, Country, ForeignCredential, GradeScale, Institution, ProgramLength,
    UsEquivalency,
};

use crate::connection::DbPool;
use crate::repositories::{CatalogSnapshot, InMemoryCatalogRepository, RepositoryError};

const COUNTRIES: &[&str] = &["Canada", "Germany", "India", "Mexico", "Republic of Korea"];

/// (id, country, native name, english name, history, accreditation)
const INSTITUTIONS: &[(&str, &str, &str, &str, &str, &str)] = &[
    (
        "inst-kr-snu",
        "Republic of Korea",
        "서울대학교",
        "Seoul National University",
        "Founded in 1946 as the first national university in Korea.",
        "Recognized by the Korean Ministry of Education",
    ),
    (
        "inst-kr-yonsei",
        "Republic of Korea",
        "연세대학교",
        "Yonsei University",
        "Private research university established in 1885.",
        "Recognized by the Korean Ministry of Education",
    ),
    (
        "inst-kr-kaist",
        "Republic of Korea",
        "한국과학기술원",
        "Korea Advanced Institute of Science and Technology",
        "Public research university established in 1971.",
        "Recognized by the Korean Ministry of Education",
    ),
    (
        "inst-ca-toronto",
        "Canada",
        "University of Toronto",
        "University of Toronto",
        "Public research university founded in 1827.",
        "Member of Universities Canada",
    ),
    (
        "inst-ca-montreal",
        "Canada",
        "Université de Montréal",
        "University of Montreal",
        "French-language public research university founded in 1878.",
        "Member of Universities Canada",
    ),
    (
        "inst-mx-unam",
        "Mexico",
        "Universidad Nacional Autónoma de México",
        "National Autonomous University of Mexico",
        "Public university whose modern charter dates from 1910.",
        "Recognized by the Secretaría de Educación Pública",
    ),
    (
        "inst-mx-udg",
        "Mexico",
        "Universidad de Guadalajara",
        "University of Guadalajara",
        "Public university established in 1792.",
        "Recognized by the Secretaría de Educación Pública",
    ),
    (
        "inst-in-iitb",
        "India",
        "Indian Institute of Technology Bombay",
        "Indian Institute of Technology Bombay",
        "Institute of national importance established in 1958.",
        "Institute of National Importance",
    ),
    (
        "inst-de-tum",
        "Germany",
        "Technische Universität München",
        "Technical University of Munich",
        "Public research university founded in 1868.",
        "State-recognized university",
    ),
];

/// (id, country, native credential, english credential, additional info)
const FOREIGN_CREDENTIALS: &[(&str, &str, &str, &str, &str)] = &[
    ("fc-kr-bachelor", "Republic of Korea", "학사", "Bachelor's Degree (Haksa)", "Four-year undergraduate degree."),
    ("fc-kr-master", "Republic of Korea", "석사", "Master's Degree (Seoksa)", "Two-year graduate degree."),
    ("fc-kr-highschool", "Republic of Korea", "고등학교 졸업장", "High School Diploma", "Completion of 12 years of schooling."),
    ("fc-ca-bsc", "Canada", "Bachelor of Science", "Bachelor of Science", "Three or four year undergraduate degree."),
    ("fc-ca-diploma", "Canada", "Ontario Secondary School Diploma", "Ontario Secondary School Diploma", "Secondary school completion."),
    ("fc-mx-licenciatura", "Mexico", "Título de Licenciatura", "Licenciatura Degree", "Four to five year professional degree."),
    ("fc-mx-bachillerato", "Mexico", "Certificado de Bachillerato", "Upper Secondary Certificate", "Completion of upper secondary education."),
    ("fc-in-btech", "India", "Bachelor of Technology", "Bachelor of Technology", "Four-year engineering degree."),
    ("fc-de-bachelor", "Germany", "Bachelor of Science", "Bachelor of Science", "Three-year Bologna first cycle degree."),
];

/// (id, country, length)
const PROGRAM_LENGTHS: &[(&str, &str, &str)] = &[
    ("pl-kr-4", "Republic of Korea", "4 years"),
    ("pl-kr-2", "Republic of Korea", "2 years"),
    ("pl-ca-4", "Canada", "4 years"),
    ("pl-ca-3", "Canada", "3 years"),
    ("pl-mx-5", "Mexico", "5 years"),
    ("pl-mx-4", "Mexico", "4 years"),
    ("pl-in-4", "India", "4 years"),
    ("pl-de-3", "Germany", "3 years"),
];

/// (id, country, scale, bifurcation, notes, conversion factor)
const GRADE_SCALES: &[(&str, &str, &str, &str, &str, &str)] = &[
    (
        "gs-kr-45",
        "Republic of Korea",
        "4.5 scale",
        "A+ 4.5 / A0 4.0 / B+ 3.5 / B0 3.0 / C+ 2.5 / C0 2.0 / D+ 1.5 / D0 1.0 / F 0",
        "Most Korean universities use the 4.5 scale.",
        "GPA x 4.0 / 4.5",
    ),
    (
        "gs-kr-43",
        "Republic of Korea",
        "4.3 scale",
        "A+ 4.3 / A0 4.0 / A- 3.7 / B+ 3.3 / B0 3.0 / B- 2.7 / C+ 2.3 / C0 2.0",
        "Used by a minority of institutions.",
        "GPA x 4.0 / 4.3",
    ),
    ("gs-ca-pct", "Canada", "Percentage 0-100", "A 80-100 / B 70-79 / C 60-69 / D 50-59 / F 0-49", "Pass mark is usually 50.", "Percentage bands"),
    ("gs-mx-10", "Mexico", "0-10 scale", "10 Excelente / 9 Muy Bien / 8 Bien / 7 Regular / 6 Suficiente / 5 No Aprobado", "Minimum passing grade is 6.", "Direct band mapping"),
    ("gs-in-cgpa", "India", "10-point CGPA", "O 10 / A+ 9 / A 8 / B+ 7 / B 6 / C 5 / P 4 / F 0", "Cumulative grade point average.", "CGPA x 4.0 / 10"),
    ("gs-de-5", "Germany", "1.0-5.0 scale", "1 sehr gut / 2 gut / 3 befriedigend / 4 ausreichend / 5 nicht ausreichend", "1.0 is the best grade; 4.0 is the minimum pass.", "Modified Bavarian formula"),
];

/// (id, overall equivalency, description)
const US_EQUIVALENCIES: &[(&str, &str, &str)] = &[
    ("us-bachelor", "Bachelor's degree", "Equivalent to a four-year bachelor's degree from a regionally accredited institution in the United States."),
    ("us-master", "Master's degree", "Equivalent to a master's degree from a regionally accredited institution in the United States."),
    ("us-highschool", "High school diploma", "Equivalent to graduation from high school in the United States."),
    ("us-three-years", "Three years of undergraduate study", "Equivalent to three years of undergraduate study at a regionally accredited institution in the United States."),
    ("us-associate", "Associate degree", "Equivalent to an associate degree from a regionally accredited institution in the United States."),
];

const NOTES: &[(&str, &str)] = &[
    ("note-kr-bachelor", "Korean four-year bachelor's degrees from recognized institutions are generally equivalent to U.S. bachelor's degrees."),
    ("note-de-bologna", "Three-year German bachelor's degrees are evaluated as three years of undergraduate study unless preceded by Abitur plus additional study."),
];

/// Small deterministic reference catalog used by `credeval seed` and by tests.
pub struct FixtureCatalog;

impl FixtureCatalog {
    pub fn snapshot() -> CatalogSnapshot {
        CatalogSnapshot {
            countries: COUNTRIES
                .iter()
                .map(|name| Country { country_name: (*name).to_string() })
                .collect(),
            institutions: INSTITUTIONS
                .iter()
                .map(|(id, country, native, english, history, accreditation)| Institution {
                    id: CatalogId::from(*id),
                    country_name: (*country).to_string(),
                    institution_name: Some((*native).to_string()),
                    institution_english_name: Some((*english).to_string()),
                    institution_history: Some((*history).to_string()),
                    accreditation_status: Some((*accreditation).to_string()),
                })
                .collect(),
            foreign_credentials: FOREIGN_CREDENTIALS
                .iter()
                .map(|(id, country, native, english, info)| ForeignCredential {
                    id: CatalogId::from(*id),
                    country_name: (*country).to_string(),
                    foreign_credential: Some((*native).to_string()),
                    english_credential: Some((*english).to_string()),
                    additional_info: Some((*info).to_string()),
                })
                .collect(),
            program_lengths: PROGRAM_LENGTHS
                .iter()
                .map(|(id, country, length)| ProgramLength {
                    id: CatalogId::from(*id),
                    country_name: (*country).to_string(),
                    program_length: Some((*length).to_string()),
                })
                .collect(),
            grade_scales: GRADE_SCALES
                .iter()
                .map(|(id, country, scale, bifurcation, notes, factor)| GradeScale {
                    id: CatalogId::from(*id),
                    country_name: (*country).to_string(),
                    grade_scale: Some((*scale).to_string()),
                    bifurcation_setup: Some((*bifurcation).to_string()),
                    grade_notes: Some((*notes).to_string()),
                    conversion_factor: Some((*factor).to_string()),
                })
                .collect(),
            us_equivalencies: US_EQUIVALENCIES
                .iter()
                .map(|(id, overall, description)| UsEquivalency {
                    id: CatalogId::from(*id),
                    overall_equivalency: Some((*overall).to_string()),
                    equivalency_description: Some((*description).to_string()),
                })
                .collect(),
            notes: NOTES
                .iter()
                .map(|(id, content)| CatalogNote {
                    id: CatalogId::from(*id),
                    note_content: Some((*content).to_string()),
                })
                .collect(),
        }
    }

    pub fn in_memory() -> InMemoryCatalogRepository {
        InMemoryCatalogRepository::new(Self::snapshot())
    }

    /// Inserts the fixture rows. Rows that already exist are left untouched,
    /// so loading twice is harmless.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        let mut inserted = 0u64;

        for name in COUNTRIES {
            inserted += sqlx::query("INSERT OR IGNORE INTO country (country_name) VALUES (?)")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        for (id, country, native, english, history, accreditation) in INSTITUTIONS {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO institution (
                    institution_uuid,
                    country_name,
                    institution_name,
                    institution_english_name,
                    institution_history,
                    accreditation_status
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(country)
            .bind(native)
            .bind(english)
            .bind(history)
            .bind(accreditation)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for (id, country, native, english, info) in FOREIGN_CREDENTIALS {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO foreign_credential (
                    credential_uuid,
                    country_name,
                    foreign_credential,
                    english_credential,
                    additional_info
                 ) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(country)
            .bind(native)
            .bind(english)
            .bind(info)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for (id, country, length) in PROGRAM_LENGTHS {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO program_length (program_length_uuid, country_name, program_length)
                 VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(country)
            .bind(length)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for (id, country, scale, bifurcation, notes, factor) in GRADE_SCALES {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO grade_scale (
                    grade_scale_uuid,
                    country_name,
                    grade_scale,
                    bifurcation_setup,
                    grade_notes,
                    conversion_factor
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(country)
            .bind(scale)
            .bind(bifurcation)
            .bind(notes)
            .bind(factor)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for (id, overall, description) in US_EQUIVALENCIES {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO us_equivalency (equivalency_uuid, overall_equivalency, equivalency_description)
                 VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(overall)
            .bind(description)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        for (id, content) in NOTES {
            inserted += sqlx::query("INSERT OR IGNORE INTO notes (note_uuid, note_content) VALUES (?, ?)")
                .bind(id)
                .bind(content)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(SeedResult { rows_inserted: inserted, rows_expected: Self::row_count() })
    }

    /// Checks that every fixture id is present.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for name in COUNTRIES {
            checks.push((*name, exists(pool, "country", "country_name", name).await?));
        }
        for (id, ..) in INSTITUTIONS {
            checks.push((*id, exists(pool, "institution", "institution_uuid", id).await?));
        }
        for (id, ..) in FOREIGN_CREDENTIALS {
            checks.push((*id, exists(pool, "foreign_credential", "credential_uuid", id).await?));
        }
        for (id, ..) in PROGRAM_LENGTHS {
            checks.push((*id, exists(pool, "program_length", "program_length_uuid", id).await?));
        }
        for (id, ..) in GRADE_SCALES {
            checks.push((*id, exists(pool, "grade_scale", "grade_scale_uuid", id).await?));
        }
        for (id, ..) in US_EQUIVALENCIES {
            checks.push((*id, exists(pool, "us_equivalency", "equivalency_uuid", id).await?));
        }
        for (id, _) in NOTES {
            checks.push((*id, exists(pool, "notes", "note_uuid", id).await?));
        }

        let all_present = checks.iter().all(|(_, exists)| *exists);
        Ok(VerificationResult { all_present, checks })
    }

    pub fn row_count() -> u64 {
        (COUNTRIES.len()
            + INSTITUTIONS.len()
            + FOREIGN_CREDENTIALS.len()
            + PROGRAM_LENGTHS.len()
            + GRADE_SCALES.len()
            + US_EQUIVALENCIES.len()
            + NOTES.len()) as u64
    }
}

async fn exists(
    pool: &DbPool,
    table: &'static str,
    key_column: &'static str,
    key: &str,
) -> Result<bool, RepositoryError> {
    let found: i64 =
        sqlx::query_scalar(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {key_column} = ?1)"))
            .bind(key)
            .fetch_one(pool)
            .await?;
    Ok(found == 1)
}

#[derive(Debug)]
pub struct SeedResult {
    pub rows_inserted: u64,
    pub rows_expected: u64,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_with_settings, migrations};

    #[test]
    fn korea_is_the_only_country_mentioning_korea() {
        let matching = COUNTRIES.iter().filter(|name| name.contains("Korea")).count();
        assert_eq!(matching, 1);
    }

    #[test]
    fn every_scoped_row_points_at_a_fixture_country() {
        let snapshot = FixtureCatalog::snapshot();
        let scoped = snapshot
            .institutions
            .iter()
            .map(|row| row.country_name.as_str())
            .chain(snapshot.foreign_credentials.iter().map(|row| row.country_name.as_str()))
            .chain(snapshot.program_lengths.iter().map(|row| row.country_name.as_str()))
            .chain(snapshot.grade_scales.iter().map(|row| row.country_name.as_str()));
        for country in scoped {
            assert!(COUNTRIES.contains(&country), "unknown fixture country `{country}`");
        }
    }

    #[tokio::test]
    async fn load_is_idempotent_and_verifiable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");

        let first = FixtureCatalog::load(&pool).await.expect("load fixtures");
        assert_eq!(first.rows_inserted, FixtureCatalog::row_count());
        let first_verification = FixtureCatalog::verify(&pool).await.expect("verify fixtures");
        assert!(first_verification.all_present);

        let second = FixtureCatalog::load(&pool).await.expect("reload fixtures");
        assert_eq!(second.rows_inserted, 0);
        let second_verification = FixtureCatalog::verify(&pool).await.expect("re-verify fixtures");
        assert_eq!(first_verification.checks, second_verification.checks);
    }
}
