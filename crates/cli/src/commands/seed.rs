use serde::Serialize;

use crate::commands::{load_config, runtime, CommandResult};
use credeval_core::config::LoadOptions;
use credeval_db::{connect_with_settings, migrations, FixtureCatalog};

const COMMAND: &str = "seed";

#[derive(Debug, Serialize)]
struct SeedDetails {
    rows_inserted: u64,
    rows_expected: u64,
}

pub fn run() -> CommandResult {
    let config = match load_config(COMMAND, LoadOptions::default()) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seed_result = FixtureCatalog::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = FixtureCatalog::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 5u8))?;

        let run_result = if verification.all_present {
            Ok(SeedDetails {
                rows_inserted: seed_result.rows_inserted,
                rows_expected: seed_result.rows_expected,
            })
        } else {
            Err(("seed_verification", verification_message(&verification.checks), 5u8))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(details) => {
            let message = format!(
                "reference catalog fixture present: {} rows verified",
                details.rows_expected
            );
            CommandResult::success_with_details(COMMAND, message, details)
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}

fn verification_message(checks: &[(&str, bool)]) -> String {
    let failed_checks = checks
        .iter()
        .filter_map(|(check, passed)| (!passed).then_some(*check))
        .collect::<Vec<_>>();
    if failed_checks.is_empty() {
        "Some catalog rows failed to load".to_string()
    } else {
        format!("Catalog verification failed for rows: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_message_names_missing_rows() {
        let checks = [("Republic of Korea", true), ("inst-kr-snu", false), ("us-bachelor", false)];
        assert_eq!(
            verification_message(&checks),
            "Catalog verification failed for rows: inst-kr-snu, us-bachelor"
        );
    }

    #[test]
    fn verification_message_falls_back_to_generic_when_no_labels() {
        let checks = [("Canada", true), ("us-master", true)];
        assert_eq!(verification_message(&checks), "Some catalog rows failed to load");
    }
}
