use serde::Serialize;
use std::collections::BTreeMap;

use crate::commands::{load_config, runtime, CommandResult};
use credeval_core::config::LoadOptions;
use credeval_db::{connect_read_only, CatalogRepository, SqlCatalogRepository};

const COMMAND: &str = "catalog";

#[derive(Debug, Serialize)]
struct CatalogDetails {
    row_counts: BTreeMap<String, i64>,
    total_rows: i64,
    integrity_issues: Vec<String>,
}

/// Reports per-table row counts and orphaned country references.
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
        let pool = connect_read_only(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let repository = SqlCatalogRepository::new(pool.clone());

        let statistics = repository
            .statistics()
            .await
            .map_err(|error| ("catalog_query", error.to_string(), 4u8))?;
        let integrity = repository
            .integrity_report()
            .await
            .map_err(|error| ("catalog_query", error.to_string(), 4u8))?;
        pool.close().await;

        Ok::<_, (&'static str, String, u8)>(CatalogDetails {
            total_rows: statistics.total(),
            row_counts: statistics.row_counts,
            integrity_issues: integrity.issues,
        })
    });

    match result {
        Ok(details) if details.integrity_issues.is_empty() => {
            let message = format!("reference catalog holds {} rows", details.total_rows);
            CommandResult::success_with_details(COMMAND, message, details)
        }
        Ok(details) => {
            let message = format!("reference catalog has integrity issues: {}", details.integrity_issues.join("; "));
            CommandResult::failure_with_details(COMMAND, "catalog_integrity", message, details, 5)
        }
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
