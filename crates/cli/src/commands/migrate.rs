use crate::commands::{load_config, runtime, CommandResult};
use credeval_core::config::LoadOptions;
use credeval_db::{connect_with_settings, migrations};
use tracing::warn;

const COMMAND: &str = "migrate";

/// Applies pending migrations. With `reset`, reverts every migration first,
/// dropping all catalog rows.
pub fn run(reset: bool) -> CommandResult {
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
        let applied = if reset {
            warn!(event_name = "cli.migrate.reset", "reverting all catalog migrations");
            migrations::reset(&pool).await
        } else {
            migrations::run_pending(&pool).await
        };
        applied.map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) if reset => CommandResult::success(COMMAND, "reset catalog schema"),
        Ok(()) => CommandResult::success(COMMAND, "applied pending migrations"),
        Err(failure) => CommandResult::from_failure(COMMAND, failure),
    }
}
