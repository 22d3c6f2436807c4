use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Reverts every applied migration, then applies them again. All catalog
/// rows are lost.
pub async fn reset(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.undo(pool, 0).await?;
    MIGRATOR.run(pool).await
}
