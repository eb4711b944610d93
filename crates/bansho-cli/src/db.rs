//! Shared database bootstrap for the CLI commands.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use bansho_types::Settings;

/// Open the pool and make sure both tables exist. `api_keys` must be created
/// before `audit_events` references it.
pub async fn connect_and_migrate(settings: &Settings) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.postgres_dsn)
        .await?;

    bansho_security::keys::run_migrations(&pool).await?;
    bansho_security::audit::run_migrations(&pool).await?;
    Ok(pool)
}

/// Postgres liveness check, run before serving begins.
pub async fn ping(pool: &PgPool) -> anyhow::Result<()> {
    let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    anyhow::ensure!(one == 1, "postgres smoke check returned {one}");
    Ok(())
}
