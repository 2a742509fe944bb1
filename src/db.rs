use std::sync::Arc;

use anyhow::{Context, Result};
use diesel_async::{
    pooled_connection::{bb8::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection,
};

pub type DbPool = Pool<AsyncPgConnection>;

pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Build a bb8 pool of async postgres connections.
pub async fn new_db_pool(database_url: &str, max_pool_size: Option<u32>) -> Result<Arc<DbPool>> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_pool_size.unwrap_or(DEFAULT_POOL_SIZE))
        .build(config)
        .await
        .context("Failed to create connection pool")?;
    Ok(Arc::new(pool))
}

#[cfg(feature = "libpq")]
pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations =
    diesel_migrations::embed_migrations!("migrations");

// For the normal build we just use standard Diesel with the postgres
// feature enabled (which uses libpq under the hood, hence why we named the feature
// this way).
#[cfg(feature = "libpq")]
pub fn run_pending_migrations(database_url: &str) -> Result<()> {
    use diesel::{pg::PgConnection, Connection};
    use diesel_migrations::MigrationHarness;

    tracing::info!("Running migrations");
    let mut conn =
        PgConnection::establish(database_url).context("Failed to connect for migrations")?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow::anyhow!("Failed to run migrations: {}", err))?;
    Ok(())
}

#[cfg(not(feature = "libpq"))]
pub fn run_pending_migrations(_database_url: &str) -> Result<()> {
    tracing::warn!("Built without libpq, skipping migrations");
    Ok(())
}
