//! The gearbox job ledger: sqlx models, the narrow [`store::JobStore`]
//! contract, and its PostgreSQL implementation.

pub mod models;
pub mod repositories;
pub mod store;

pub use repositories::job_repo::JobRepo;
pub use store::{JobStore, StoreError};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Default maximum number of pool connections.
const MAX_CONNECTIONS: u32 = 10;

/// Create a connection pool for the given database URL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await
}

/// Verify the database is reachable.
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from this crate's `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
