//! Job store for the Autopost publishing pipeline.
//!
//! The store is the only shared mutable state between workers. All status
//! changes go through [`JobStore::update_if_status`] or the atomic
//! [`JobStore::claim_next`]; there are no blind writes.

pub mod error;
pub mod memory;
pub mod pg;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::MemoryJobStore;
pub use pg::PgJobStore;
pub use store::{ClaimRequest, Expectation, JobFilter, JobStore, Mutation};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
