//! Database connection management using sqlx

use crate::error::{NlqError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Initialize the connection pool and probe connectivity.
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(|e| NlqError::SchemaUnavailable(e.to_string()))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| NlqError::SchemaUnavailable(e.to_string()))?;

    Ok(pool)
}
