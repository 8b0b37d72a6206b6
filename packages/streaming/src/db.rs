// ABOUTME: SQLite pool setup shared by the message store and the stream store
// ABOUTME: Applies connection pragmas and runs embedded migrations

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;

/// Open (creating if needed) the database at `database_url` and bring its schema up to date
pub async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // An in-memory database lives and dies with its single connection
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?
    };

    if !in_memory {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    }
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA temp_store = memory")
        .execute(&pool)
        .await?;

    debug!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", database_url);
    Ok(pool)
}
