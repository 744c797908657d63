use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating pins table");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS pins (
            id INTEGER PRIMARY KEY,
            loadable_id INTEGER NOT NULL,
            site TEXT NOT NULL,
            board TEXT NOT NULL,
            thread_no INTEGER NOT NULL,
            watching INTEGER NOT NULL DEFAULT 1,
            is_error INTEGER NOT NULL DEFAULT 0,
            archived INTEGER NOT NULL DEFAULT 0,
            pin_order INTEGER NOT NULL,
            watch_last_count INTEGER NOT NULL DEFAULT -1,
            watch_new_count INTEGER NOT NULL DEFAULT -1,
            quote_last_count INTEGER NOT NULL DEFAULT -1,
            quote_new_count INTEGER NOT NULL DEFAULT -1,
            title TEXT NOT NULL DEFAULT '',
            thumbnail_url TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (site, board, thread_no)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create pins table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pins_order ON pins(pin_order)")
        .execute(pool)
        .await
        .context("Failed to create pins order index")?;

    Ok(())
}
