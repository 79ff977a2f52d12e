// Database initialization and migration handling
use std::path::{Path, PathBuf};

use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use crate::db::migrations::get_migrations;
use crate::error::Result;

/// Environment variable overriding the database location
pub const DB_PATH_ENV: &str = "HARVEST_SYNC_DB";

/// Resolve the database path: `HARVEST_SYNC_DB`, else `harvest-sync.db` in `data_dir`
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    match std::env::var(DB_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => data_dir.join("harvest-sync.db"),
    }
}

/// Initialize the database connection pool
pub async fn init_db(db_path: &Path) -> Result<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    log::info!("Initializing database at: {}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    // WAL keeps readers unblocked while a drain writes
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;

    run_migrations(&pool).await?;

    log::info!("Database initialization complete");

    Ok(pool)
}

/// Run all pending migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for (name, sql) in get_migrations() {
        let applied: bool = sqlx::query("SELECT COUNT(*) as count FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await
            .map(|row| row.get::<i64, _>("count") > 0)
            .unwrap_or(false);

        if applied {
            continue;
        }

        log::info!("Applying {}...", name);

        // SQLite runs one statement per query
        for statement in sql.split(';') {
            let stmt = strip_leading_comments(statement);
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }

        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, datetime('now'))")
            .bind(name)
            .execute(pool)
            .await?;

        log::info!("{} applied successfully", name);
    }

    Ok(())
}

fn strip_leading_comments(statement: &str) -> &str {
    let mut stmt = statement.trim();
    while stmt.starts_with("--") {
        match stmt.find('\n') {
            Some(idx) => stmt = stmt[idx + 1..].trim(),
            None => return "",
        }
    }
    stmt
}

/// Get database stats for debugging
pub async fn get_db_stats(pool: &Pool<Sqlite>) -> Result<DbStats> {
    let row = sqlx::query(
        "SELECT
            (SELECT COUNT(*) FROM reports) as report_count,
            (SELECT COUNT(*) FROM reports WHERE dmf_status != 'confirmed') as unconfirmed_count,
            (SELECT COUNT(*) FROM rewards_entries) as drawing_entry_count",
    )
    .fetch_one(pool)
    .await?;

    Ok(DbStats {
        report_count: row.get("report_count"),
        unconfirmed_count: row.get("unconfirmed_count"),
        drawing_entry_count: row.get("drawing_entry_count"),
    })
}

#[derive(Debug, serde::Serialize)]
pub struct DbStats {
    pub report_count: i64,
    pub unconfirmed_count: i64,
    pub drawing_entry_count: i64,
}
