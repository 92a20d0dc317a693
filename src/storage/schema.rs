use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the persistent store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: concurrent task units wait for the single writer
        // instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // In-memory databases share one cache across the pool, where table
        // locks surface as SQLITE_LOCKED without waiting. One connection
        // serializes access instead.
        let max_connections = if path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate()
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                hub TEXT NOT NULL DEFAULT '',
                updated INTEGER,
                date INTEGER,
                checked INTEGER,
                next_update INTEGER NOT NULL,
                last_viewed INTEGER,
                subscribed INTEGER,
                sub_requested INTEGER,
                errors INTEGER NOT NULL DEFAULT 0,
                average_secs INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Due-feed scans and the retention sweep both select on next_update
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feeds_next_update ON feeds(next_update, url)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stories (
                feed_url TEXT NOT NULL REFERENCES feeds(url) ON DELETE CASCADE,
                id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                published INTEGER NOT NULL,
                updated INTEGER,
                created INTEGER NOT NULL,
                PRIMARY KEY (feed_url, id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS story_contents (
                feed_url TEXT NOT NULL,
                story_id TEXT NOT NULL,
                slot INTEGER NOT NULL DEFAULT 1,
                compressed BLOB,
                raw TEXT,
                PRIMARY KEY (feed_url, story_id, slot),
                FOREIGN KEY (feed_url, story_id)
                    REFERENCES stories(feed_url, id) ON DELETE CASCADE,
                CHECK ((compressed IS NULL) <> (raw IS NULL))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_data (
                user_id TEXT PRIMARY KEY NOT NULL,
                opml TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                name TEXT PRIMARY KEY NOT NULL,
                endpoint TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                run_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                finished_at INTEGER,
                last_error TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state_run_at ON tasks(state, run_at)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
