//! SQLite persistence for the relay.
//!
//! One [`SqliteStore`] implements every repository trait from
//! `tgfwd-core`; the schema is bootstrapped on connect. SQLite has a
//! single writer, so the pool is capped at one connection.

use std::str::FromStr;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use tgfwd_core::{Error, Result};

mod deliveries;
mod destinations;
mod sessions;
mod sources;
mod users;

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating the file if missing) and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!(database_url, "opening sqlite store");

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'idle',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id INTEGER PRIMARY KEY
                    REFERENCES users(id) ON DELETE CASCADE,
                blob BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL
                    REFERENCES users(id) ON DELETE CASCADE,
                channel_id INTEGER NOT NULL,
                channel_handle TEXT,
                channel_title TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                high_water INTEGER NOT NULL DEFAULT 0,
                added_at TEXT NOT NULL,
                UNIQUE(user_id, channel_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS destinations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL UNIQUE
                    REFERENCES users(id) ON DELETE CASCADE,
                channel_id INTEGER NOT NULL,
                channel_handle TEXT,
                channel_title TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                configured_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL
                    REFERENCES users(id) ON DELETE CASCADE,
                source_id INTEGER NOT NULL
                    REFERENCES sources(id) ON DELETE CASCADE,
                destination_id INTEGER,
                original_msg_id INTEGER NOT NULL,
                forwarded_msg_id INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                will_retry INTEGER NOT NULL DEFAULT 1,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                UNIQUE(user_id, source_id, original_msg_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_users_state ON users(state)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_valid ON sessions(is_valid, user_id)",
            "CREATE INDEX IF NOT EXISTS idx_sources_active ON sources(user_id, is_active)",
            "CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(user_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_deliveries_created ON deliveries(created_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}
