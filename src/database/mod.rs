use crate::assets::MigrationAssets;
use crate::config::DatabaseConfig;
use crate::errors::RepositoryError;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

pub mod catalog;
pub mod downstream;
pub mod sessions;
pub mod sources;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub fn pool(&self) -> Pool<Sqlite> {
        self.pool.clone()
    }

    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database on a single connection, migrated and ready.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.migrate().await?;
        Ok(database)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                installed_on TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                success BOOLEAN NOT NULL,
                checksum BLOB NOT NULL,
                execution_time BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MigrationAssets::get_migrations() {
            // "001_initial_schema.sql" -> 1
            let version: i64 = name
                .split('_')
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| anyhow::anyhow!("Migration {} has no numeric version prefix", name))?;

            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _sqlx_migrations WHERE version = ? AND success = true",
            )
            .bind(version)
            .fetch_one(&self.pool)
            .await?;

            if existing > 0 {
                continue;
            }

            let start = std::time::Instant::now();
            let mut transaction = self.pool.begin().await?;

            if let Err(e) = (&mut *transaction).execute(content.as_str()).await {
                transaction.rollback().await?;
                return Err(RepositoryError::MigrationFailed {
                    version: name,
                    message: e.to_string(),
                }
                .into());
            }

            let execution_time = start.elapsed().as_millis() as i64;
            sqlx::query(
                r#"
                INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
                VALUES (?, ?, true, ?, ?)
                "#,
            )
            .bind(version)
            .bind(&name)
            .bind(Self::calculate_checksum(&content))
            .bind(execution_time)
            .execute(&mut *transaction)
            .await?;

            transaction.commit().await?;
            info!("Applied migration: {} ({}ms)", name, execution_time);
        }

        Ok(())
    }

    fn calculate_checksum(content: &str) -> Vec<u8> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        hasher.finish().to_be_bytes().to_vec()
    }

    /// Sessions do not survive a management plane restart: drop the rows and
    /// zero every source's active stream counter.
    pub async fn reset_session_state(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sessions = sqlx::query("DELETE FROM sessions")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("UPDATE upstream_sources SET active_stream_count = 0")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Cleared {} stale sessions and reset stream counters", sessions);
        Ok(())
    }
}
