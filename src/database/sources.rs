use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, warn};

use super::Database;
use crate::errors::{AppError, AppResult, RepositoryError};
use crate::models::*;
use crate::utils::{parse_datetime, DateTimeParser};

const SOURCE_COLUMNS: &str = "id, name, location, is_local, group_exclusions, user_agent, \
     refresh_interval_hours, last_reconciled_at, enabled, max_concurrent_streams, \
     active_stream_count, created_at, updated_at";

fn source_from_row(row: &SqliteRow) -> UpstreamSource {
    UpstreamSource {
        id: row.get("id"),
        name: row.get("name"),
        location: row.get("location"),
        is_local: row.get("is_local"),
        group_exclusions: row.get("group_exclusions"),
        user_agent: row.get("user_agent"),
        refresh_interval_hours: row.get("refresh_interval_hours"),
        last_reconciled_at: row
            .get::<Option<String>, _>("last_reconciled_at")
            .map(|s| parse_datetime(&s)),
        enabled: row.get("enabled"),
        max_concurrent_streams: row.get("max_concurrent_streams"),
        active_stream_count: row.get("active_stream_count"),
        created_at: parse_datetime(&row.get::<String, _>("created_at")),
        updated_at: parse_datetime(&row.get::<String, _>("updated_at")),
    }
}

impl Database {
    pub async fn list_upstream_sources(&self) -> AppResult<Vec<UpstreamSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM upstream_sources ORDER BY name",
            SOURCE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(source_from_row).collect())
    }

    pub async fn get_upstream_source(&self, id: i64) -> AppResult<Option<UpstreamSource>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upstream_sources WHERE id = ?",
            SOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(source_from_row))
    }

    pub async fn get_upstream_source_by_name(&self, name: &str) -> AppResult<Option<UpstreamSource>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM upstream_sources WHERE name = ?",
            SOURCE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(source_from_row))
    }

    pub async fn create_upstream_source(
        &self,
        request: &UpstreamSourceCreateRequest,
    ) -> AppResult<UpstreamSource> {
        if request.name.trim().is_empty() {
            return Err(AppError::validation("source name must not be empty"));
        }
        if request.refresh_interval_hours < 0 || request.max_concurrent_streams < 0 {
            return Err(AppError::validation(
                "refresh interval and stream limit must not be negative",
            ));
        }

        let now = DateTimeParser::format_for_storage(&Utc::now());
        let result = sqlx::query(
            "INSERT INTO upstream_sources (name, location, is_local, group_exclusions, user_agent,
             refresh_interval_hours, enabled, max_concurrent_streams, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.name.trim())
        .bind(&request.location)
        .bind(request.is_local)
        .bind(&request.group_exclusions)
        .bind(&request.user_agent)
        .bind(request.refresh_interval_hours)
        .bind(request.enabled)
        .bind(request.max_concurrent_streams)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::Repository(RepositoryError::constraint_violation(
                    "upstream_sources.name",
                    format!("a source named '{}' already exists", request.name),
                ))
            }
            other => AppError::Database(other),
        })?;

        let id = result.last_insert_rowid();
        info!("Created upstream source '{}' ({})", request.name, id);

        self.get_upstream_source(id).await?.ok_or_else(|| {
            AppError::Repository(RepositoryError::record_not_found(
                "upstream_sources",
                "id",
                id.to_string(),
            ))
        })
    }

    /// Delete a source. Groups, channels, sessions and watch statistics of
    /// its channels go with it; icons stay.
    pub async fn delete_upstream_source(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM upstream_sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_upstream_source_enabled(&self, id: i64, enabled: bool) -> AppResult<bool> {
        let result = sqlx::query("UPDATE upstream_sources SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(DateTimeParser::format_for_storage(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_source_reconciled(&self, id: i64, at: DateTime<Utc>) -> AppResult<()> {
        let stamp = DateTimeParser::format_for_storage(&at);
        sqlx::query("UPDATE upstream_sources SET last_reconciled_at = ?, updated_at = ? WHERE id = ?")
            .bind(&stamp)
            .bind(&stamp)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Decrement the counter, never below zero. Returns `false` when the
    /// counter was already zero and the decrement was clamped.
    pub async fn decrement_active_streams(&self, source_id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE upstream_sources SET active_stream_count = active_stream_count - 1
             WHERE id = ? AND active_stream_count > 0",
        )
        .bind(source_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                "Active stream counter for source {} already at zero, decrement clamped",
                source_id
            );
            return Ok(false);
        }
        Ok(true)
    }
}
