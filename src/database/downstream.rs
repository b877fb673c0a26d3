use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

use super::Database;
use crate::errors::{AppError, AppResult, RepositoryError};
use crate::models::*;

fn downstream_from_row(row: &SqliteRow) -> DownstreamPlaylist {
    let mode: String = row.get("filter_mode");
    DownstreamPlaylist {
        id: row.get("id"),
        name: row.get("name"),
        enabled: row.get("enabled"),
        groups: row.get("group_refs"),
        channel_filter: row.get("channel_filter"),
        filter_mode: mode.parse().unwrap_or_else(|e| {
            warn!("{}; treating as 'any'", e);
            FilterMode::Any
        }),
        proxy_name: row.get("proxy_name"),
    }
}

const DOWNSTREAM_COLUMNS: &str = "id, name, enabled, group_refs, channel_filter, filter_mode, proxy_name";

impl Database {
    pub async fn list_downstream_playlists(&self) -> AppResult<Vec<DownstreamPlaylist>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM downstream_playlists ORDER BY name",
            DOWNSTREAM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(downstream_from_row).collect())
    }

    pub async fn get_downstream_playlist_by_name(&self, name: &str) -> AppResult<Option<DownstreamPlaylist>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM downstream_playlists WHERE name = ?",
            DOWNSTREAM_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(downstream_from_row))
    }

    pub async fn create_downstream_playlist(
        &self,
        request: &DownstreamPlaylistCreateRequest,
    ) -> AppResult<DownstreamPlaylist> {
        if request.name.trim().is_empty() {
            return Err(AppError::validation("playlist name must not be empty"));
        }

        sqlx::query(
            "INSERT INTO downstream_playlists (name, enabled, group_refs, channel_filter, filter_mode, proxy_name)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(request.name.trim())
        .bind(request.enabled)
        .bind(&request.groups)
        .bind(&request.channel_filter)
        .bind(request.filter_mode.as_str())
        .bind(&request.proxy_name)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::Repository(RepositoryError::constraint_violation(
                    "downstream_playlists.name",
                    format!("a playlist named '{}' already exists", request.name),
                ))
            }
            other => AppError::Database(other),
        })?;

        self.get_downstream_playlist_by_name(request.name.trim())
            .await?
            .ok_or_else(|| {
                AppError::Repository(RepositoryError::record_not_found(
                    "downstream_playlists",
                    "name",
                    request.name.clone(),
                ))
            })
    }

    pub async fn delete_downstream_playlist(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM downstream_playlists WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
