//! Groups, icons and channels: the reconciled catalog

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use super::Database;
use crate::errors::AppResult;
use crate::ingestor::m3u_parser::ParsedEntry;
use crate::models::*;
use crate::utils::{parse_datetime, DateTimeParser};

/// A parsed entry together with the admission policy's verdict for it
#[derive(Debug, Clone, Copy)]
pub struct ImportEntry<'a> {
    pub entry: &'a ParsedEntry,
    pub default_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub created: usize,
    pub updated: usize,
}

/// Everything the admission oracle needs about the channel behind a URL
#[derive(Debug, Clone)]
pub struct ChannelAdmissionContext {
    pub channel_id: i64,
    pub channel_enabled: bool,
    pub group_enabled: bool,
    pub source_id: i64,
    pub source_name: String,
    pub source_enabled: bool,
    pub max_concurrent_streams: i64,
    pub active_stream_count: i64,
    pub extra_tag_lines: String,
}

const CHANNEL_COLUMNS: &str = "id, name, stream_url, group_id, source_id, enabled, protected, \
     tvg_id, tvg_name, icon_id, extra_tag_lines, first_seen_at, last_seen_at";

fn channel_from_row(row: &SqliteRow) -> Channel {
    Channel {
        id: row.get("id"),
        name: row.get("name"),
        stream_url: row.get("stream_url"),
        group_id: row.get("group_id"),
        source_id: row.get("source_id"),
        enabled: row.get("enabled"),
        protected: row.get("protected"),
        tvg_id: row.get("tvg_id"),
        tvg_name: row.get("tvg_name"),
        icon_id: row.get("icon_id"),
        extra_tag_lines: row.get("extra_tag_lines"),
        first_seen_at: parse_datetime(&row.get::<String, _>("first_seen_at")),
        last_seen_at: parse_datetime(&row.get::<String, _>("last_seen_at")),
    }
}

fn icon_from_row(row: &SqliteRow) -> Icon {
    Icon {
        id: row.get("id"),
        url: row.get("url"),
        local_name: row.get("local_name"),
        mime_hint: row.get("mime_hint"),
        size_bytes: row.get("size_bytes"),
        created_at: parse_datetime(&row.get::<String, _>("created_at")),
    }
}

async fn resolve_group(conn: &mut SqliteConnection, source_id: i64, name: &str) -> AppResult<i64> {
    sqlx::query("INSERT INTO channel_groups (name, source_id) VALUES (?, ?) ON CONFLICT(name, source_id) DO NOTHING")
        .bind(name)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;

    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM channel_groups WHERE name = ? AND source_id = ?")
        .bind(name)
        .bind(source_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

async fn resolve_icon(conn: &mut SqliteConnection, url: &str, now: &str) -> AppResult<i64> {
    sqlx::query("INSERT INTO icons (url, created_at) VALUES (?, ?) ON CONFLICT(url) DO NOTHING")
        .bind(url)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM icons WHERE url = ?")
        .bind(url)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

impl Database {
    /// Pre-pass of a reconciliation run: every unprotected channel of the
    /// source is disabled until the import sees it again.
    pub async fn disable_unprotected_channels(&self, source_id: i64) -> AppResult<u64> {
        let result = sqlx::query("UPDATE channels SET enabled = 0 WHERE source_id = ? AND protected = 0")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Merge a chunk of parsed entries into the catalog in one transaction.
    ///
    /// Channels are matched on (name, stream URL, group, source). Matched
    /// channels keep `enabled` when protected and take `default_enabled`
    /// otherwise; new channels start unprotected with `default_enabled`.
    pub async fn import_entries(
        &self,
        source_id: i64,
        entries: &[ImportEntry<'_>],
        now: DateTime<Utc>,
    ) -> AppResult<ImportStats> {
        let now = DateTimeParser::format_for_storage(&now);
        let mut stats = ImportStats::default();
        let mut tx = self.pool.begin().await?;

        for item in entries {
            let entry = item.entry;
            let group_id = resolve_group(&mut tx, source_id, &entry.group).await?;
            let icon_id = match &entry.logo {
                Some(url) => Some(resolve_icon(&mut tx, url, &now).await?),
                None => None,
            };

            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM channels
                 WHERE name = ? AND stream_url = ? AND group_id = ? AND source_id = ?
                 ORDER BY (extra_tag_lines = ?) DESC, id ASC LIMIT 1",
            )
            .bind(&entry.name)
            .bind(&entry.stream_url)
            .bind(group_id)
            .bind(source_id)
            .bind(&entry.extra_tag_lines)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(channel_id) => {
                    sqlx::query(
                        "UPDATE channels SET
                            enabled = CASE WHEN protected THEN enabled ELSE ? END,
                            tvg_id = ?, tvg_name = ?, icon_id = ?, extra_tag_lines = ?,
                            last_seen_at = ?
                         WHERE id = ?",
                    )
                    .bind(item.default_enabled)
                    .bind(&entry.tvg_id)
                    .bind(&entry.tvg_name)
                    .bind(icon_id)
                    .bind(&entry.extra_tag_lines)
                    .bind(&now)
                    .bind(channel_id)
                    .execute(&mut *tx)
                    .await?;
                    stats.updated += 1;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO channels (name, stream_url, group_id, source_id, enabled, protected,
                         tvg_id, tvg_name, icon_id, extra_tag_lines, first_seen_at, last_seen_at)
                         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&entry.name)
                    .bind(&entry.stream_url)
                    .bind(group_id)
                    .bind(source_id)
                    .bind(item.default_enabled)
                    .bind(&entry.tvg_id)
                    .bind(&entry.tvg_name)
                    .bind(icon_id)
                    .bind(&entry.extra_tag_lines)
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                    stats.created += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(
            "Imported chunk for source {}: {} created, {} updated",
            source_id, stats.created, stats.updated
        );
        Ok(stats)
    }

    /// Resolve the channel behind a stream URL. When the URL appears more
    /// than once, enabled channels win, then the most recently seen.
    pub async fn find_channel_admission_context(
        &self,
        stream_url: &str,
    ) -> AppResult<Option<ChannelAdmissionContext>> {
        let row = sqlx::query(
            "SELECT c.id AS channel_id, c.enabled AS channel_enabled, c.extra_tag_lines,
                    g.enabled AS group_enabled,
                    s.id AS source_id, s.name AS source_name, s.enabled AS source_enabled,
                    s.max_concurrent_streams, s.active_stream_count
             FROM channels c
             JOIN channel_groups g ON g.id = c.group_id
             JOIN upstream_sources s ON s.id = c.source_id
             WHERE c.stream_url = ?
             ORDER BY c.enabled DESC, c.last_seen_at DESC, c.id DESC
             LIMIT 1",
        )
        .bind(stream_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ChannelAdmissionContext {
            channel_id: row.get("channel_id"),
            channel_enabled: row.get("channel_enabled"),
            group_enabled: row.get("group_enabled"),
            source_id: row.get("source_id"),
            source_name: row.get("source_name"),
            source_enabled: row.get("source_enabled"),
            max_concurrent_streams: row.get("max_concurrent_streams"),
            active_stream_count: row.get("active_stream_count"),
            extra_tag_lines: row.get("extra_tag_lines"),
        }))
    }

    pub async fn find_group(&self, source_id: i64, name: &str) -> AppResult<Option<ChannelGroup>> {
        let row = sqlx::query("SELECT id, name, source_id, enabled FROM channel_groups WHERE source_id = ? AND name = ?")
            .bind(source_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| ChannelGroup {
            id: row.get("id"),
            name: row.get("name"),
            source_id: row.get("source_id"),
            enabled: row.get("enabled"),
        }))
    }

    pub async fn list_groups(&self) -> AppResult<Vec<GroupListing>> {
        let rows = sqlx::query(
            "SELECT g.id, g.name, s.name AS source_name, g.enabled,
                    (SELECT COUNT(*) FROM channels c WHERE c.group_id = g.id) AS channel_count
             FROM channel_groups g
             JOIN upstream_sources s ON s.id = g.source_id
             ORDER BY s.name, g.name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| GroupListing {
                id: row.get("id"),
                name: row.get("name"),
                source_name: row.get("source_name"),
                enabled: row.get("enabled"),
                channel_count: row.get("channel_count"),
            })
            .collect())
    }

    pub async fn set_group_enabled(&self, id: i64, enabled: bool) -> AppResult<bool> {
        let result = sqlx::query("UPDATE channel_groups SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enabled channels of a group, ordered by name, ready for emission
    pub async fn list_playlist_channels(&self, group_id: i64) -> AppResult<Vec<PlaylistChannel>> {
        let rows = sqlx::query(
            "SELECT c.name, c.stream_url, c.tvg_id, c.tvg_name, i.url AS icon_url, g.name AS group_name
             FROM channels c
             JOIN channel_groups g ON g.id = c.group_id
             LEFT JOIN icons i ON i.id = c.icon_id
             WHERE c.group_id = ? AND c.enabled = 1
             ORDER BY c.name ASC, c.id ASC",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PlaylistChannel {
                name: row.get("name"),
                stream_url: row.get("stream_url"),
                tvg_id: row.get("tvg_id"),
                tvg_name: row.get("tvg_name"),
                icon_url: row.get("icon_url"),
                group_name: row.get("group_name"),
            })
            .collect())
    }

    pub async fn list_channels_for_source(&self, source_id: i64) -> AppResult<Vec<Channel>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM channels WHERE source_id = ? ORDER BY name, id",
            CHANNEL_COLUMNS
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(channel_from_row).collect())
    }

    pub async fn get_channel(&self, id: i64) -> AppResult<Option<Channel>> {
        let row = sqlx::query(&format!("SELECT {} FROM channels WHERE id = ?", CHANNEL_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(channel_from_row))
    }

    /// Operator edit of a channel's flags
    pub async fn update_channel(&self, id: i64, request: &ChannelUpdateRequest) -> AppResult<Option<Channel>> {
        sqlx::query(
            "UPDATE channels SET enabled = COALESCE(?, enabled), protected = COALESCE(?, protected) WHERE id = ?",
        )
        .bind(request.enabled)
        .bind(request.protected)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_channel(id).await
    }

    pub async fn get_icon_by_url(&self, url: &str) -> AppResult<Option<Icon>> {
        let row = sqlx::query("SELECT id, url, local_name, mime_hint, size_bytes, created_at FROM icons WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(icon_from_row))
    }

    pub async fn list_icons(&self) -> AppResult<Vec<Icon>> {
        let rows = sqlx::query("SELECT id, url, local_name, mime_hint, size_bytes, created_at FROM icons ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(icon_from_row).collect())
    }

    pub async fn record_icon_cached(
        &self,
        id: i64,
        local_name: &str,
        mime_hint: &str,
        size_bytes: i64,
    ) -> AppResult<()> {
        sqlx::query("UPDATE icons SET local_name = ?, mime_hint = ?, size_bytes = ? WHERE id = ?")
            .bind(local_name)
            .bind(mime_hint)
            .bind(size_bytes)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_all_icons(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM icons").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all_channels(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM channels").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Groups cascade to their channels
    pub async fn delete_all_groups(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM channel_groups").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
