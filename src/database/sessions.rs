use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::Database;
use crate::errors::AppResult;
use crate::models::*;
use crate::utils::{parse_datetime, DateTimeParser};

const SESSION_COLUMNS: &str =
    "id, session_key, stream_url, client_address, user_agent, channel_id, source_id, proxy_name, started_at";

fn session_from_row(row: &SqliteRow) -> StreamSession {
    StreamSession {
        id: row.get("id"),
        session_key: row.get("session_key"),
        stream_url: row.get("stream_url"),
        client_address: row.get("client_address"),
        user_agent: row.get("user_agent"),
        channel_id: row.get("channel_id"),
        source_id: row.get("source_id"),
        proxy_name: row.get("proxy_name"),
        started_at: parse_datetime(&row.get::<String, _>("started_at")),
    }
}

fn proxy_from_row(row: &SqliteRow) -> ProxyRegistration {
    ProxyRegistration {
        name: row.get("name"),
        internal_url: row.get("internal_url"),
        internal_port: row.get::<i64, _>("internal_port") as u16,
        external_url: row.get("external_url"),
        external_port: row.get::<i64, _>("external_port") as u16,
    }
}

/// Fields of a new session row
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub session_key: &'a str,
    pub stream_url: &'a str,
    pub client_address: &'a str,
    pub channel_id: i64,
    pub source_id: i64,
    pub proxy_name: &'a str,
    pub started_at: DateTime<Utc>,
}

/// Result of asking for a stream slot on a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotReservation {
    /// Counter incremented and session row created
    Reserved,
    /// A row for the same identity already held a slot; it now belongs to
    /// the new session
    Inherited,
    /// The source is at `max_concurrent_streams`
    Full,
}

impl Database {
    pub async fn upsert_proxy(&self, proxy: &ProxyRegistration) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO proxies (name, internal_url, internal_port, external_url, external_port, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                internal_url = excluded.internal_url,
                internal_port = excluded.internal_port,
                external_url = excluded.external_url,
                external_port = excluded.external_port,
                updated_at = excluded.updated_at",
        )
        .bind(&proxy.name)
        .bind(&proxy.internal_url)
        .bind(proxy.internal_port as i64)
        .bind(&proxy.external_url)
        .bind(proxy.external_port as i64)
        .bind(DateTimeParser::format_for_storage(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_proxy(&self, name: &str) -> AppResult<Option<ProxyRegistration>> {
        let row = sqlx::query(
            "SELECT name, internal_url, internal_port, external_url, external_port FROM proxies WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(proxy_from_row))
    }

    pub async fn list_proxies(&self) -> AppResult<Vec<ProxyRegistration>> {
        let rows = sqlx::query(
            "SELECT name, internal_url, internal_port, external_url, external_port FROM proxies ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(proxy_from_row).collect())
    }

    /// Take one stream slot of `session.source_id` and open the session row,
    /// in one transaction. The row is the token that the matching End
    /// gives back through [`Database::take_session`].
    pub async fn reserve_stream_slot(&self, session: &NewSession<'_>) -> AppResult<SlotReservation> {
        let started_at = DateTimeParser::format_for_storage(&session.started_at);
        let mut tx = self.pool.begin().await?;

        let inherited = sqlx::query(
            "UPDATE sessions SET started_at = ?, proxy_name = ? WHERE session_key = ?",
        )
        .bind(&started_at)
        .bind(session.proxy_name)
        .bind(session.session_key)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if inherited {
            tx.commit().await?;
            return Ok(SlotReservation::Inherited);
        }

        let taken = sqlx::query(
            "UPDATE upstream_sources SET active_stream_count = active_stream_count + 1
             WHERE id = ? AND (max_concurrent_streams = 0 OR active_stream_count < max_concurrent_streams)",
        )
        .bind(session.source_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if !taken {
            tx.rollback().await?;
            return Ok(SlotReservation::Full);
        }

        sqlx::query(
            "INSERT INTO sessions (session_key, stream_url, client_address,
             channel_id, source_id, proxy_name, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.session_key)
        .bind(session.stream_url)
        .bind(session.client_address)
        .bind(session.channel_id)
        .bind(session.source_id)
        .bind(session.proxy_name)
        .bind(&started_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SlotReservation::Reserved)
    }

    /// Fill in what the Begin report knows about a reserved session.
    /// Returns `false` when no row exists for the identity.
    pub async fn annotate_session(
        &self,
        session_key: &str,
        user_agent: Option<&str>,
        proxy_name: &str,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET user_agent = COALESCE(?, user_agent), proxy_name = ? WHERE session_key = ?",
        )
        .bind(user_agent)
        .bind(proxy_name)
        .bind(session_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove and return the session row for an identity
    pub async fn take_session(&self, session_key: &str) -> AppResult<Option<StreamSession>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE session_key = ?",
            SESSION_COLUMNS
        ))
        .bind(session_key)
        .fetch_optional(&mut *tx)
        .await?;

        let session = row.as_ref().map(session_from_row);
        if let Some(session) = &session {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(session.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: i64) -> AppResult<Option<StreamSession>> {
        let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(session_from_row))
    }

    pub async fn list_sessions(&self) -> AppResult<Vec<StreamSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions ORDER BY started_at",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(session_from_row).collect())
    }

    /// Add one finished session to the (channel, client) statistics
    pub async fn accumulate_watch_stat(
        &self,
        channel_id: i64,
        client_address: &str,
        duration_ms: i64,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO watch_stats (channel_id, client_address, cumulative_watch_ms, last_session_ms, last_accessed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, client_address) DO UPDATE SET
                cumulative_watch_ms = cumulative_watch_ms + excluded.last_session_ms,
                last_session_ms = excluded.last_session_ms,
                last_accessed_at = excluded.last_accessed_at",
        )
        .bind(channel_id)
        .bind(client_address)
        .bind(duration_ms)
        .bind(duration_ms)
        .bind(DateTimeParser::format_for_storage(&at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_watch_stats(&self) -> AppResult<Vec<WatchStat>> {
        let rows = sqlx::query(
            "SELECT w.channel_id, c.name AS channel_name, w.client_address, w.cumulative_watch_ms,
                    w.last_session_ms, w.last_accessed_at
             FROM watch_stats w
             JOIN channels c ON c.id = w.channel_id
             ORDER BY w.cumulative_watch_ms DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| WatchStat {
                channel_id: row.get("channel_id"),
                channel_name: row.get("channel_name"),
                client_address: row.get("client_address"),
                cumulative_watch_ms: row.get("cumulative_watch_ms"),
                last_session_ms: row.get("last_session_ms"),
                last_accessed_at: parse_datetime(&row.get::<String, _>("last_accessed_at")),
            })
            .collect())
    }

    pub async fn delete_all_watch_stats(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM watch_stats").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
