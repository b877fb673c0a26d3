//! Begin/End accounting for stream sessions.
//!
//! The stream slot and the session row are taken together at admission
//! ([`super::AdmissionOracle::admit`]). Begin only completes the row; End
//! gives the slot back only when it removes that row, so every increment is
//! paired with exactly one decrement however the reports arrive.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::errors::AppResult;
use crate::models::*;

#[derive(Clone)]
pub struct SessionReporter {
    database: Database,
}

impl SessionReporter {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn handle(&self, report: &SessionReport) -> AppResult<()> {
        match report.action {
            SessionAction::Begin => self.begin(report).await,
            SessionAction::End => self.end(report).await,
        }
    }

    /// Remember the proxy and complete the reserved session row
    pub async fn begin(&self, report: &SessionReport) -> AppResult<()> {
        self.database.upsert_proxy(&report.proxy).await?;

        let key = report.session_key();
        let known = self
            .database
            .annotate_session(&key, report.user_agent.as_deref(), &report.proxy.name)
            .await?;
        if !known {
            warn!("Begin report for {} without an admitted session", key);
            return Ok(());
        }

        info!("Session started: {} on proxy '{}'", key, report.proxy.name);
        Ok(())
    }

    /// Release the source slot and fold the session into watch statistics
    pub async fn end(&self, report: &SessionReport) -> AppResult<()> {
        let key = report.session_key();
        let Some(session) = self.database.take_session(&key).await? else {
            warn!("End report for {} without a session row, counters unchanged", key);
            return Ok(());
        };

        let now = Utc::now();
        let duration_ms = (now - session.started_at).num_milliseconds().max(0);

        if let Some(source_id) = session.source_id {
            self.database.decrement_active_streams(source_id).await?;
        }

        if let Some(channel_id) = session.channel_id {
            self.database
                .accumulate_watch_stat(channel_id, &report.client, duration_ms, now)
                .await?;
        } else {
            debug!("No channel for {}, watch statistics unchanged", key);
        }

        info!("Session ended: {} after {}ms", key, duration_ms);
        Ok(())
    }
}
