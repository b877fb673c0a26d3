//! Upstream reconciliation: fetch (or reuse a fresh copy), filter excluded
//! groups, then merge the entries into the catalog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::admission_policy::AdmissionPolicy;
use super::group_filter::filter_groups;
use super::m3u_parser::{parse_entries, ParsedEntry};
use super::playlist_store::PlaylistStore;
use super::IngestionStateManager;
use crate::database::catalog::{ImportEntry, ImportStats};
use crate::database::Database;
use crate::errors::{AppError, AppResult, SourceError};
use crate::models::*;

/// Capability to download a remote playlist
#[async_trait]
pub trait PlaylistFetcher: Send + Sync {
    async fn fetch(&self, url: &str, user_agent: &str) -> Result<String, SourceError>;
}

pub struct HttpPlaylistFetcher {
    client: reqwest::Client,
}

impl HttpPlaylistFetcher {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PlaylistFetcher for HttpPlaylistFetcher {
    async fn fetch(&self, url: &str, user_agent: &str) -> Result<String, SourceError> {
        info!("Fetching upstream playlist: {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(url, &e))
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    database: Database,
    state_manager: IngestionStateManager,
    policy: Arc<AdmissionPolicy>,
    fetcher: Arc<dyn PlaylistFetcher>,
    store: PlaylistStore,
    default_user_agent: String,
    chunk_size: usize,
}

impl ReconciliationEngine {
    pub fn new(
        database: Database,
        state_manager: IngestionStateManager,
        policy: Arc<AdmissionPolicy>,
        fetcher: Arc<dyn PlaylistFetcher>,
        store: PlaylistStore,
        default_user_agent: String,
        chunk_size: usize,
    ) -> Self {
        Self {
            database,
            state_manager,
            policy,
            fetcher,
            store,
            default_user_agent,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn store(&self) -> &PlaylistStore {
        &self.store
    }

    pub fn state_manager(&self) -> &IngestionStateManager {
        &self.state_manager
    }

    /// Run one reconciliation cycle for a source. `force` bypasses the
    /// staleness check. A trigger arriving while the same source is already
    /// being reconciled is coalesced into the running cycle.
    pub async fn reconcile(&self, source_id: i64, force: bool) -> AppResult<ReconcileOutcome> {
        let source = self
            .database
            .get_upstream_source(source_id)
            .await?
            .ok_or_else(|| AppError::not_found("upstream source", source_id.to_string()))?;

        let Some(_guard) = self.state_manager.try_begin(source.id) else {
            info!(
                "Reconciliation of '{}' already in progress, coalescing trigger",
                source.name
            );
            return Ok(ReconcileOutcome::AlreadyRunning);
        };

        self.state_manager.start_ingestion(source.id, &source.name).await;

        match self.run(&source, force).await {
            Ok(outcome) => {
                if let ReconcileOutcome::Completed { entries, .. } = &outcome {
                    self.state_manager.complete_ingestion(source.id, *entries).await;
                }
                Ok(outcome)
            }
            Err(e) => {
                error!("Reconciliation of '{}' failed: {}", source.name, e);
                self.state_manager.set_error(source.id, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run(&self, source: &UpstreamSource, force: bool) -> AppResult<ReconcileOutcome> {
        let (text, fetched) = self.load_playlist(source, force).await?;

        let exclusions = source.exclusions();
        let text = if exclusions.is_empty() {
            text
        } else {
            self.state_manager
                .update_progress(
                    source.id,
                    IngestionState::Filtering,
                    format!("Removing {} excluded groups", exclusions.len()),
                    0,
                )
                .await;
            let filtered = filter_groups(&text, &exclusions);
            self.store.write_filtered(source.id, &filtered).await?;
            filtered
        };

        self.state_manager
            .update_progress(
                source.id,
                IngestionState::Importing,
                "Importing channels".to_string(),
                0,
            )
            .await;

        let disabled = self.database.disable_unprotected_channels(source.id).await?;
        info!(
            "Disabled {} unprotected channels of '{}' ahead of import",
            disabled, source.name
        );

        let seen_at = Utc::now();
        let mut totals = ImportStats::default();
        let mut entries = 0usize;
        let mut chunk: Vec<ParsedEntry> = Vec::with_capacity(self.chunk_size);

        for entry in parse_entries(&text) {
            chunk.push(entry);
            if chunk.len() >= self.chunk_size {
                entries += self.import_chunk(source, &chunk, seen_at, &mut totals).await?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            entries += self.import_chunk(source, &chunk, seen_at, &mut totals).await?;
        }

        self.database.mark_source_reconciled(source.id, Utc::now()).await?;
        info!(
            "Reconciled '{}': {} entries ({} new, {} existing)",
            source.name, entries, totals.created, totals.updated
        );

        Ok(ReconcileOutcome::Completed {
            entries,
            created: totals.created,
            updated: totals.updated,
            fetched,
        })
    }

    async fn import_chunk(
        &self,
        source: &UpstreamSource,
        chunk: &[ParsedEntry],
        seen_at: DateTime<Utc>,
        totals: &mut ImportStats,
    ) -> AppResult<usize> {
        let items: Vec<ImportEntry<'_>> = chunk
            .iter()
            .map(|entry| ImportEntry {
                entry,
                default_enabled: self.policy.default_enabled(&entry.stream_url),
            })
            .collect();

        let stats = self.database.import_entries(source.id, &items, seen_at).await?;
        totals.created += stats.created;
        totals.updated += stats.updated;

        let imported = totals.created + totals.updated;
        self.state_manager
            .update_progress(
                source.id,
                IngestionState::Importing,
                format!("Imported {} entries", imported),
                imported,
            )
            .await;

        Ok(items.len())
    }

    /// Returns the playlist text and whether it was freshly fetched
    async fn load_playlist(&self, source: &UpstreamSource, force: bool) -> AppResult<(String, bool)> {
        if source.is_local {
            let text = tokio::fs::read_to_string(&source.location)
                .await
                .map_err(|e| SourceError::local_file(&source.location, e.to_string()))?;
            return Ok((text, true));
        }

        if !force {
            let interval = Duration::from_secs(source.refresh_interval_hours.max(0) as u64 * 3600);
            if let Some(age) = self.store.raw_age(source.id).await {
                if age < interval {
                    if let Some(text) = self.store.read_raw(source.id).await {
                        info!(
                            "Using stored copy of '{}' ({}s old, refresh every {}h)",
                            source.name,
                            age.as_secs(),
                            source.refresh_interval_hours
                        );
                        return Ok((text, false));
                    }
                    warn!("Stored copy of '{}' unreadable, fetching", source.name);
                }
            }
        }

        let user_agent = source
            .user_agent
            .as_deref()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or(&self.default_user_agent);

        let text = self.fetcher.fetch(&source.location, user_agent).await?;
        self.store.write_raw(source.id, &text).await?;
        Ok((text, true))
    }
}
