use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use super::reconcile::ReconciliationEngine;
use crate::database::Database;
use crate::models::*;

pub type CacheInvalidationSender = broadcast::Sender<()>;
pub type CacheInvalidationReceiver = broadcast::Receiver<()>;

pub fn create_cache_invalidation_channel() -> (CacheInvalidationSender, CacheInvalidationReceiver) {
    broadcast::channel(100)
}

/// Completed progress entries older than this are dropped
const PROGRESS_RETENTION_HOURS: i64 = 24;

/// Periodically reconciles enabled sources whose refresh interval elapsed.
/// Runs are spawned, so a slow source never delays the others; concurrent
/// triggers for one source are coalesced by the engine.
///
/// A failed scheduled run is not retried on the next tick: the source sits
/// out one refresh interval. Manual refreshes are unaffected.
pub struct SchedulerService {
    engine: ReconciliationEngine,
    database: Database,
    tick: Duration,
    run_missed_immediately: bool,
    cached_sources: Arc<RwLock<HashMap<i64, UpstreamSource>>>,
    /// Failed sources and when the scheduler may try them again
    retry_after: Arc<RwLock<HashMap<i64, DateTime<Utc>>>>,
    last_cache_refresh: Arc<RwLock<DateTime<Utc>>>,
    cache_invalidation_rx: Option<CacheInvalidationReceiver>,
}

impl SchedulerService {
    pub fn new(
        engine: ReconciliationEngine,
        database: Database,
        tick: Duration,
        run_missed_immediately: bool,
        cache_invalidation_rx: Option<CacheInvalidationReceiver>,
    ) -> Self {
        Self {
            engine,
            database,
            tick: tick.max(Duration::from_secs(1)),
            run_missed_immediately,
            cached_sources: Arc::new(RwLock::new(HashMap::new())),
            retry_after: Arc::new(RwLock::new(HashMap::new())),
            last_cache_refresh: Arc::new(RwLock::new(Utc::now())),
            cache_invalidation_rx,
        }
    }

    pub async fn start(mut self) -> Result<()> {
        info!("Starting scheduler service (tick {}s)", self.tick.as_secs());

        if let Err(e) = self.refresh_cache().await {
            error!("Failed to load initial cache: {}", e);
            return Err(e);
        }

        self.log_startup_schedule().await;

        if !self.run_missed_immediately {
            // Spread the first pass so several instances do not hit upstreams together
            let jitter = Duration::from_millis(fastrand::u64(0..=self.tick.as_millis() as u64));
            debug!("Delaying first scheduler pass by {}ms", jitter.as_millis());
            tokio::time::sleep(jitter).await;
        }

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!("Scheduler tick");

                    if self.should_refresh_cache().await {
                        debug!("Refreshing scheduler cache (periodic refresh)");
                        if let Err(e) = self.refresh_cache().await {
                            error!("Failed to refresh cache: {}", e);
                        }
                    }

                    self.spawn_due_sources().await;
                    self.engine
                        .state_manager()
                        .cleanup_completed(PROGRESS_RETENTION_HOURS)
                        .await;
                }
                _ = self.receive_cache_invalidation(), if self.cache_invalidation_rx.is_some() => {
                    debug!("Received cache invalidation signal");
                    if let Err(e) = self.refresh_cache().await {
                        error!("Failed to refresh cache after invalidation: {}", e);
                    }
                }
            }
        }
    }

    async fn receive_cache_invalidation(&mut self) {
        if let Some(rx) = &mut self.cache_invalidation_rx {
            let _ = rx.recv().await;
        } else {
            std::future::pending::<()>().await;
        }
    }

    async fn refresh_cache(&self) -> Result<()> {
        let sources = self.database.list_upstream_sources().await?;
        let now = Utc::now();

        let mut cache = self.cached_sources.write().await;
        cache.clear();
        for source in sources.into_iter().filter(|s| s.enabled) {
            cache.insert(source.id, source);
        }

        *self.last_cache_refresh.write().await = now;
        info!("Cached {} enabled upstream sources", cache.len());
        Ok(())
    }

    async fn should_refresh_cache(&self) -> bool {
        let last_refresh = *self.last_cache_refresh.read().await;
        Utc::now().signed_duration_since(last_refresh).num_minutes() >= 5
    }

    async fn log_startup_schedule(&self) {
        let cache = self.cached_sources.read().await;
        let now = Utc::now();

        for source in cache.values() {
            match source.last_reconciled_at {
                Some(last) => {
                    let next = last + chrono::Duration::hours(source.refresh_interval_hours);
                    if next <= now {
                        info!(
                            "Source '{}' (ID: {}) is overdue since {}",
                            source.name,
                            source.id,
                            next.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                    } else {
                        info!(
                            "Source '{}' (ID: {}) - Next scheduled refresh: {}",
                            source.name,
                            source.id,
                            next.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                    }
                }
                None => info!(
                    "Source '{}' (ID: {}) has never been reconciled",
                    source.name, source.id
                ),
            }
        }
    }

    /// Cached sources that are due, idle and not sitting out a failure
    async fn due_sources(&self, now: DateTime<Utc>) -> Vec<UpstreamSource> {
        let retry_after = self.retry_after.read().await;
        let cache = self.cached_sources.read().await;
        cache
            .values()
            .filter(|s| s.is_due(now) && !self.engine.state_manager().is_running(s.id))
            .filter(|s| match retry_after.get(&s.id) {
                Some(until) if *until > now => {
                    trace!("Source '{}' failed earlier, next attempt at {}", s.name, until);
                    false
                }
                _ => true,
            })
            .cloned()
            .collect()
    }

    async fn spawn_due_sources(&self) {
        for source in self.due_sources(Utc::now()).await {
            tokio::spawn(self.scheduled_run(source));
        }
    }

    /// One scheduled reconciliation. On success the cached timestamp is
    /// refreshed; on failure the source is held back for one interval.
    fn scheduled_run(&self, source: UpstreamSource) -> impl Future<Output = ()> + Send + 'static {
        let engine = self.engine.clone();
        let database = self.database.clone();
        let cached_sources = self.cached_sources.clone();
        let retry_after = self.retry_after.clone();

        async move {
            match engine.reconcile(source.id, false).await {
                Ok(outcome) => {
                    debug!("Scheduled reconciliation of '{}': {:?}", source.name, outcome);
                    retry_after.write().await.remove(&source.id);
                    if let Ok(Some(updated)) = database.get_upstream_source(source.id).await {
                        let next = updated.last_reconciled_at.map(|at| {
                            at + chrono::Duration::hours(updated.refresh_interval_hours)
                        });
                        if let Some(next) = next {
                            info!(
                                "Scheduled refresh completed for '{}' - Next update: {}",
                                updated.name,
                                next.format("%Y-%m-%d %H:%M:%S UTC")
                            );
                        }
                        cached_sources.write().await.insert(updated.id, updated);
                    }
                }
                Err(e) => {
                    let until = Utc::now() + chrono::Duration::hours(source.refresh_interval_hours.max(1));
                    error!(
                        "Scheduled reconciliation failed for source '{}': {} (next attempt {})",
                        source.name,
                        e,
                        until.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                    retry_after.write().await.insert(source.id, until);
                }
            }
        }
    }
}
