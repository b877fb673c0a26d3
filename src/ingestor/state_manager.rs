use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::models::*;

pub type ProgressSender = broadcast::Sender<IngestionProgress>;
pub type ProgressReceiver = broadcast::Receiver<IngestionProgress>;

/// Tracks reconciliation progress per source and guarantees that at most
/// one run per source is in flight.
#[derive(Clone)]
pub struct IngestionStateManager {
    states: Arc<RwLock<HashMap<i64, IngestionProgress>>>,
    running: Arc<Mutex<HashSet<i64>>>,
    progress_tx: ProgressSender,
}

fn lock_running(running: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held for the duration of a run; releases the source on drop
pub struct IngestionGuard {
    source_id: i64,
    running: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for IngestionGuard {
    fn drop(&mut self) {
        lock_running(&self.running).remove(&self.source_id);
    }
}

impl IngestionStateManager {
    pub fn new() -> Self {
        let (progress_tx, _) = broadcast::channel(1000);
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashSet::new())),
            progress_tx,
        }
    }

    pub fn subscribe(&self) -> ProgressReceiver {
        self.progress_tx.subscribe()
    }

    /// Claim the source for a run. `None` when a run is already in flight.
    pub fn try_begin(&self, source_id: i64) -> Option<IngestionGuard> {
        let mut running = lock_running(&self.running);
        if !running.insert(source_id) {
            debug!("Reconciliation for source {} already running", source_id);
            return None;
        }
        Some(IngestionGuard {
            source_id,
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self, source_id: i64) -> bool {
        lock_running(&self.running).contains(&source_id)
    }

    pub async fn start_ingestion(&self, source_id: i64, source_name: &str) {
        let now = Utc::now();
        let progress = IngestionProgress {
            source_id,
            source_name: source_name.to_string(),
            state: IngestionState::Fetching,
            current_step: "Fetching playlist".to_string(),
            entries_imported: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        };

        self.states.write().await.insert(source_id, progress.clone());
        let _ = self.progress_tx.send(progress);
    }

    pub async fn update_progress(
        &self,
        source_id: i64,
        state: IngestionState,
        current_step: String,
        entries_imported: usize,
    ) {
        let updated = {
            let mut states = self.states.write().await;
            let Some(progress) = states.get_mut(&source_id) else {
                return;
            };
            if matches!(state, IngestionState::Completed | IngestionState::Error) {
                progress.completed_at = Some(Utc::now());
            }
            progress.state = state;
            progress.current_step = current_step;
            progress.entries_imported = entries_imported;
            progress.updated_at = Utc::now();
            progress.clone()
        };

        let _ = self.progress_tx.send(updated);
    }

    pub async fn set_error(&self, source_id: i64, error: String) {
        let updated = {
            let mut states = self.states.write().await;
            let Some(progress) = states.get_mut(&source_id) else {
                return;
            };
            progress.state = IngestionState::Error;
            progress.current_step = "Failed".to_string();
            progress.error = Some(error);
            progress.updated_at = Utc::now();
            progress.completed_at = Some(Utc::now());
            progress.clone()
        };

        let _ = self.progress_tx.send(updated);
    }

    pub async fn complete_ingestion(&self, source_id: i64, entries_imported: usize) {
        self.update_progress(
            source_id,
            IngestionState::Completed,
            format!("Completed - {} entries imported", entries_imported),
            entries_imported,
        )
        .await;
    }

    pub async fn get_progress(&self, source_id: i64) -> Option<IngestionProgress> {
        self.states.read().await.get(&source_id).cloned()
    }

    pub async fn get_all_progress(&self) -> HashMap<i64, IngestionProgress> {
        self.states.read().await.clone()
    }

    pub async fn cleanup_completed(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        self.states
            .write()
            .await
            .retain(|_, progress| match progress.completed_at {
                Some(completed_at) => completed_at > cutoff,
                None => true,
            });
    }
}

impl Default for IngestionStateManager {
    fn default() -> Self {
        Self::new()
    }
}
