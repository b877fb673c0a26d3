//! On-disk copies of fetched upstream playlists
//!
//! The raw copy doubles as the staleness marker: its modification time is
//! the time of the last successful fetch.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct PlaylistStore {
    root: PathBuf,
}

impl PlaylistStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn raw_path(&self, source_id: i64) -> PathBuf {
        self.root.join(format!("source_{}.m3u", source_id))
    }

    fn filtered_path(&self, source_id: i64) -> PathBuf {
        self.root.join(format!("source_{}_filtered.m3u", source_id))
    }

    /// Time since the last successful fetch, if a copy exists
    pub async fn raw_age(&self, source_id: i64) -> Option<Duration> {
        let metadata = tokio::fs::metadata(self.raw_path(source_id)).await.ok()?;
        let modified = metadata.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    pub async fn write_raw(&self, source_id: i64, text: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.raw_path(source_id), text).await
    }

    pub async fn write_filtered(&self, source_id: i64, text: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.filtered_path(source_id), text).await
    }

    pub async fn read_raw(&self, source_id: i64) -> Option<String> {
        tokio::fs::read_to_string(self.raw_path(source_id)).await.ok()
    }

    pub async fn read_filtered(&self, source_id: i64) -> Option<String> {
        tokio::fs::read_to_string(self.filtered_path(source_id)).await.ok()
    }

    /// Forget both copies of a source
    pub async fn remove(&self, source_id: i64) {
        for path in [self.raw_path(source_id), self.filtered_path(source_id)] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}
