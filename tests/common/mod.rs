#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iptv_manager::{
    config::Config,
    database::Database,
    errors::SourceError,
    ingestor::{
        AdmissionPolicy, IngestionStateManager, PlaylistFetcher, PlaylistStore,
        ReconciliationEngine,
    },
    models::{UpstreamSource, UpstreamSourceCreateRequest},
};

pub const PROVIDER_URL: &str = "http://provider.test/playlist.m3u";

pub const SAMPLE_PLAYLIST: &str = "#EXTM3U
#EXTINF:-1 tvg-id=\"alpha\" tvg-logo=\"http://logos.test/alpha.png\" group-title=\"News\",Alpha News
http://up.test/live/alpha.ts
#EXTINF:-1 group-title=\"Sports\",Beta Sports
#EXTVLCOPT:http-user-agent=Custom/1.0
http://up.test/live/beta.ts
#EXTINF:-1 group-title=\"Movies\",Gamma Movie
http://up.test/vod/gamma.mp4
";

/// Serves whatever body it currently holds and counts calls
pub struct StaticFetcher {
    body: Mutex<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(body: &str) -> Self {
        Self::with_delay(body, Duration::ZERO)
    }

    pub fn with_delay(body: &str, delay: Duration) -> Self {
        Self {
            body: Mutex::new(body.to_string()),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_body(&self, body: &str) {
        *self.body.lock().unwrap() = body.to_string();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaylistFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str, _user_agent: &str) -> Result<String, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.body.lock().unwrap().clone())
    }
}

pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.playlist_path = dir.join("playlists");
    config.storage.icon_path = dir.join("icons");
    config.web.base_url = "http://manager.test".to_string();
    config
}

pub fn engine(
    database: &Database,
    config: &Config,
    fetcher: Arc<dyn PlaylistFetcher>,
) -> ReconciliationEngine {
    let policy = AdmissionPolicy::from_config(&config.admission).unwrap();
    ReconciliationEngine::new(
        database.clone(),
        IngestionStateManager::new(),
        Arc::new(policy),
        fetcher,
        PlaylistStore::new(config.storage.playlist_path.clone()),
        config.ingestion.user_agent.clone(),
        2,
    )
}

pub fn source_request(name: &str, location: &str) -> UpstreamSourceCreateRequest {
    UpstreamSourceCreateRequest {
        name: name.to_string(),
        location: location.to_string(),
        is_local: false,
        group_exclusions: String::new(),
        user_agent: None,
        refresh_interval_hours: 24,
        enabled: true,
        max_concurrent_streams: 0,
    }
}

pub async fn create_source(database: &Database, request: UpstreamSourceCreateRequest) -> UpstreamSource {
    database.create_upstream_source(&request).await.unwrap()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
