//! Web layer
//!
//! Two route groups share one server:
//! - **Manager routes**: admission/opts/report endpoints used by proxies,
//!   catalog serving (`/get/...`) and the admin API under `/api/v1`.
//! - **Proxy routes**: `/stream/start` and `/stream/stop`.
//!
//! Which groups are mounted depends on the process role.

use anyhow::Result;
use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::Config,
    database::Database,
    errors::AppResult,
    ingestor::{
        scheduler::{create_cache_invalidation_channel, CacheInvalidationSender},
        AdmissionPolicy, HttpPlaylistFetcher, IngestionStateManager, PlaylistStore,
        ReconciliationEngine,
    },
    proxy::PlaylistGenerator,
    services::{AdmissionOracle, IconCache, SessionReporter},
    streaming::{ManagementPlane, SessionRegistry, StreamSessionManager},
};

pub mod api;
pub mod extractors;
pub mod handlers;
pub mod responses;

/// State of the management plane routes
#[derive(Clone)]
pub struct ManagerState {
    pub config: Arc<Config>,
    pub database: Database,
    pub engine: ReconciliationEngine,
    pub oracle: AdmissionOracle,
    pub reporter: SessionReporter,
    pub generator: PlaylistGenerator,
    pub icons: IconCache,
    pub cache_invalidation_tx: CacheInvalidationSender,
    /// Present when a proxy runs in the same process
    pub local_sessions: Option<Arc<StreamSessionManager>>,
    /// Client used to reach remote proxies for forced stops
    pub http: reqwest::Client,
}

impl ManagerState {
    pub fn new(
        config: Arc<Config>,
        database: Database,
        policy: Arc<AdmissionPolicy>,
        local_sessions: Option<Arc<StreamSessionManager>>,
    ) -> AppResult<Self> {
        let fetcher = Arc::new(HttpPlaylistFetcher::new(config.ingestion.playlist_timeout())?);
        let engine = ReconciliationEngine::new(
            database.clone(),
            IngestionStateManager::new(),
            policy,
            fetcher,
            PlaylistStore::new(config.storage.playlist_path.clone()),
            config.ingestion.user_agent.clone(),
            config.ingestion.import_chunk_size,
        );
        Self::with_engine(config, database, engine, local_sessions)
    }

    /// Build around an existing engine (custom fetchers in tests)
    pub fn with_engine(
        config: Arc<Config>,
        database: Database,
        engine: ReconciliationEngine,
        local_sessions: Option<Arc<StreamSessionManager>>,
    ) -> AppResult<Self> {
        let (cache_invalidation_tx, _) = create_cache_invalidation_channel();
        let generator = PlaylistGenerator::new(
            database.clone(),
            config.web.base_url.clone(),
            config.proxy.identity(),
        );
        let icons = IconCache::new(
            database.clone(),
            config.storage.icon_path.clone(),
            config.ingestion.icon_timeout(),
            config.ingestion.user_agent.clone(),
        )?;
        let http = reqwest::Client::builder()
            .timeout(config.proxy.management_timeout())
            .build()?;

        Ok(Self {
            oracle: AdmissionOracle::new(database.clone()),
            reporter: SessionReporter::new(database.clone()),
            config,
            database,
            engine,
            generator,
            icons,
            cache_invalidation_tx,
            local_sessions,
            http,
        })
    }
}

/// State of the stream proxy routes
#[derive(Clone)]
pub struct ProxyState {
    pub sessions: Arc<StreamSessionManager>,
}

impl ProxyState {
    pub fn new(config: &Config, management: Arc<dyn ManagementPlane>) -> AppResult<Self> {
        let sessions = StreamSessionManager::new(
            Arc::new(SessionRegistry::new()),
            management,
            config.proxy.identity(),
            config.proxy.user_agent.clone(),
            config.proxy.stream_connect_timeout(),
            config.proxy.reporting_timeout(),
        )?;
        Ok(Self {
            sessions: Arc::new(sessions),
        })
    }
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, manager: Option<ManagerState>, proxy: Option<ProxyState>) -> Result<Self> {
        let app = create_router(manager, proxy);
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self { app, addr })
    }

    /// Start the web server
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("Listening on http://{}", self.addr);
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Router for the given role. Identities in paths are base64 and may
/// contain `/`, hence the wildcard segments.
pub fn create_router(manager: Option<ManagerState>, proxy: Option<ProxyState>) -> Router {
    let mut router = Router::new().route("/health", get(handlers::health));

    if let Some(state) = manager {
        router = router.merge(
            Router::new()
                .route("/status/*identity", get(handlers::manager::admission_status))
                .route("/opts/*identity", get(handlers::manager::channel_opts))
                .route("/report", get(handlers::manager::session_report))
                .route("/get/icon/*identity", get(handlers::manager::get_icon))
                .route("/get/playlist/:name", get(handlers::manager::get_playlist))
                .route("/get/upstream/:name", get(handlers::manager::get_upstream))
                .route(
                    "/get/upstream/:name/filtered",
                    get(handlers::manager::get_upstream_filtered),
                )
                .nest("/api/v1", api_v1_routes())
                .with_state(state),
        );
    }

    if let Some(state) = proxy {
        router = router.merge(
            Router::new()
                .route("/stream/start/*identity", get(handlers::stream::start_stream))
                .route("/stream/stop/*identity", get(handlers::stream::stop_stream))
                .route("/stream/sessions", get(handlers::stream::list_live_sessions))
                .with_state(state),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn api_v1_routes() -> Router<ManagerState> {
    Router::new()
        // Upstream sources
        .route("/sources", get(api::list_sources).post(api::create_source))
        .route(
            "/sources/:id",
            get(api::get_source)
                .patch(api::update_source)
                .delete(api::delete_source),
        )
        .route("/sources/:id/refresh", post(api::refresh_source))
        .route("/sources/:id/channels", get(api::list_source_channels))
        // Catalog
        .route("/channels", delete(api::purge_channels))
        .route("/channels/:id", get(api::get_channel).patch(api::update_channel))
        .route("/groups", get(api::list_groups).delete(api::purge_groups))
        .route("/groups/export", get(api::export_groups))
        .route("/groups/:id", patch(api::update_group))
        .route("/icons", delete(api::purge_icons))
        // Downstream playlists
        .route(
            "/downstream",
            get(api::list_downstream).post(api::create_downstream),
        )
        .route("/downstream/:id", delete(api::delete_downstream))
        // Sessions and statistics
        .route("/sessions", get(api::list_sessions))
        .route("/sessions/:id/stop", post(api::stop_session))
        .route("/stats", get(api::list_watch_stats).delete(api::purge_watch_stats))
        .route("/proxies", get(api::list_proxies))
        .route("/progress", get(api::get_progress))
}
