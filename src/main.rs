use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_manager::{
    config::Config,
    database::Database,
    ingestor::{AdmissionPolicy, SchedulerService},
    services::{AdmissionOracle, SessionReporter},
    streaming::{LocalManagementPlane, ManagementPlane, RemoteManagementPlane},
    web::{ManagerState, ProxyState, WebServer},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Management plane and stream proxy in one process
    All,
    /// Catalog, admission, reporting and admin API only
    Manager,
    /// Stream relay talking to a remote management plane
    Proxy,
}

#[derive(Parser)]
#[command(name = "iptv-manager")]
#[command(version)]
#[command(about = "IPTV playlist aggregator with an admission-controlled stream relay")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Which planes this process runs
    #[arg(short, long, value_enum, default_value_t = Role::All)]
    role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("iptv_manager={},tower_http=trace", cli.log_level)
    } else {
        format!("iptv_manager={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting IPTV manager v{} ({:?} role)",
        env!("CARGO_PKG_VERSION"),
        cli.role
    );

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    let config = Arc::new(config);

    let database = match cli.role {
        Role::All | Role::Manager => {
            info!("Using database: {}", config.database.url);
            let database = Database::new(&config.database).await?;
            database.migrate().await?;
            database.reset_session_state().await?;
            info!("Database connection established and migrations applied");
            Some(database)
        }
        Role::Proxy => None,
    };

    let proxy_state = match (cli.role, &database) {
        (Role::Manager, _) => None,
        (Role::All, Some(database)) => {
            let plane: Arc<dyn ManagementPlane> = Arc::new(LocalManagementPlane::new(
                AdmissionOracle::new(database.clone()),
                SessionReporter::new(database.clone()),
            ));
            Some(ProxyState::new(&config, plane)?)
        }
        _ => {
            info!("Using management plane at {}", config.proxy.management_url);
            let plane: Arc<dyn ManagementPlane> = Arc::new(RemoteManagementPlane::new(
                &config.proxy.management_url,
                config.proxy.management_timeout(),
                config.proxy.reporting_timeout(),
            )?);
            Some(ProxyState::new(&config, plane)?)
        }
    };

    let manager_state = match database {
        Some(database) => {
            let policy = Arc::new(AdmissionPolicy::from_config(&config.admission)?);
            let local_sessions = proxy_state.as_ref().map(|p| p.sessions.clone());
            let state = ManagerState::new(config.clone(), database.clone(), policy, local_sessions)?;

            let scheduler = SchedulerService::new(
                state.engine.clone(),
                database,
                std::time::Duration::from_secs(config.ingestion.scheduler_interval_secs),
                config.ingestion.run_missed_immediately,
                Some(state.cache_invalidation_tx.subscribe()),
            );
            tokio::spawn(async move {
                if let Err(e) = scheduler.start().await {
                    tracing::error!("Scheduler service failed: {}", e);
                }
            });
            Some(state)
        }
        None => None,
    };

    let web_server = WebServer::new(&config, manager_state, proxy_state)?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve().await?;

    Ok(())
}
