use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::ProxyRegistration;

/// Default user agent presented to upstream providers when neither the
/// source nor the channel specifies one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/50.0.2661.102 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    pub admission: AdmissionConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL of the management plane, used when
    /// rewriting icon URLs in downstream playlists.
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Raw and filtered copies of fetched upstream playlists
    pub playlist_path: PathBuf,
    /// Cached channel icons
    pub icon_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub playlist_timeout_secs: u64,
    pub icon_timeout_secs: u64,
    pub user_agent: String,
    /// How often the scheduler looks for sources due a refresh
    pub scheduler_interval_secs: u64,
    pub run_missed_immediately: bool,
    /// Number of entries imported per database transaction
    pub import_chunk_size: usize,
}

/// Operator supplied lists deciding the default `enabled` flag of newly
/// discovered channels. Compiled once into an `AdmissionPolicy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub allowed_schemes: Vec<String>,
    pub blocked_path_suffixes: Vec<String>,
    pub blocked_url_regexes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub internal_url: String,
    pub internal_port: u16,
    pub external_url: String,
    pub external_port: u16,
    /// Management plane base URL, used when running with `--role proxy`
    pub management_url: String,
    pub management_timeout_secs: u64,
    pub reporting_timeout_secs: u64,
    pub stream_connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./iptv-manager.db".to_string(),
                max_connections: Some(10),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8088,
                base_url: "http://localhost:8088".to_string(),
            },
            storage: StorageConfig {
                playlist_path: PathBuf::from("./data/playlists"),
                icon_path: PathBuf::from("./data/icons"),
            },
            ingestion: IngestionConfig {
                playlist_timeout_secs: 120,
                icon_timeout_secs: 15,
                user_agent: DEFAULT_USER_AGENT.to_string(),
                scheduler_interval_secs: 60,
                run_missed_immediately: true,
                import_chunk_size: 500,
            },
            admission: AdmissionConfig {
                allowed_schemes: vec!["http".to_string(), "https".to_string()],
                blocked_path_suffixes: vec![".mkv".to_string(), ".mp4".to_string(), ".avi".to_string()],
                blocked_url_regexes: Vec::new(),
            },
            proxy: ProxyConfig {
                name: "IPTV-Proxy".to_string(),
                internal_url: "http://localhost".to_string(),
                internal_port: 8088,
                external_url: "http://localhost".to_string(),
                external_port: 8088,
                management_url: "http://localhost:8088".to_string(),
                management_timeout_secs: 1,
                reporting_timeout_secs: 5,
                stream_connect_timeout_secs: 15,
                user_agent: DEFAULT_USER_AGENT.to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration: built-in defaults, then the TOML file, then
    /// `IPTV__SECTION__KEY` environment variables. A default file is written
    /// when none exists.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let defaults = Self::default();

        if !path.exists() {
            let contents = toml::to_string_pretty(&defaults)?;
            std::fs::write(path, contents)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        }

        let loaded: Self = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("IPTV")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        std::fs::create_dir_all(&loaded.storage.playlist_path)?;
        std::fs::create_dir_all(&loaded.storage.icon_path)?;

        Ok(loaded)
    }
}

impl IngestionConfig {
    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_timeout_secs)
    }

    pub fn icon_timeout(&self) -> Duration {
        Duration::from_secs(self.icon_timeout_secs)
    }
}

impl ProxyConfig {
    pub fn management_timeout(&self) -> Duration {
        Duration::from_secs(self.management_timeout_secs)
    }

    pub fn reporting_timeout(&self) -> Duration {
        Duration::from_secs(self.reporting_timeout_secs)
    }

    pub fn stream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_connect_timeout_secs)
    }

    /// How this proxy announces itself in session reports
    pub fn identity(&self) -> ProxyRegistration {
        ProxyRegistration {
            name: self.name.clone(),
            internal_url: self.internal_url.clone(),
            internal_port: self.internal_port,
            external_url: self.external_url.clone(),
            external_port: self.external_port,
        }
    }
}
