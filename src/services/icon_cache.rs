use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::errors::{AppError, AppResult, SourceError};

/// An icon ready to serve
#[derive(Debug, Clone)]
pub struct CachedIcon {
    pub bytes: Bytes,
    pub mime: String,
}

/// Fetches catalog icons on first request and serves them from disk after
#[derive(Clone)]
pub struct IconCache {
    database: Database,
    client: reqwest::Client,
    root: PathBuf,
    user_agent: String,
}

impl IconCache {
    pub fn new(database: Database, root: PathBuf, timeout: Duration, user_agent: String) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            database,
            client,
            root,
            user_agent,
        })
    }

    /// Only URLs known to the catalog are served
    pub async fn get(&self, url: &str) -> AppResult<CachedIcon> {
        let icon = self
            .database
            .get_icon_by_url(url)
            .await?
            .ok_or_else(|| AppError::not_found("icon", url))?;

        if let Some(local_name) = &icon.local_name {
            match tokio::fs::read(self.root.join(local_name)).await {
                Ok(bytes) => {
                    debug!("Serving cached icon {}", local_name);
                    return Ok(CachedIcon {
                        bytes: Bytes::from(bytes),
                        mime: icon
                            .mime_hint
                            .clone()
                            .unwrap_or_else(|| "application/octet-stream".to_string()),
                    });
                }
                Err(e) => warn!("Cached icon {} unreadable, refetching: {}", local_name, e),
            }
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SourceError::from_reqwest(url, &e))?;

        let local_name = format!("icon_{}.{}", icon.id, extension_for(&mime, url));
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(&local_name), &bytes).await?;
        self.database
            .record_icon_cached(icon.id, &local_name, &mime, bytes.len() as i64)
            .await?;

        info!("Cached icon {} as {} ({} bytes)", url, local_name, bytes.len());
        Ok(CachedIcon { bytes, mime })
    }

    /// Delete every cached file and icon row
    pub async fn purge(&self) -> AppResult<u64> {
        for icon in self.database.list_icons().await? {
            let Some(local_name) = icon.local_name else {
                continue;
            };
            if let Err(e) = tokio::fs::remove_file(self.root.join(&local_name)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove cached icon {}: {}", local_name, e);
                }
            }
        }
        let removed = self.database.delete_all_icons().await?;
        info!("Purged {} icons", removed);
        Ok(removed)
    }
}

fn extension_for(mime: &str, url: &str) -> String {
    let known = match mime {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some("ico"),
        _ => None,
    };
    if let Some(ext) = known {
        return ext.to_string();
    }

    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|last| {
            last.rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "img".to_string())
}
