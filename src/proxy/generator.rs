use tracing::{debug, info, warn};

use super::filter_engine::ChannelNameFilter;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::*;
use crate::utils::{encode_identity, join_url_port};

/// Assembles downstream playlists from the catalog
#[derive(Clone)]
pub struct PlaylistGenerator {
    database: Database,
    /// External base URL of the management plane, used for icon links
    icon_base_url: String,
    /// Proxy used when a playlist names none, or names one never registered
    fallback_proxy: ProxyRegistration,
}

impl PlaylistGenerator {
    pub fn new(database: Database, icon_base_url: String, fallback_proxy: ProxyRegistration) -> Self {
        Self {
            database,
            icon_base_url: icon_base_url.trim_end_matches('/').to_string(),
            fallback_proxy,
        }
    }

    /// Render the named playlist. Unknown or disabled playlists are NotFound.
    pub async fn generate(&self, name: &str) -> AppResult<String> {
        let playlist = self
            .database
            .get_downstream_playlist_by_name(name)
            .await?
            .filter(|p| p.enabled)
            .ok_or_else(|| AppError::not_found("downstream playlist", name))?;

        let proxy = self.resolve_proxy(&playlist).await?;
        let stream_base = format!(
            "{}/stream/start/",
            join_url_port(&proxy.external_url, proxy.external_port)
        );

        let mut m3u = String::from("#EXTM3U\n");
        let mut emitted = 0usize;

        for group_ref in playlist.group_refs() {
            let Some(channels) = self.resolve_group_channels(&group_ref).await? else {
                continue;
            };

            for channel in channels {
                self.push_entry(&mut m3u, &channel, &stream_base);
                emitted += 1;
            }
        }

        let filter = ChannelNameFilter::new(playlist.filter_mode, playlist.name_filters());
        let output = filter.apply(&m3u);

        info!(
            "Generated downstream playlist '{}' with {} channels before name filtering",
            playlist.name, emitted
        );
        Ok(output)
    }

    async fn resolve_proxy(&self, playlist: &DownstreamPlaylist) -> AppResult<ProxyRegistration> {
        let Some(name) = playlist.proxy_name.as_deref() else {
            return Ok(self.fallback_proxy.clone());
        };

        match self.database.get_proxy(name).await? {
            Some(proxy) => Ok(proxy),
            None => {
                debug!(
                    "Proxy '{}' of playlist '{}' has not registered yet, using '{}'",
                    name, playlist.name, self.fallback_proxy.name
                );
                Ok(self.fallback_proxy.clone())
            }
        }
    }

    /// Enabled channels behind a `group@source` reference, or `None` when
    /// the source or group is missing or disabled
    async fn resolve_group_channels(&self, group_ref: &GroupRef) -> AppResult<Option<Vec<PlaylistChannel>>> {
        let source = match self.database.get_upstream_source_by_name(&group_ref.source).await? {
            Some(source) if source.enabled => source,
            Some(_) => {
                warn!("Skipping {}@{}: source is disabled", group_ref.group, group_ref.source);
                return Ok(None);
            }
            None => {
                warn!("Skipping {}@{}: unknown source", group_ref.group, group_ref.source);
                return Ok(None);
            }
        };

        let group = match self.database.find_group(source.id, &group_ref.group).await? {
            Some(group) if group.enabled => group,
            Some(_) => {
                warn!("Skipping {}@{}: group is disabled", group_ref.group, group_ref.source);
                return Ok(None);
            }
            None => {
                warn!("Skipping {}@{}: unknown group", group_ref.group, group_ref.source);
                return Ok(None);
            }
        };

        Ok(Some(self.database.list_playlist_channels(group.id).await?))
    }

    fn push_entry(&self, m3u: &mut String, channel: &PlaylistChannel, stream_base: &str) {
        let logo = channel
            .icon_url
            .as_deref()
            .map(|url| format!("{}/get/icon/{}", self.icon_base_url, encode_identity(url)))
            .unwrap_or_default();

        m3u.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\" tvg-logo=\"{}\" group-title=\"{}\",{}\n",
            channel.tvg_id.as_deref().unwrap_or_default(),
            channel.tvg_name.as_deref().unwrap_or_default(),
            logo,
            channel.group_name,
            channel.name
        ));
        m3u.push_str(stream_base);
        m3u.push_str(&encode_identity(&channel.stream_url));
        m3u.push('\n');
    }
}
