//! Administrative API under `/api/v1`

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::responses::{created, ok};
use super::ManagerState;
use crate::errors::{AppError, AppResult, SourceError};
use crate::models::*;
use crate::utils::{encode_identity, join_url_port};

// Upstream sources

pub async fn list_sources(State(state): State<ManagerState>) -> AppResult<Response> {
    Ok(ok(state.database.list_upstream_sources().await?))
}

pub async fn create_source(
    State(state): State<ManagerState>,
    Json(payload): Json<UpstreamSourceCreateRequest>,
) -> AppResult<Response> {
    let source = state.database.create_upstream_source(&payload).await?;
    let _ = state.cache_invalidation_tx.send(());
    Ok(created(source))
}

pub async fn get_source(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let source = state
        .database
        .get_upstream_source(id)
        .await?
        .ok_or_else(|| AppError::not_found("upstream source", id.to_string()))?;
    Ok(ok(source))
}

pub async fn update_source(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
    Json(payload): Json<SourceUpdateRequest>,
) -> AppResult<Response> {
    if !state.database.set_upstream_source_enabled(id, payload.enabled).await? {
        return Err(AppError::not_found("upstream source", id.to_string()));
    }
    let _ = state.cache_invalidation_tx.send(());
    get_source(State(state), Path(id)).await
}

pub async fn delete_source(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    if !state.database.delete_upstream_source(id).await? {
        return Err(AppError::not_found("upstream source", id.to_string()));
    }
    state.engine.store().remove(id).await;
    let _ = state.cache_invalidation_tx.send(());
    info!("Deleted upstream source {}", id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshParams {
    #[serde(default)]
    pub force: bool,
}

/// Run a reconciliation now. A run already in flight for the source is
/// answered with 202 and left alone.
pub async fn refresh_source(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
    Query(params): Query<RefreshParams>,
) -> AppResult<Response> {
    info!("Manual refresh of source {} (force: {})", id, params.force);
    let outcome = state.engine.reconcile(id, params.force).await?;
    let status = match outcome {
        ReconcileOutcome::Completed { .. } => StatusCode::OK,
        ReconcileOutcome::AlreadyRunning => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)).into_response())
}

pub async fn list_source_channels(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    Ok(ok(state.database.list_channels_for_source(id).await?))
}

// Catalog

pub async fn get_channel(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let channel = state
        .database
        .get_channel(id)
        .await?
        .ok_or_else(|| AppError::not_found("channel", id.to_string()))?;
    Ok(ok(channel))
}

/// Operator override of `enabled`/`protected`
pub async fn update_channel(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
    Json(payload): Json<ChannelUpdateRequest>,
) -> AppResult<Response> {
    let channel = state
        .database
        .update_channel(id, &payload)
        .await?
        .ok_or_else(|| AppError::not_found("channel", id.to_string()))?;
    Ok(ok(channel))
}

pub async fn purge_channels(State(state): State<ManagerState>) -> AppResult<Response> {
    let removed = state.database.delete_all_channels().await?;
    warn!("Purged {} channels", removed);
    Ok(ok(json!({ "removed": removed })))
}

pub async fn list_groups(State(state): State<ManagerState>) -> AppResult<Response> {
    Ok(ok(state.database.list_groups().await?))
}

/// Every group as a `name@source` line, ready to paste into a downstream
/// playlist definition
pub async fn export_groups(State(state): State<ManagerState>) -> AppResult<Response> {
    let text: String = state
        .database
        .list_groups()
        .await?
        .iter()
        .map(|g| format!("{}@{}\n", g.name, g.source_name))
        .collect();
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

pub async fn update_group(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
    Json(payload): Json<GroupUpdateRequest>,
) -> AppResult<StatusCode> {
    if !state.database.set_group_enabled(id, payload.enabled).await? {
        return Err(AppError::not_found("group", id.to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn purge_groups(State(state): State<ManagerState>) -> AppResult<Response> {
    let removed = state.database.delete_all_groups().await?;
    warn!("Purged {} groups", removed);
    Ok(ok(json!({ "removed": removed })))
}

pub async fn purge_icons(State(state): State<ManagerState>) -> AppResult<Response> {
    let removed = state.icons.purge().await?;
    Ok(ok(json!({ "removed": removed })))
}

// Downstream playlists

pub async fn list_downstream(State(state): State<ManagerState>) -> AppResult<Response> {
    Ok(ok(state.database.list_downstream_playlists().await?))
}

pub async fn create_downstream(
    State(state): State<ManagerState>,
    Json(payload): Json<DownstreamPlaylistCreateRequest>,
) -> AppResult<Response> {
    Ok(created(state.database.create_downstream_playlist(&payload).await?))
}

pub async fn delete_downstream(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    if !state.database.delete_downstream_playlist(id).await? {
        return Err(AppError::not_found("downstream playlist", id.to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

// Sessions

pub async fn list_sessions(State(state): State<ManagerState>) -> AppResult<Response> {
    Ok(ok(state.database.list_sessions().await?))
}

/// Forcibly stop a session wherever it runs: in this process when the
/// owning proxy is our own, otherwise through the proxy's stop endpoint
pub async fn stop_session(
    State(state): State<ManagerState>,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let session = state
        .database
        .get_session(id)
        .await?
        .ok_or_else(|| AppError::not_found("session", id.to_string()))?;

    let proxy_name = session.proxy_name.clone().unwrap_or_default();
    let outcome = match &state.local_sessions {
        Some(local) if local.identity().name == proxy_name => local.stop(&session.session_key),
        _ => stop_remote(&state, &proxy_name, &session.session_key).await?,
    };

    let status = match outcome {
        StopOutcome::Found => StatusCode::OK,
        StopOutcome::NotFound => StatusCode::NOT_FOUND,
    };
    Ok((status, Json(json!({ "session": session.session_key, "outcome": outcome }))).into_response())
}

async fn stop_remote(state: &ManagerState, proxy_name: &str, session_key: &str) -> AppResult<StopOutcome> {
    let proxy = state
        .database
        .get_proxy(proxy_name)
        .await?
        .ok_or_else(|| AppError::not_found("proxy", proxy_name))?;

    let url = format!(
        "{}/stream/stop/{}",
        join_url_port(&proxy.internal_url, proxy.internal_port),
        encode_identity(session_key)
    );
    info!("Asking proxy '{}' to stop {}", proxy.name, session_key);

    let response = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| SourceError::from_reqwest(&url, &e))?;

    match response.status() {
        s if s.is_success() => Ok(StopOutcome::Found),
        StatusCode::NOT_FOUND => Ok(StopOutcome::NotFound),
        s => Err(SourceError::Http {
            status: s.as_u16(),
            url,
        }
        .into()),
    }
}

pub async fn list_watch_stats(State(state): State<ManagerState>) -> AppResult<Response> {
    Ok(ok(state.database.list_watch_stats().await?))
}

pub async fn purge_watch_stats(State(state): State<ManagerState>) -> AppResult<Response> {
    let removed = state.database.delete_all_watch_stats().await?;
    warn!("Purged {} watch statistics", removed);
    Ok(ok(json!({ "removed": removed })))
}

pub async fn list_proxies(State(state): State<ManagerState>) -> AppResult<Response> {
    Ok(ok(state.database.list_proxies().await?))
}

pub async fn get_progress(State(state): State<ManagerState>) -> AppResult<Response> {
    let mut progress: Vec<IngestionProgress> = state
        .engine
        .state_manager()
        .get_all_progress()
        .await
        .into_values()
        .collect();
    progress.sort_by_key(|p| p.source_id);
    Ok(ok(progress))
}
