use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::models::StopOutcome;
use crate::streaming::{SessionInfo, StreamClient};
use crate::utils::decode_identity;
use crate::web::extractors::RequestContext;
use crate::web::ProxyState;

/// `GET /stream/start/{base64(stream url)}`
pub async fn start_stream(
    State(state): State<ProxyState>,
    Path(identity): Path<String>,
    context: RequestContext,
) -> Response {
    let stream_url = match decode_identity(&identity) {
        Ok(url) => url,
        Err(e) => return AppError::from(e).into_response(),
    };

    info!("Stream request for {} from {}", stream_url, context.client_address);
    let client = StreamClient {
        address: context.client_address,
        user_agent: context.user_agent,
    };

    match state.sessions.start(&stream_url, client).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Stream start for {} failed: {}", stream_url, e);
            e.into_response()
        }
    }
}

/// `GET /stream/stop/{base64(stream url + '|' + client address)}`
pub async fn stop_stream(
    State(state): State<ProxyState>,
    Path(identity): Path<String>,
) -> Result<(StatusCode, &'static str), AppError> {
    let key = decode_identity(&identity)?;
    Ok(match state.sessions.stop(&key) {
        StopOutcome::Found => (StatusCode::OK, "stopped"),
        StopOutcome::NotFound => (StatusCode::NOT_FOUND, "not found"),
    })
}

/// Live sessions of this proxy
pub async fn list_live_sessions(State(state): State<ProxyState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.sessions())
}
