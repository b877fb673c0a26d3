//! Management plane endpoints consumed by proxies and downstream players

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::errors::{AppError, AppResult, WebError};
use crate::models::*;
use crate::streaming::management::ADMISSION_REASON_HEADER;
use crate::utils::decode_identity;
use crate::web::ManagerState;

const STREAM_START_PREFIX: &str = "/stream/start/";
const M3U_CONTENT_TYPE: &str = "audio/x-mpegurl";

/// `GET /status/{base64(stream url)}`: `true`/`false` plus the deny reason.
///
/// With a `client` header this is a proxy's stream start and an admitted
/// answer holds a stream slot for that client. Without one it only checks.
pub async fn admission_status(
    State(state): State<ManagerState>,
    Path(identity): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let stream_url = decode_identity(&identity)?;
    let decision = match optional_header(&headers, "client") {
        Some(client) => {
            let request = AdmissionRequest {
                stream_url,
                client: client.to_string(),
                proxy_name: optional_header(&headers, "proxy-name")
                    .unwrap_or_default()
                    .to_string(),
            };
            state.oracle.admit(&request).await?
        }
        None => state.oracle.decide(&stream_url).await?,
    };

    Ok(match decision {
        AdmissionDecision::Admitted => "true".into_response(),
        AdmissionDecision::Denied(reason) => {
            let mut response = "false".into_response();
            response.headers_mut().insert(
                ADMISSION_REASON_HEADER,
                HeaderValue::from_static(reason.as_str()),
            );
            response
        }
    })
}

/// `GET /opts/{base64(stream url)}`: the channel's raw extra tag lines
pub async fn channel_opts(
    State(state): State<ManagerState>,
    Path(identity): Path<String>,
) -> AppResult<String> {
    let stream_url = decode_identity(&identity)?;
    state.oracle.channel_opts(&stream_url).await
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, WebError> {
    optional_header(headers, name).ok_or_else(|| WebError::missing_header(name))
}

fn port_header(headers: &HeaderMap, name: &str) -> Result<u16, WebError> {
    required_header(headers, name)?
        .parse()
        .map_err(|_| WebError::invalid_request(name, "not a port number"))
}

/// Build a report from the `/report` request headers. The `url` header is
/// the proxy request path, `/stream/start/{base64(stream url)}`.
pub fn parse_report(headers: &HeaderMap) -> Result<SessionReport, WebError> {
    let action = required_header(headers, "action")?
        .parse::<SessionAction>()
        .map_err(|e| WebError::invalid_request("action", e))?;

    let path = required_header(headers, "url")?;
    let encoded = path.strip_prefix(STREAM_START_PREFIX).unwrap_or(path);
    let stream_url = decode_identity(encoded)?;

    Ok(SessionReport {
        action,
        client: required_header(headers, "client")?.to_string(),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        stream_url,
        proxy: ProxyRegistration {
            name: required_header(headers, "proxy-name")?.to_string(),
            internal_url: required_header(headers, "proxy-url-internal")?.to_string(),
            internal_port: port_header(headers, "proxy-port-internal")?,
            external_url: required_header(headers, "proxy-url-external")?.to_string(),
            external_port: port_header(headers, "proxy-port-external")?,
        },
    })
}

/// `GET /report`: Begin/End notification from a proxy
pub async fn session_report(
    State(state): State<ManagerState>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let report = parse_report(&headers)?;
    debug!("{} report for {}", report.action.as_str(), report.session_key());
    state.reporter.handle(&report).await?;
    Ok(StatusCode::OK)
}

/// `GET /get/icon/{base64(icon url)}`
pub async fn get_icon(
    State(state): State<ManagerState>,
    Path(identity): Path<String>,
) -> AppResult<Response> {
    let url = decode_identity(&identity)?;
    let icon = state.icons.get(&url).await?;

    Ok((
        [
            (header::CONTENT_TYPE, icon.mime),
            (header::CACHE_CONTROL, "public, max-age=86400".to_string()),
        ],
        icon.bytes,
    )
        .into_response())
}

fn m3u_response(body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, M3U_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// `GET /get/playlist/{name}`
pub async fn get_playlist(
    State(state): State<ManagerState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let m3u = state.generator.generate(&name).await?;
    Ok(m3u_response(m3u))
}

async fn stored_upstream(state: &ManagerState, name: &str, filtered: bool) -> AppResult<Response> {
    let source = state
        .database
        .get_upstream_source_by_name(name)
        .await?
        .ok_or_else(|| AppError::not_found("upstream source", name))?;

    let store = state.engine.store();
    let text = if filtered {
        store.read_filtered(source.id).await
    } else {
        store.read_raw(source.id).await
    };

    text.map(m3u_response)
        .ok_or_else(|| AppError::not_found("stored playlist", name))
}

/// `GET /get/upstream/{name}`: last fetched copy
pub async fn get_upstream(
    State(state): State<ManagerState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    stored_upstream(&state, &name, false).await
}

/// `GET /get/upstream/{name}/filtered`: copy with excluded groups removed
pub async fn get_upstream_filtered(
    State(state): State<ManagerState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    stored_upstream(&state, &name, true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::encode_identity;

    fn report_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        let path = format!("/stream/start/{}", encode_identity("http://up/live/1.ts"));
        headers.insert("action", HeaderValue::from_static("Begin"));
        headers.insert("client", HeaderValue::from_static("10.0.0.2"));
        headers.insert("url", HeaderValue::from_str(&path).unwrap());
        headers.insert("proxy-name", HeaderValue::from_static("edge"));
        headers.insert("proxy-url-internal", HeaderValue::from_static("http://10.0.0.5"));
        headers.insert("proxy-port-internal", HeaderValue::from_static("8089"));
        headers.insert("proxy-url-external", HeaderValue::from_static("http://tv.example"));
        headers.insert("proxy-port-external", HeaderValue::from_static("80"));
        headers
    }

    #[test]
    fn test_parse_report() {
        let report = parse_report(&report_headers()).unwrap();
        assert_eq!(report.action, SessionAction::Begin);
        assert_eq!(report.stream_url, "http://up/live/1.ts");
        assert_eq!(report.session_key(), "http://up/live/1.ts|10.0.0.2");
        assert_eq!(report.proxy.internal_port, 8089);
        assert!(report.user_agent.is_none());
    }

    #[test]
    fn test_parse_report_rejects_missing_and_bad_headers() {
        let mut headers = report_headers();
        headers.remove("client");
        assert!(matches!(
            parse_report(&headers),
            Err(WebError::MissingHeader { .. })
        ));

        let mut headers = report_headers();
        headers.insert("action", HeaderValue::from_static("Pause"));
        assert!(matches!(
            parse_report(&headers),
            Err(WebError::InvalidRequest { .. })
        ));
    }
}
