//! Upstream connection and byte relay for proxied streams.
//!
//! Key behaviors:
//!   - Connect timeout only; live streams have no total timeout.
//!   - Per-channel `#EXTVLCOPT` user agent and referrer override the defaults.
//!   - Bytes are relayed unmodified until upstream EOF, upstream error,
//!     client disconnect or cancellation.
//!   - Whatever ends the relay, the state it owns (including the session
//!     guard) is dropped exactly once.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::SourceError;

const VLC_OPT_PREFIX: &str = "#EXTVLCOPT:";

/// Header overrides derived from a channel's extra tag lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamOverrides {
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

impl UpstreamOverrides {
    pub fn from_tag_lines(text: &str) -> Self {
        let mut overrides = Self::default();
        for line in text.lines() {
            let Some(option) = line.trim().strip_prefix(VLC_OPT_PREFIX) else {
                continue;
            };
            let Some((key, value)) = option.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "http-user-agent" => overrides.user_agent = Some(value.to_string()),
                "http-referrer" | "http-referer" => overrides.referrer = Some(value.to_string()),
                _ => {}
            }
        }
        overrides
    }
}

/// Request headers sent upstream: overrides first, then the configured default
pub fn upstream_request_headers(overrides: &UpstreamOverrides, default_user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let user_agent = overrides.user_agent.as_deref().unwrap_or(default_user_agent);
    if let Ok(v) = HeaderValue::from_str(user_agent) {
        headers.insert(header::USER_AGENT, v);
    } else {
        warn!("Ignoring unusable user agent '{}'", user_agent);
    }
    if let Some(referrer) = &overrides.referrer {
        if let Ok(v) = HeaderValue::from_str(referrer) {
            headers.insert(header::REFERER, v);
        }
    }

    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

/// Open the upstream stream. Only 2xx responses count as success.
pub async fn open_upstream(
    client: &Client,
    stream_url: &str,
    headers: HeaderMap,
) -> Result<reqwest::Response, SourceError> {
    info!("Opening upstream stream: {}", stream_url);

    let response = client
        .get(stream_url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| {
            error!("Failed to connect to upstream {}: {}", stream_url, e);
            SourceError::from_reqwest(stream_url, &e)
        })?;

    let status = response.status();
    if !status.is_success() {
        error!("Upstream responded with error status {} for {}", status, stream_url);
        return Err(SourceError::Http {
            status: status.as_u16(),
            url: stream_url.to_string(),
        });
    }

    Ok(response)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Upstream response headers minus hop-by-hop ones, with defaults filled
/// in only where upstream sent nothing
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 3);
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    headers
        .entry(header::CACHE_CONTROL)
        .or_insert_with(|| HeaderValue::from_static("no-cache"));
    headers
        .entry(header::PRAGMA)
        .or_insert_with(|| HeaderValue::from_static("no-cache"));
    headers
        .entry(header::CONNECTION)
        .or_insert_with(|| HeaderValue::from_static("keep-alive"));
    headers
}

struct RelayState<G> {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    cancel: CancellationToken,
    _guard: G,
}

/// Turn an admitted upstream response into the client response. `guard` is
/// dropped when the relay ends for any reason.
pub fn relay_response<G: Send + 'static>(
    upstream: reqwest::Response,
    cancel: CancellationToken,
    guard: G,
) -> Response<Body> {
    let status = upstream.status();
    let headers = relay_headers(upstream.headers());
    let url = upstream.url().to_string();

    let state = RelayState {
        upstream: upstream.bytes_stream().boxed(),
        cancel,
        _guard: guard,
    };

    let stream = futures::stream::unfold(state, move |mut state| {
        let url = url.clone();
        async move {
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => {
                    info!("Relay for {} cancelled", url);
                    None
                }
                chunk = state.upstream.next() => match chunk {
                    Some(Ok(bytes)) => Some((Ok::<Bytes, std::io::Error>(bytes), state)),
                    Some(Err(e)) => {
                        warn!("Upstream error while relaying {}: {}", url, e);
                        None
                    }
                    None => {
                        debug!("Upstream {} reached end of stream", url);
                        None
                    }
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Uniform plain-text error response; never carries stream bytes
pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_from_vlc_options() {
        let overrides = UpstreamOverrides::from_tag_lines(
            "#EXTVLCOPT:http-user-agent=Kodi/20\n#EXTGRP:News\n#EXTVLCOPT:http-referer=http://ref/",
        );
        assert_eq!(overrides.user_agent.as_deref(), Some("Kodi/20"));
        assert_eq!(overrides.referrer.as_deref(), Some("http://ref/"));
        assert_eq!(UpstreamOverrides::from_tag_lines(""), UpstreamOverrides::default());
    }

    #[test]
    fn test_override_beats_default_user_agent() {
        let overrides = UpstreamOverrides {
            user_agent: Some("Custom/1".into()),
            referrer: None,
        };
        let headers = upstream_request_headers(&overrides, "Default/1");
        assert_eq!(headers[header::USER_AGENT], "Custom/1");
        assert!(headers.get(header::REFERER).is_none());

        let headers = upstream_request_headers(&UpstreamOverrides::default(), "Default/1");
        assert_eq!(headers[header::USER_AGENT], "Default/1");
        assert_eq!(headers[header::ACCEPT], "*/*");
    }

    #[test]
    fn test_relay_headers_fill_only_missing_defaults() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        upstream.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=5"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("100"));

        let headers = relay_headers(&upstream);
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(headers[header::CACHE_CONTROL], "max-age=5");
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
    }
}
