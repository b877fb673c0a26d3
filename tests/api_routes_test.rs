mod common;

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::*;
use iptv_manager::{
    database::Database,
    utils::encode_identity,
    web::{create_router, ManagerState},
};

struct TestApp {
    router: Router,
    database: Database,
    _dir: tempfile::TempDir,
}

async fn manager_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path()));
    let database = Database::in_memory().await.unwrap();
    let engine = engine(&database, &config, Arc::new(StaticFetcher::new(SAMPLE_PLAYLIST)));
    let state = ManagerState::with_engine(config, database.clone(), engine, None).unwrap();

    TestApp {
        router: create_router(Some(state), None),
        database,
        _dir: dir,
    }
}

async fn send_raw(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, String)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, String) {
    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request_builder = request_builder.header(*name, value);
    }

    let request = if let Some(body) = body {
        request_builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();

    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, headers, String::from_utf8_lossy(&body_bytes).into_owned())
}

// Helper function to send JSON requests to the app
async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, text) = send_raw(app, method, uri, &[], body).await;
    let json: Value = if text.is_empty() {
        json!({})
    } else {
        serde_json::from_str(&text).unwrap_or(json!({}))
    };
    (status, json)
}

async fn create_and_refresh(app: &Router, body: Value) -> i64 {
    let (status, response) = send_request(app, Method::POST, "/api/v1/sources", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = response["data"]["id"].as_i64().unwrap();

    let (status, response) = send_request(
        app,
        Method::POST,
        &format!("/api/v1/sources/{}/refresh?force=true", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "completed");
    id
}

fn report_headers(action: &str, stream_url: &str) -> Vec<(&'static str, String)> {
    vec![
        ("action", action.to_string()),
        ("client", "10.0.0.7".to_string()),
        ("url", format!("/stream/start/{}", encode_identity(stream_url))),
        ("user-agent", "VLC/3.0".to_string()),
        ("proxy-name", "edge".to_string()),
        ("proxy-url-internal", "http://10.0.0.5".to_string()),
        ("proxy-port-internal", "8089".to_string()),
        ("proxy-url-external", "http://tv.example".to_string()),
        ("proxy-port-external", "80".to_string()),
    ]
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = manager_app().await;
    let (status, response) = send_request(&app.router, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ok");
}

#[tokio::test]
async fn test_proxy_routes_absent_in_manager_role() {
    let app = manager_app().await;
    let uri = format!("/stream/start/{}", encode_identity("http://up.test/live/alpha.ts"));
    let (status, _) = send_request(&app.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_source_lifecycle() {
    let app = manager_app().await;
    let body = json!({ "name": "provider", "location": PROVIDER_URL, "max_concurrent_streams": 2 });

    let id = create_and_refresh(&app.router, body.clone()).await;

    let (status, _) = send_request(&app.router, Method::POST, "/api/v1/sources", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, response) = send_request(
        &app.router,
        Method::GET,
        &format!("/api/v1/sources/{}/channels", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"].as_array().unwrap().len(), 3);

    let (status, response) = send_request(
        &app.router,
        Method::PATCH,
        &format!("/api/v1/sources/{}", id),
        Some(json!({ "enabled": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["enabled"], false);
    assert_eq!(response["data"]["max_concurrent_streams"], 2);

    let (status, response) = send_request(&app.router, Method::GET, "/api/v1/progress", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"][0]["state"], "completed");

    let (status, _) = send_request(
        &app.router,
        Method::DELETE,
        &format!("/api/v1/sources/{}", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, response) = send_request(
        &app.router,
        Method::GET,
        &format!("/api/v1/sources/{}", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["success"], false);
    assert!(app.database.list_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stored_upstream_copies() {
    let app = manager_app().await;
    create_and_refresh(
        &app.router,
        json!({ "name": "provider", "location": PROVIDER_URL, "group_exclusions": "Movies" }),
    )
    .await;

    let (status, headers, raw) =
        send_raw(&app.router, Method::GET, "/get/upstream/provider", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "audio/x-mpegurl");
    assert!(raw.contains("Gamma Movie"));

    let (status, _, filtered) = send_raw(
        &app.router,
        Method::GET,
        "/get/upstream/provider/filtered",
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!filtered.contains("Gamma Movie"));
    assert!(filtered.contains("Beta Sports"));

    let (status, _, _) = send_raw(&app.router, Method::GET, "/get/upstream/nobody", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_downstream_playlist_generation() {
    let app = manager_app().await;
    create_and_refresh(&app.router, json!({ "name": "provider", "location": PROVIDER_URL })).await;

    let (_, _, export) = send_raw(&app.router, Method::GET, "/api/v1/groups/export", &[], None).await;
    assert!(export.lines().any(|l| l == "News@provider"));

    let (status, _) = send_request(
        &app.router,
        Method::POST,
        "/api/v1/downstream",
        Some(json!({
            "name": "living-room",
            "groups": "News@provider\nSports@provider\nMissing@nowhere\n",
            "channel_filter": "Beta",
            "filter_mode": "any",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, headers, m3u) =
        send_raw(&app.router, Method::GET, "/get/playlist/living-room", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "audio/x-mpegurl");
    assert!(m3u.starts_with("#EXTM3U\n"));
    assert!(m3u.contains(",Alpha News\n"));
    assert!(!m3u.contains("Beta Sports"));
    assert!(m3u.contains(&format!(
        "http://localhost:8088/stream/start/{}",
        encode_identity("http://up.test/live/alpha.ts")
    )));
    assert!(m3u.contains(&format!(
        "tvg-logo=\"http://manager.test/get/icon/{}\"",
        encode_identity("http://logos.test/alpha.png")
    )));
    assert!(!m3u.contains("up.test/live/alpha.ts\n"));

    // Disabling the group empties the playlist
    let groups = app.database.list_groups().await.unwrap();
    let news = groups.iter().find(|g| g.name == "News").unwrap();
    let (status, _) = send_request(
        &app.router,
        Method::PATCH,
        &format!("/api/v1/groups/{}", news.id),
        Some(json!({ "enabled": false })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, _, m3u) = send_raw(&app.router, Method::GET, "/get/playlist/living-room", &[], None).await;
    assert_eq!(m3u, "#EXTM3U\n");

    let (status, _, _) = send_raw(&app.router, Method::GET, "/get/playlist/nope", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_management_endpoints_and_session_accounting() {
    let app = manager_app().await;
    let source_id =
        create_and_refresh(&app.router, json!({ "name": "provider", "location": PROVIDER_URL })).await;
    let beta = "http://up.test/live/beta.ts";

    let (status, _, body) = send_raw(
        &app.router,
        Method::GET,
        &format!("/status/{}", encode_identity(beta)),
        &[],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "true");

    let (_, _, opts) = send_raw(
        &app.router,
        Method::GET,
        &format!("/opts/{}", encode_identity(beta)),
        &[],
        None,
    )
    .await;
    assert_eq!(opts, "#EXTVLCOPT:http-user-agent=Custom/1.0");

    let (_, headers, body) = send_raw(
        &app.router,
        Method::GET,
        &format!("/status/{}", encode_identity("http://elsewhere.test/x.ts")),
        &[],
        None,
    )
    .await;
    assert_eq!(body, "false");
    assert_eq!(headers["x-admission-reason"], "unknown_channel");

    let (status, _, _) = send_raw(&app.router, Method::GET, "/status/not-base64!", &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Plain status checks hold nothing
    let source = app.database.get_upstream_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.active_stream_count, 0);

    // A proxy's admission names the client and takes the slot
    let (_, _, body) = send_raw(
        &app.router,
        Method::GET,
        &format!("/status/{}", encode_identity(beta)),
        &[
            ("client", "10.0.0.7".to_string()),
            ("proxy-name", "edge".to_string()),
        ],
        None,
    )
    .await;
    assert_eq!(body, "true");
    let source = app.database.get_upstream_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.active_stream_count, 1);

    let (status, _, _) =
        send_raw(&app.router, Method::GET, "/report", &report_headers("Begin", beta), None).await;
    assert_eq!(status, StatusCode::OK);
    let source = app.database.get_upstream_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.active_stream_count, 1);

    let (_, response) = send_request(&app.router, Method::GET, "/api/v1/sessions", None).await;
    let sessions = response["data"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["proxy_name"], "edge");
    assert_eq!(sessions[0]["user_agent"], "VLC/3.0");

    let (_, response) = send_request(&app.router, Method::GET, "/api/v1/proxies", None).await;
    assert_eq!(response["data"][0]["internal_port"], 8089);

    let (status, _, _) =
        send_raw(&app.router, Method::GET, "/report", &report_headers("End", beta), None).await;
    assert_eq!(status, StatusCode::OK);

    // A duplicate End finds no session and leaves the counter alone
    send_raw(&app.router, Method::GET, "/report", &report_headers("End", beta), None).await;

    let source = app.database.get_upstream_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.active_stream_count, 0);
    assert!(app.database.list_sessions().await.unwrap().is_empty());

    let (_, response) = send_request(&app.router, Method::GET, "/api/v1/stats", None).await;
    let stats = response["data"].as_array().unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0]["channel_name"], "Beta Sports");
    assert_eq!(stats[0]["client_address"], "10.0.0.7");

    let (status, response) = send_request(&app.router, Method::DELETE, "/api/v1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["removed"], 1);
}

#[tokio::test]
async fn test_report_with_missing_headers_is_rejected() {
    let app = manager_app().await;
    let mut headers = report_headers("Begin", "http://up.test/live/beta.ts");
    headers.retain(|(name, _)| *name != "proxy-name");

    let (status, _, _) = send_raw(&app.router, Method::GET, "/report", &headers, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.database.list_sessions().await.unwrap().is_empty());
}
