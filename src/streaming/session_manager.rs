use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use super::http_stream::{self, UpstreamOverrides};
use super::management::ManagementPlane;
use super::registry::{SessionInfo, SessionRegistry};
use crate::errors::{AppResult, SourceError};
use crate::models::*;

/// Why a stream could not be started. No stream bytes are ever sent in
/// these cases.
#[derive(Error, Debug)]
pub enum StreamStartError {
    #[error("Stream denied: {}", .0.as_str())]
    Denied(DenyReason),

    #[error("Management plane unavailable: {0}")]
    ManagementUnavailable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamFailed(String),
}

impl StreamStartError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamStartError::Denied(DenyReason::UnknownChannel) => StatusCode::NOT_FOUND,
            StreamStartError::Denied(DenyReason::CapacityExhausted) => StatusCode::TOO_MANY_REQUESTS,
            StreamStartError::Denied(_) => StatusCode::FORBIDDEN,
            StreamStartError::ManagementUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StreamStartError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            StreamStartError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for StreamStartError {
    fn into_response(self) -> axum::response::Response {
        http_stream::error_response(self.status_code(), &self.to_string())
    }
}

impl From<SourceError> for StreamStartError {
    fn from(err: SourceError) -> Self {
        if err.is_timeout() {
            StreamStartError::UpstreamTimeout(err.to_string())
        } else {
            StreamStartError::UpstreamFailed(err.to_string())
        }
    }
}

/// Client identity of a stream request
#[derive(Debug, Clone)]
pub struct StreamClient {
    pub address: String,
    pub user_agent: Option<String>,
}

/// Drives a stream request from admission to close.
///
/// Capacity is reserved by the management plane as part of admission, so
/// concurrent starts never wait on each other here. Begin and End reports
/// are sent in the background.
pub struct StreamSessionManager {
    registry: Arc<SessionRegistry>,
    management: Arc<dyn ManagementPlane>,
    client: reqwest::Client,
    identity: ProxyRegistration,
    default_user_agent: String,
    reporting_timeout: Duration,
}

impl StreamSessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        management: Arc<dyn ManagementPlane>,
        identity: ProxyRegistration,
        default_user_agent: String,
        connect_timeout: Duration,
        reporting_timeout: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            registry,
            management,
            client,
            identity,
            default_user_agent,
            reporting_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &ProxyRegistration {
        &self.identity
    }

    pub async fn start(
        &self,
        stream_url: &str,
        client: StreamClient,
    ) -> Result<Response<Body>, StreamStartError> {
        let opts = match self.management.channel_opts(stream_url).await {
            Ok(opts) => opts,
            Err(e) => {
                warn!("Channel options unavailable for {}: {}", stream_url, e);
                String::new()
            }
        };
        let overrides = UpstreamOverrides::from_tag_lines(&opts);
        let headers = http_stream::upstream_request_headers(&overrides, &self.default_user_agent);

        let upstream = http_stream::open_upstream(&self.client, stream_url, headers).await?;

        let request = AdmissionRequest {
            stream_url: stream_url.to_string(),
            client: client.address.clone(),
            proxy_name: self.identity.name.clone(),
        };
        let begin = SessionReport {
            action: SessionAction::Begin,
            client: client.address.clone(),
            user_agent: client.user_agent.clone(),
            stream_url: stream_url.to_string(),
            proxy: self.identity.clone(),
        };
        let end = SessionReport {
            action: SessionAction::End,
            ..begin.clone()
        };

        let decision = match self.management.admission(&request).await {
            Ok(decision) => decision,
            Err(e) => {
                // The answer may have been lost after a slot was reserved
                spawn_report(self.management.clone(), end, self.reporting_timeout);
                return Err(StreamStartError::ManagementUnavailable(e.to_string()));
            }
        };

        if let AdmissionDecision::Denied(reason) = decision {
            info!(
                "Denied {} for {}: {}",
                stream_url,
                client.address,
                reason.as_str()
            );
            drop(upstream);
            return Err(StreamStartError::Denied(reason));
        }

        let handle = self.registry.register(stream_url, &client.address);
        spawn_report(self.management.clone(), begin, self.reporting_timeout);

        info!("Streaming {} to {} (session {})", stream_url, client.address, handle.id);

        let guard = SessionGuard {
            registry: self.registry.clone(),
            management: self.management.clone(),
            reporting_timeout: self.reporting_timeout,
            key: handle.key.clone(),
            id: handle.id,
            end,
        };

        Ok(http_stream::relay_response(upstream, handle.cancel.clone(), guard))
    }

    /// Forcibly end the live session with this identity
    pub fn stop(&self, key: &str) -> StopOutcome {
        self.registry.force_close(key)
    }

    pub fn lookup(&self, key: &str) -> Option<SessionInfo> {
        self.registry.lookup(key)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    #[cfg(test)]
    pub(crate) fn register_for_test(&self, stream_url: &str, client: &str) -> super::registry::SessionHandle {
        self.registry.register(stream_url, client)
    }
}

async fn send_report(management: &dyn ManagementPlane, report: &SessionReport, timeout: Duration) {
    match tokio::time::timeout(timeout, management.report(report)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(
            "{} report for {} failed: {}",
            report.action.as_str(),
            report.session_key(),
            e
        ),
        Err(_) => error!(
            "{} report for {} timed out after {}s",
            report.action.as_str(),
            report.session_key(),
            timeout.as_secs()
        ),
    }
}

/// Send a report without holding up the caller
fn spawn_report(management: Arc<dyn ManagementPlane>, report: SessionReport, timeout: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(
            "No runtime to send {} report for {}",
            report.action.as_str(),
            report.session_key()
        );
        return;
    };
    runtime.spawn(async move {
        send_report(management.as_ref(), &report, timeout).await;
    });
}

/// Close path of one admitted session. Dropped when the relay ends.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    management: Arc<dyn ManagementPlane>,
    reporting_timeout: Duration,
    key: String,
    id: u64,
    end: SessionReport,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.key, self.id);
        info!("Session {} (id {}) closed", self.key, self.id);
        spawn_report(self.management.clone(), self.end.clone(), self.reporting_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Admits everything. For URLs ending in `/slow` admission answers
    /// after `admission_delay` and reports land after `report_delay`.
    #[derive(Default)]
    struct RecordingPlane {
        reports: StdMutex<Vec<SessionAction>>,
        admission_delay: Duration,
        report_delay: Duration,
    }

    async fn stall(stream_url: &str, delay: Duration) {
        if stream_url.ends_with("/slow") {
            tokio::time::sleep(delay).await;
        }
    }

    #[async_trait]
    impl ManagementPlane for RecordingPlane {
        async fn admission(&self, request: &AdmissionRequest) -> AppResult<AdmissionDecision> {
            stall(&request.stream_url, self.admission_delay).await;
            Ok(AdmissionDecision::Admitted)
        }

        async fn channel_opts(&self, _stream_url: &str) -> AppResult<String> {
            Ok(String::new())
        }

        async fn report(&self, report: &SessionReport) -> AppResult<()> {
            stall(&report.stream_url, self.report_delay).await;
            self.reports.lock().unwrap().push(report.action);
            Ok(())
        }
    }

    async fn upstream() -> String {
        use axum::routing::get;

        let app = axum::Router::new().route("/live/:name", get(|| async { "payload" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/live", addr)
    }

    fn client(address: &str) -> StreamClient {
        StreamClient {
            address: address.into(),
            user_agent: None,
        }
    }

    fn manager(plane: Arc<RecordingPlane>) -> StreamSessionManager {
        StreamSessionManager::new(
            Arc::new(SessionRegistry::new()),
            plane,
            ProxyRegistration {
                name: "test".into(),
                internal_url: "http://127.0.0.1".into(),
                internal_port: 1,
                external_url: "http://127.0.0.1".into(),
                external_port: 1,
            },
            "Test/1".into(),
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            StreamStartError::Denied(DenyReason::CapacityExhausted).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            StreamStartError::Denied(DenyReason::ChannelDisabled).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            StreamStartError::Denied(DenyReason::UnknownChannel).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StreamStartError::from(SourceError::timeout("http://x")).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            StreamStartError::ManagementUnavailable("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway_without_reports() {
        let plane = Arc::new(RecordingPlane::default());
        let manager = manager(plane.clone());

        // Port 9 on localhost is closed in test environments
        let result = manager.start("http://127.0.0.1:9/live.ts", client("10.0.0.1")).await;

        assert!(matches!(
            result,
            Err(StreamStartError::UpstreamFailed(_)) | Err(StreamStartError::UpstreamTimeout(_))
        ));
        assert!(plane.reports.lock().unwrap().is_empty());
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_management_answer_does_not_hold_up_other_starts() {
        let base = upstream().await;
        let plane = Arc::new(RecordingPlane {
            admission_delay: Duration::from_secs(2),
            report_delay: Duration::from_secs(2),
            ..Default::default()
        });
        let manager = Arc::new(manager(plane.clone()));

        let slow = tokio::spawn({
            let manager = manager.clone();
            let url = format!("{}/slow", base);
            async move { manager.start(&url, client("10.0.0.1")).await.is_ok() }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let fast = manager.start(&format!("{}/fast", base), client("10.0.0.2")).await;
        assert!(fast.is_ok());
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "unrelated start waited {:?}",
            started.elapsed()
        );

        assert!(slow.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_begin_report_is_not_awaited() {
        let base = upstream().await;
        let plane = Arc::new(RecordingPlane {
            report_delay: Duration::from_millis(1500),
            ..Default::default()
        });
        let manager = manager(plane.clone());

        let started = std::time::Instant::now();
        let response = manager.start(&format!("{}/slow", base), client("10.0.0.3")).await;
        assert!(response.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.sessions().len(), 1);
        assert!(plane.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_drop_removes_entry_and_reports_end() {
        let plane = Arc::new(RecordingPlane::default());
        let manager = manager(plane.clone());
        let handle = manager.register_for_test("http://up/1", "c");

        let guard = SessionGuard {
            registry: manager.registry().clone(),
            management: plane.clone(),
            reporting_timeout: Duration::from_secs(1),
            key: handle.key.clone(),
            id: handle.id,
            end: SessionReport {
                action: SessionAction::End,
                client: "c".into(),
                user_agent: None,
                stream_url: "http://up/1".into(),
                proxy: manager.identity().clone(),
            },
        };
        drop(guard);

        assert!(manager.lookup(&handle.key).is_none());
        for _ in 0..50 {
            if !plane.reports.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*plane.reports.lock().unwrap(), vec![SessionAction::End]);
    }
}
