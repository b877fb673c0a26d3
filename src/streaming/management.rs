//! The proxy's view of the management plane: admission, channel options
//! and session reports. In a combined process these are direct calls; a
//! standalone proxy talks to the manager over HTTP.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::models::*;
use crate::services::{AdmissionOracle, SessionReporter};
use crate::utils::encode_identity;

/// Header carrying the deny reason next to a `false` admission answer
pub const ADMISSION_REASON_HEADER: &str = "x-admission-reason";

#[async_trait]
pub trait ManagementPlane: Send + Sync {
    /// Admit a stream start. An `Admitted` answer holds one slot of the
    /// source's capacity until the End report for the same identity.
    async fn admission(&self, request: &AdmissionRequest) -> AppResult<AdmissionDecision>;

    /// Extra tag lines stored for the channel, empty when none
    async fn channel_opts(&self, stream_url: &str) -> AppResult<String>;

    async fn report(&self, report: &SessionReport) -> AppResult<()>;
}

pub struct LocalManagementPlane {
    oracle: AdmissionOracle,
    reporter: SessionReporter,
}

impl LocalManagementPlane {
    pub fn new(oracle: AdmissionOracle, reporter: SessionReporter) -> Self {
        Self { oracle, reporter }
    }
}

#[async_trait]
impl ManagementPlane for LocalManagementPlane {
    async fn admission(&self, request: &AdmissionRequest) -> AppResult<AdmissionDecision> {
        self.oracle.admit(request).await
    }

    async fn channel_opts(&self, stream_url: &str) -> AppResult<String> {
        self.oracle.channel_opts(stream_url).await
    }

    async fn report(&self, report: &SessionReport) -> AppResult<()> {
        self.reporter.handle(report).await
    }
}

pub struct RemoteManagementPlane {
    client: reqwest::Client,
    base_url: String,
    management_timeout: Duration,
    reporting_timeout: Duration,
}

impl RemoteManagementPlane {
    pub fn new(base_url: &str, management_timeout: Duration, reporting_timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            management_timeout,
            reporting_timeout,
        })
    }

    async fn get(
        &self,
        path: &str,
        headers: &[(&'static str, &str)],
        timeout: Duration,
    ) -> AppResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AppError::management_unavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::management_unavailable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ManagementPlane for RemoteManagementPlane {
    async fn admission(&self, request: &AdmissionRequest) -> AppResult<AdmissionDecision> {
        let stream_url = &request.stream_url;
        let response = self
            .get(
                &format!("/status/{}", encode_identity(stream_url)),
                &[
                    ("client", request.client.as_str()),
                    ("proxy-name", request.proxy_name.as_str()),
                ],
                self.management_timeout,
            )
            .await?;

        let reason = response
            .headers()
            .get(ADMISSION_REASON_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<DenyReason>().ok());
        let body = response
            .text()
            .await
            .map_err(|e| AppError::management_unavailable(e.to_string()))?;

        debug!("Remote admission for {}: {} ({:?})", stream_url, body.trim(), reason);
        Ok(if body.trim() == "true" {
            AdmissionDecision::Admitted
        } else {
            AdmissionDecision::Denied(reason.unwrap_or(DenyReason::CapacityExhausted))
        })
    }

    async fn channel_opts(&self, stream_url: &str) -> AppResult<String> {
        let response = self
            .get(
                &format!("/opts/{}", encode_identity(stream_url)),
                &[],
                self.management_timeout,
            )
            .await?;
        response
            .text()
            .await
            .map_err(|e| AppError::management_unavailable(e.to_string()))
    }

    async fn report(&self, report: &SessionReport) -> AppResult<()> {
        let url = format!("{}/report", self.base_url);
        let proxy = &report.proxy;

        let mut request = self
            .client
            .get(&url)
            .timeout(self.reporting_timeout)
            .header("action", report.action.as_str())
            .header("client", &report.client)
            .header("url", format!("/stream/start/{}", encode_identity(&report.stream_url)))
            .header("proxy-name", &proxy.name)
            .header("proxy-url-internal", &proxy.internal_url)
            .header("proxy-port-internal", proxy.internal_port.to_string())
            .header("proxy-url-external", &proxy.external_url)
            .header("proxy-port-external", proxy.external_port.to_string());
        if let Some(user_agent) = &report.user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::management_unavailable(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(AppError::management_unavailable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}
