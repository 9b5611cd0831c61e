//! KairosDB HTTP client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error, warn};

use super::{error_messages, BackendReply, KairosResponse, ProxyResponse};
use crate::config::KairosConfig;
use crate::engine::traits::TsdbBackend;
use crate::error::{BackendQueryFailure, Error, Result};
use crate::query::QueryRequest;

/// Path of the datapoint query endpoint
pub const QUERY_PATH: &str = "/api/v1/datapoints/query";

/// Client for one KairosDB endpoint
#[derive(Debug, Clone)]
pub struct KairosClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl KairosClient {
    /// Create a client for the configured host and port
    pub fn new(config: &KairosConfig) -> Result<Self> {
        Self::with_base_url(config.base_url(), config.timeout())
    }

    /// Create a client for an explicit base URL, e.g. `http://kairos:8080`
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn run_query(
        &self,
        request: &QueryRequest,
    ) -> std::result::Result<KairosResponse, BackendQueryFailure> {
        let resp = self
            .http_client
            .post(self.url(QUERY_PATH))
            .json(request)
            .send()
            .await
            .map_err(|e| BackendQueryFailure::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendQueryFailure::Status {
                status: status.as_u16(),
                message: error_messages(&body),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| BackendQueryFailure::Connection(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| BackendQueryFailure::Malformed(e.to_string()))
    }
}

#[async_trait]
impl TsdbBackend for KairosClient {
    async fn query(
        &self,
        request: &QueryRequest,
        propagate: bool,
    ) -> std::result::Result<BackendReply, BackendQueryFailure> {
        match self.run_query(request).await {
            Ok(response) => {
                debug!(queries = response.queries.len(), "KairosDB query succeeded");
                Ok(BackendReply::Success(response))
            }
            Err(failure) if propagate => Err(failure),
            Err(failure) => {
                error!(error = %failure, "KairosDB query failed");
                Ok(BackendReply::from(failure))
            }
        }
    }

    async fn proxy(
        &self,
        endpoint: &str,
        body: Option<&str>,
    ) -> std::result::Result<ProxyResponse, BackendQueryFailure> {
        let url = self.url(endpoint);
        let req = match body {
            Some(body) => self
                .http_client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string()),
            None => self.http_client.get(url),
        };

        let resp = req
            .send()
            .await
            .map_err(|e| BackendQueryFailure::Connection(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BackendQueryFailure::Connection(e.to_string()))?;

        if status != StatusCode::OK {
            warn!(endpoint, status = status.as_u16(), "KairosDB metadata request not OK");
        }

        Ok(ProxyResponse {
            status: status.as_u16(),
            body,
        })
    }
}
