//! JSON-over-HTTP transport.
//!
//! Endpoints, relative to the configured base URL:
//! - `POST api/sync/{kind}/batch` with `{"items": [...]}`
//! - `GET api/reference/{scope}`
//! - `GET api/health`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use super::{NetworkMonitor, ReferenceData, Transport, TransportError, UploadItem, UploadResponse};
use crate::config::ServerConfig;
use crate::error::RollsyncError;
use crate::features::sync::OperationType;

#[derive(Serialize)]
struct UploadRequest<'a> {
    items: &'a [UploadItem],
}

/// `reqwest`-backed [`Transport`].
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    token: Option<String>,
    network: NetworkMonitor,
}

impl HttpTransport {
    /// Build a transport from server settings.
    ///
    /// The bearer token is read from the environment variable named by
    /// `api_token_env`, if set.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::Config` if no base URL is configured or it
    /// does not parse.
    pub fn from_config(config: &ServerConfig, network: NetworkMonitor) -> Result<Self, RollsyncError> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| RollsyncError::Config("server.base_url is not set".to_string()))?;
        let token = std::env::var(&config.api_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());

        Self::new(
            base_url,
            token,
            Duration::from_secs(config.timeout_seconds),
            network,
        )
    }

    /// Build a transport for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `RollsyncError::Config` if the URL does not parse or the
    /// client cannot be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
        network: NetworkMonitor,
    ) -> Result<Self, RollsyncError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| RollsyncError::Config(format!("Invalid server URL '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RollsyncError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token,
            network,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Network(format!("Invalid endpoint {path}: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send, classify the outcome, and keep the network monitor current.
    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = match self.authorize(request).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = classify_send_error(&e);
                if matches!(err, TransportError::Network(_) | TransportError::Timeout) {
                    self.network.set_online(false);
                }
                return Err(err);
            }
        };

        self.network.set_online(true);

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .ok()
            .filter(|body| !body.trim().is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
        Err(classify_status(status, message))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload_batch(
        &self,
        kind: OperationType,
        items: Vec<UploadItem>,
    ) -> Result<UploadResponse, TransportError> {
        if !self.network.is_online() {
            return Err(TransportError::Offline);
        }

        let url = self.endpoint(&format!("api/sync/{}/batch", kind.as_str()))?;
        debug!(%url, batch_size = items.len(), "uploading batch");

        let response = self
            .send(self.client.post(url).json(&UploadRequest { items: &items }))
            .await?;
        response
            .json::<UploadResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn download_reference_data(
        &self,
        scope_id: String,
    ) -> Result<ReferenceData, TransportError> {
        if !self.network.is_online() {
            return Err(TransportError::Offline);
        }

        let url = self.endpoint(&format!("api/reference/{scope_id}"))?;
        debug!(%url, "downloading reference data");

        let response = self.send(self.client.get(url)).await?;
        response
            .json::<ReferenceData>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn check_connectivity(&self) -> bool {
        let Ok(url) = self.endpoint("api/health") else {
            return false;
        };

        match self.send(self.client.get(url)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "health check failed");
                !e.is_transient()
            }
        }
    }
}

fn classify_send_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

fn classify_status(status: StatusCode, message: String) -> TransportError {
    let code = status.as_u16();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TransportError::Server {
            status: code,
            message,
        }
    } else {
        TransportError::Rejected {
            status: code,
            message,
        }
    }
}
